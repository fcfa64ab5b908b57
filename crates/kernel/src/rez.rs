// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The rez engine: reconstructing live objects from inventory assets,
//! applying ownership/permission transfer, resolving a legal placement, and
//! consuming one-shot sources. The inverse of the de-rez resolver.

use std::sync::Arc;

use tracing::{error, warn};
use uuid::Uuid;

use rezport_common::events::WorldEvent;
use rezport_common::model::{
    ActorSession, AttachmentState, BoundingBox, InventoryItem, Parcel, PermBit, PermMask,
    PermissionBlock, SceneObject, TaskItem, TransferError, Vector3,
};

use crate::fence::{self, FenceSettings, RezSourceState};
use crate::packager::{self, RezPayload};
use crate::world::{WorldHandles, unix_now};

/// Where the caller wants the object. Scripts pass an explicit position;
/// client rezzes arrive as a pick ray whose end is the intended drop point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlacementHint {
    Explicit(Vector3),
    Ray { start: Vector3, end: Vector3 },
}

impl PlacementHint {
    fn target(&self) -> Vector3 {
        match *self {
            PlacementHint::Explicit(pos) => pos,
            PlacementHint::Ray { end, .. } => end,
        }
    }
}

/// The item-side fields a rez carries along, common to avatar inventory
/// items, task inventory items, and coalesced members (which override the
/// permission block per member).
#[derive(Debug, Clone)]
struct ItemContext {
    item_id: Uuid,
    owner: Uuid,
    name: String,
    description: String,
    folder: Option<Uuid>,
    perms: PermissionBlock,
    /// Set when the live object should link back to its source item for
    /// later save-in-place.
    from_item_link: Option<Uuid>,
}

impl ItemContext {
    fn from_inventory_item(item: &InventoryItem, link_back: bool) -> Self {
        Self {
            item_id: item.id,
            owner: item.owner,
            name: item.name.clone(),
            description: item.description.clone(),
            folder: Some(item.folder),
            perms: item.perms,
            from_item_link: link_back.then_some(item.id),
        }
    }

    fn from_task_item(item: &TaskItem) -> Self {
        Self {
            item_id: item.id,
            owner: item.owner,
            name: item.name.clone(),
            description: item.description.clone(),
            folder: None,
            perms: item.perms,
            from_item_link: None,
        }
    }
}

pub struct RezEngine {
    world: WorldHandles,
    fence: FenceSettings,
}

impl RezEngine {
    #[must_use]
    pub fn new(world: WorldHandles, fence: FenceSettings) -> Self {
        Self { world, fence }
    }

    /// Rez an object from the acting user's inventory. Returns the placed
    /// group(s); coalesced items produce several. On any failure the source
    /// item is left intact.
    pub fn rez_from_inventory(
        &self,
        session: &dyn ActorSession,
        item_id: Uuid,
        placement: PlacementHint,
        deed_group: Option<Uuid>,
        start_param: i32,
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let item = self
            .world
            .inventory
            .find_item(session.actor(), item_id)?
            .ok_or_else(|| TransferError::NotFound(format!("inventory item {item_id}")))?;

        let result = self.rez_item_payload(session, &item, Some(placement), deed_group, start_param);
        match result {
            Ok(groups) => {
                self.consume_one_shot_source(session, &item, false)?;
                Ok(groups)
            }
            Err(e) => {
                // The viewer optimistically removes no-copy items on a rez
                // attempt; on failure tell it the item is still there.
                session.notify_item_created(&item);
                Err(e)
            }
        }
    }

    /// Rez an object back at the position stored in its asset, rather than
    /// at a pick ray.
    pub fn restore_object(
        &self,
        session: &dyn ActorSession,
        item_id: Uuid,
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let item = self
            .world
            .inventory
            .find_item(session.actor(), item_id)?
            .ok_or_else(|| TransferError::NotFound(format!("inventory item {item_id}")))?;

        let result = self.rez_item_payload(session, &item, None, None, 0);
        match result {
            Ok(groups) => {
                self.consume_one_shot_source(session, &item, false)?;
                Ok(groups)
            }
            Err(e) => {
                session.notify_item_created(&item);
                Err(e)
            }
        }
    }

    /// Rez from a scene object's embedded inventory: the script-driven path,
    /// and the only one the grey-goo fence applies to.
    pub fn rez_from_task_inventory(
        &self,
        source: &Arc<SceneObject>,
        item_id: Uuid,
        pos: Vector3,
        rez_at_root: bool,
        start_param: i32,
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let item = source
            .find_task_item(item_id)
            .ok_or_else(|| TransferError::NotFound(format!("task inventory item {item_id}")))?;

        let Some(bytes) = self.world.assets.get_asset(item.asset_id)? else {
            error!(
                asset = %item.asset_id,
                item = %item.name,
                source = %source.id(),
                "rez could not fetch asset for task inventory item"
            );
            return Err(TransferError::NotFound(format!("asset {}", item.asset_id)));
        };
        let payload = packager::deserialize(&bytes)?;

        let (snapshots, blocks): (Vec<_>, Vec<_>) = match payload {
            RezPayload::Single(snap) => (vec![snap], vec![item.perms]),
            RezPayload::Coalesced(members) => members.into_iter().unzip(),
        };

        // Land checks run against the whole incoming set before anything is
        // placed. A coalesced set is temporary only if every member is.
        let total_impact: u32 = snapshots.iter().map(|s| s.land_impact()).sum();
        let is_temp = snapshots.iter().all(|s| s.is_temporary());

        let parcel = self.parcel_at_or_unresolved(pos)?;
        if !self
            .world
            .policy
            .can_rez_object(0, item.owner, Some(source.id()), pos, is_temp)
        {
            return Err(TransferError::PermissionDenied(
                "the owner of this land parcel does not allow it".to_string(),
            ));
        }
        self.check_capacity(&parcel, total_impact)?;

        let now = unix_now();
        let allow_cooldown = self
            .world
            .policy
            .allow_fence_cooldown(source.owner(), source.is_temporary());

        let mut placed = Vec::with_capacity(snapshots.len());
        let set_center = if snapshots.len() > 1 {
            BoundingBox::containing(snapshots.iter().map(|s| {
                // Approximate each member by its root part footprint for
                // anchoring; exact extents are recomputed after placement.
                (s.position, s.parts[0].size)
            }))
            .map(|bb| bb.center())
        } else {
            None
        };

        for (snap, block) in snapshots.into_iter().zip(blocks.into_iter()) {
            // Every member of the set runs the fence; the source decays at
            // most once but each child pays the generation toll.
            let source_state = source.with_state(|s| RezSourceState {
                generation: s.generation,
                rezzed_at: s.rezzed_at,
                last_rez: s.last_rez,
            });
            let outcome = fence::check_and_stamp(&self.fence, source_state, allow_cooldown, now);
            source.set_generation(outcome.source_generation);
            if !outcome.allowed {
                return Err(TransferError::FenceExceeded);
            }

            let snap_position = snap.position;
            let object = packager::instantiate(snap, now);
            object.set_generation(outcome.child_generation);
            source.stamp_last_rez(now);

            let mut actual = pos;
            if let Some(center) = set_center {
                actual += snap_position - center;
            } else if !rez_at_root {
                let correction = object.position() - object.bounding_box().center();
                actual += correction;
            }

            let mut ctx = ItemContext::from_task_item(&item);
            ctx.perms = block;
            let group = self.rez_single_to_world(
                None,
                &ctx,
                object,
                actual,
                None,
                source.group_id(),
                Some(source.id()),
                start_param,
            )?;
            placed.push(group);
        }

        if !self.world.policy.bypass_permissions() && !item.perms.current.contains(PermBit::Copy) {
            source.remove_task_item(item.id);
        }

        Ok(placed)
    }

    /// Rez an inventory item as a worn attachment. No land or parcel checks
    /// apply; the object is associated with the wearer instead of a parcel.
    pub(crate) fn rez_attachment(
        &self,
        session: &dyn ActorSession,
        item: &InventoryItem,
        wearer: Uuid,
        point: u8,
    ) -> Result<Arc<SceneObject>, TransferError> {
        let Some(bytes) = self.world.assets.get_asset(item.asset_id)? else {
            return Err(TransferError::NotFound(format!("asset {}", item.asset_id)));
        };
        let payload = packager::deserialize(&bytes)?;
        let RezPayload::Single(snap) = payload else {
            return Err(TransferError::PermissionDenied(
                "coalesced objects cannot be worn".to_string(),
            ));
        };

        // Prefer the attach point the object was last worn at.
        let point = if snap.attachment_point != 0 && point == 0 {
            snap.attachment_point
        } else {
            point
        };
        let position = snap.position;
        let object = packager::instantiate(snap, unix_now());
        let ctx = ItemContext::from_inventory_item(item, true);
        self.rez_single_to_world(
            Some(session),
            &ctx,
            object,
            position,
            Some((wearer, point)),
            None,
            None,
            0,
        )
    }

    fn rez_item_payload(
        &self,
        session: &dyn ActorSession,
        item: &InventoryItem,
        placement: Option<PlacementHint>,
        deed_group: Option<Uuid>,
        start_param: i32,
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let Some(bytes) = self.world.assets.get_asset(item.asset_id)? else {
            return Err(TransferError::NotFound(format!("asset {}", item.asset_id)));
        };
        let payload = packager::deserialize(&bytes)?;

        // Objects with copy permission link back to their source item so
        // "save object to inventory" works later.
        let link_back = self.world.policy.bypass_permissions()
            || item.perms.current.contains(PermBit::Copy);
        let ctx = ItemContext::from_inventory_item(item, link_back);
        let now = unix_now();

        match payload {
            RezPayload::Single(snap) => {
                let object = packager::instantiate(snap, now);
                // Place the drop target, lifted so the bounding box sits
                // above it rather than straddling the ground.
                let mut pos = match placement {
                    Some(hint) => hint.target(),
                    None => object.position(),
                };
                pos.z += object.position().z - object.bounding_box().center().z;
                let group = self.rez_single_to_world(
                    Some(session),
                    &ctx,
                    object,
                    pos,
                    None,
                    deed_group,
                    None,
                    start_param,
                )?;
                Ok(vec![group])
            }
            RezPayload::Coalesced(members) => {
                let objects: Vec<(SceneObject, PermissionBlock)> = members
                    .into_iter()
                    .map(|(snap, block)| (packager::instantiate(snap, now), block))
                    .collect();
                // Re-anchor the whole set around its recomputed bounding-box
                // center at the target position.
                let center = BoundingBox::containing(
                    objects
                        .iter()
                        .map(|(o, _)| (o.position(), o.bounding_box().size())),
                )
                .ok_or_else(|| {
                    TransferError::InternalInvariantViolation(
                        "coalesced payload with no members".to_string(),
                    )
                })?
                .center();
                let target = match placement {
                    Some(hint) => hint.target(),
                    None => center,
                };

                let mut placed = Vec::with_capacity(objects.len());
                for (object, block) in objects {
                    let offset = object.position() - center;
                    let mut member_ctx = ctx.clone();
                    member_ctx.perms = block;
                    let group = self.rez_single_to_world(
                        Some(session),
                        &member_ctx,
                        object,
                        target + offset,
                        None,
                        deed_group,
                        None,
                        start_param,
                    )?;
                    placed.push(group);
                }
                Ok(placed)
            }
        }
    }

    /// The single-group placement core shared by every rez path.
    #[allow(clippy::too_many_arguments)]
    fn rez_single_to_world(
        &self,
        session: Option<&dyn ActorSession>,
        ctx: &ItemContext,
        object: SceneObject,
        pos: Vector3,
        attachment: Option<(Uuid, u8)>,
        deed_group: Option<Uuid>,
        rezzed_by: Option<Uuid>,
        start_param: i32,
    ) -> Result<Arc<SceneObject>, TransferError> {
        let is_attachment = attachment.is_some();

        object.with_state_mut(|s| {
            s.rezzed_from_folder = ctx.folder;
            if is_attachment {
                s.from_item = Some(ctx.item_id);
            } else {
                s.from_item = ctx.from_item_link;
                s.position = pos;
            }
            if let Some((wearer, point)) = attachment {
                s.attachment = AttachmentState::Attached { wearer, point };
            }
            // Renaming the item in inventory does not touch the serialized
            // name; the inventory name wins at rez time.
            s.parts[0].name = ctx.name.clone();
            s.parts[0].description = ctx.description.clone();
        });

        if deed_group.is_some() {
            object.set_group(deed_group);
        }

        object.sync_child_perms_with_root();

        let propagate = self.world.policy.propagate_permissions();
        let slam = ctx.perms.slam_set();
        let previous_owner = object.owner();

        if previous_owner != ctx.owner && propagate {
            if slam {
                // Enforce the slam bit: the item's masks land on every part
                // verbatim instead of intersecting.
                self.apply_slam_masks(&object, &ctx.perms);
            }
            object.apply_next_owner_permissions();
        }

        let mut owner_changed = object.rationalize(ctx.owner);
        if object.owner() != ctx.owner {
            owner_changed |= object.transfer_ownership(ctx.owner);
        } else if slam && !is_attachment {
            self.apply_slam_masks(&object, &ctx.perms);
        }
        object.trim_permissions();

        let object = Arc::new(object);
        self.add_to_scene_if_permitted(&object, session, pos, is_attachment, rezzed_by)?;

        if owner_changed {
            self.world.events.publish(&WorldEvent::OwnershipChanged {
                object: object.id(),
                previous: previous_owner,
                owner: ctx.owner,
            });
            self.world
                .events
                .publish(&WorldEvent::ScriptChanged { object: object.id() });
        }

        if !is_attachment {
            self.world
                .scripts
                .create_script_instances(&object, start_param, true);
            self.world.events.publish(&WorldEvent::ObjectAdded {
                object: object.id(),
                owner: object.owner(),
            });
        }

        Ok(object)
    }

    fn apply_slam_masks(&self, object: &SceneObject, item_perms: &PermissionBlock) {
        object.with_state_mut(|s| {
            s.slam_applied = true;
            for part in &mut s.parts {
                part.perms.everyone = item_perms.everyone;
                part.perms.next = item_perms.next;
                // Group rights do not propagate here.
                part.perms.group = PermMask::new();
            }
        });
    }

    /// Parcel, policy, and capacity gating ahead of scene insertion.
    /// Attachments skip all of it.
    fn add_to_scene_if_permitted(
        &self,
        object: &Arc<SceneObject>,
        session: Option<&dyn ActorSession>,
        pos: Vector3,
        is_attachment: bool,
        rezzed_by: Option<Uuid>,
    ) -> Result<(), TransferError> {
        if is_attachment {
            return self.world.scene.insert_object(object.clone(), false);
        }

        let mut pos = pos;
        let mut parcel = self.world.scene.parcel_at(pos.x, pos.y);
        if parcel.is_none() {
            // Off-world drop position: clamp into the region and retry.
            let clamped = self.valid_location(pos);
            if clamped.x != pos.x || clamped.y != pos.y {
                parcel = self.world.scene.parcel_at(clamped.x, clamped.y);
                if parcel.is_some() {
                    if let Some(session) = session {
                        session.alert(&format!(
                            "Attempt to rez object '{}' moved within region.",
                            object.name()
                        ));
                    }
                    pos = clamped;
                    object.with_state_mut(|s| s.position = pos);
                }
            }
        }
        let Some(parcel) = parcel else {
            return Err(TransferError::LandUnresolved);
        };

        let temporary = object.is_temporary();
        // Pass 0 for land impact so capacity is reported separately.
        if !self.world.policy.can_rez_object(
            0,
            object.owner(),
            rezzed_by,
            pos,
            temporary,
        ) {
            return Err(TransferError::PermissionDenied(
                "the owner of this land parcel does not allow it".to_string(),
            ));
        }
        self.check_capacity(&parcel, object.land_impact())?;

        self.world.scene.insert_object(object.clone(), !temporary)
    }

    fn parcel_at_or_unresolved(&self, pos: Vector3) -> Result<Parcel, TransferError> {
        self.world
            .scene
            .parcel_at(pos.x, pos.y)
            .ok_or(TransferError::LandUnresolved)
    }

    fn check_capacity(&self, parcel: &Parcel, impact: u32) -> Result<(), TransferError> {
        if impact > parcel.remaining_capacity() {
            return Err(TransferError::LandCapacityExceeded("parcel prim".to_string()));
        }
        if impact > self.world.scene.region_capacity_remaining() {
            return Err(TransferError::LandCapacityExceeded("region prim".to_string()));
        }
        Ok(())
    }

    /// Clamp a position into the region and above the terrain.
    fn valid_location(&self, pos: Vector3) -> Vector3 {
        let (width, height) = self.world.scene.terrain_extent();
        let x = pos.x.clamp(0.0, width - 0.01);
        let y = pos.y.clamp(0.0, height - 0.01);
        let zmin = self.world.scene.terrain_height_at(x, y) + 0.01;
        Vector3::new(x, y, pos.z.max(zmin))
    }

    /// The copy-absent consumption rule: a successfully rezzed no-copy item
    /// vanishes from its source folder. Never applied to attachments, which
    /// would otherwise be lost.
    fn consume_one_shot_source(
        &self,
        session: &dyn ActorSession,
        item: &InventoryItem,
        is_attachment: bool,
    ) -> Result<(), TransferError> {
        if self.world.policy.bypass_permissions() || is_attachment {
            return Ok(());
        }
        if !item.perms.current.contains(PermBit::Copy) {
            if let Err(e) = self.world.inventory.delete_item(item.owner, item.id) {
                warn!(item = %item.id, error = %e, "could not consume no-copy source item");
                return Err(e);
            }
            session.notify_item_removed(item.id);
        }
        Ok(())
    }
}
