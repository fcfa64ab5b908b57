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

//! De-rez resolution: taking, deleting, returning and saving live objects
//! into inventory. One decision per invocation, no state between calls; the
//! only cross-call artifact is the per-object "being de-rezzed" claim that
//! keeps racing triggers from double-processing a group.

use std::sync::Arc;

use strum::Display;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rezport_common::events::WorldEvent;
use rezport_common::model::{
    ActorSession, Folder, FolderKind, InventoryItem, PermBit, PermissionBlock, SceneObject,
    TransferError,
};

use crate::packager::{self, PackFlags};
use crate::world::{WorldHandles, unix_now};

/// A de-rez request as the client protocol expresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeRezAction {
    Take,
    TakeCopy,
    GodTakeCopy,
    Delete,
    Return,
    SaveToExistingUserInventoryItem,
}

/// The effect a de-rez has on the live scene and inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeRezResult {
    None,
    Take,
    Delete,
    Both,
}

/// What each action is supposed to achieve. The resolver refuses any batch
/// where the permitted effect falls short of this.
#[must_use]
pub fn intended_result(action: DeRezAction) -> DeRezResult {
    match action {
        DeRezAction::SaveToExistingUserInventoryItem => DeRezResult::Take,
        DeRezAction::TakeCopy => DeRezResult::Take,
        DeRezAction::GodTakeCopy => DeRezResult::Take,
        DeRezAction::Take => DeRezResult::Both,
        DeRezAction::Delete => DeRezResult::Both,
        DeRezAction::Return => DeRezResult::Both,
    }
}

pub struct DeRezResolver {
    world: WorldHandles,
}

impl DeRezResolver {
    #[must_use]
    pub fn new(world: WorldHandles) -> Self {
        Self { world }
    }

    /// De-rez a single object.
    pub fn derez_object(
        &self,
        session: Option<&dyn ActorSession>,
        handle: u32,
        action: DeRezAction,
        preferred_folder: Option<Uuid>,
    ) -> Result<usize, TransferError> {
        self.derez_objects(session, &[handle], action, preferred_folder)
    }

    /// De-rez a batch of objects as one logical unit. Permission checks are
    /// all-or-nothing: one failing object aborts the whole batch with every
    /// provisional claim rolled back. Returns how many objects were
    /// processed.
    pub fn derez_objects(
        &self,
        session: Option<&dyn ActorSession>,
        handles: &[u32],
        action: DeRezAction,
        preferred_folder: Option<Uuid>,
    ) -> Result<usize, TransferError> {
        let intended = intended_result(action);
        let mut groups: Vec<Arc<SceneObject>> = Vec::new();
        let mut report_missing = true;

        if let Some(session) = session {
            for &handle in handles {
                let Some(grp) = self.group_for_derez(handle) else {
                    self.release_claims(&groups);
                    return Ok(0);
                };
                // None of this applies to worn objects.
                if grp.is_attachment() {
                    continue;
                }
                if self.find_derez_permissions(session, &grp, action) != intended {
                    session.alert(&format!("Insufficient permissions on '{}'.", grp.name()));
                    self.release_claims(&groups);
                    return Err(TransferError::PermissionDenied(grp.name()));
                }
                if !self.claim_if_derez_ok(intended, &grp, &mut groups) {
                    session.alert(&format!(
                        "Could not take/remove '{}', operation aborted.",
                        grp.name()
                    ));
                    self.release_claims(&groups);
                    return Ok(0);
                }
            }
        } else {
            // Parcel auto-return and other internal sweeps arrive with no
            // actor; the policy decision was already made by the sweep.
            for &handle in handles {
                let Some(grp) = self.group_for_derez(handle) else {
                    continue;
                };
                if grp.is_attachment() {
                    continue;
                }
                if !self.claim_if_derez_ok(intended, &grp, &mut groups) {
                    // A concurrent trigger is already handling this object.
                    report_missing = false;
                    continue;
                }
            }
        }

        if groups.is_empty() {
            if report_missing {
                error!(action = %action, "no groups found to derez after scene search");
            }
            return Ok(0);
        }

        let count = groups.len();
        match self.delete_to_inventory(session, action, preferred_folder, &groups) {
            Ok(packaged) => {
                if intended == DeRezResult::Both {
                    for grp in &packaged {
                        self.remove_from_scene(grp);
                    }
                } else if action == DeRezAction::TakeCopy
                    && !self.world.policy.bypass_permissions()
                {
                    // Copy-absent consumption: taking a "copy" of a no-copy
                    // object takes the object. Attachments are exempt; they
                    // would be silently destroyed.
                    for grp in &packaged {
                        if !grp.effective_perms().contains(PermBit::Copy)
                            && !grp.is_attachment()
                            && grp.begin_derez()
                        {
                            self.remove_from_scene(grp);
                        }
                    }
                }
                // Objects claimed but still present (e.g. a return that could
                // not resolve its owner) get their claim released.
                for grp in &groups {
                    if self.world.scene.object_by_id(grp.id()).is_some() {
                        grp.end_derez();
                    }
                }
                Ok(count)
            }
            Err(e) => {
                // Nothing was removed; roll every claim back so a retry can
                // succeed.
                self.release_claims(&groups);
                Err(e)
            }
        }
    }

    /// The parcel auto-return entry point: notices are recorded per object,
    /// then the whole set funnels through the normal Return machinery with
    /// no actor.
    pub fn return_objects(
        &self,
        objects: &[Arc<SceneObject>],
        reason: &str,
    ) -> Result<usize, TransferError> {
        let mut handles = Vec::with_capacity(objects.len());
        for grp in objects {
            let notify = if grp.is_deeded() {
                grp.last_owner()
            } else {
                grp.owner()
            };
            self.world.events.publish(&WorldEvent::ReturnNotice {
                owner: notify,
                object_name: grp.name(),
                position: grp.position(),
                reason: reason.to_string(),
            });
            handles.push(grp.with_state(|s| s.local_handle));
        }
        self.derez_objects(None, &handles, DeRezAction::Return, None)
    }

    /// Resolve a handle to a group eligible for de-rez.
    fn group_for_derez(&self, handle: u32) -> Option<Arc<SceneObject>> {
        self.world.scene.object_by_handle(handle)
    }

    /// What this actor is actually permitted to do to this object under
    /// `action`. `Return` records a parcel-owner-return notice as a side
    /// effect when permitted.
    fn find_derez_permissions(
        &self,
        session: &dyn ActorSession,
        grp: &SceneObject,
        action: DeRezAction,
    ) -> DeRezResult {
        let actor = session.actor();
        let (permission_to_take, permission_to_delete) = match action {
            DeRezAction::SaveToExistingUserInventoryItem => {
                let ok = grp.owner() == actor && grp.with_state(|s| s.from_item).is_some();
                (ok, false)
            }
            DeRezAction::TakeCopy => (self.world.policy.can_take_copy_object(grp, actor), false),
            DeRezAction::GodTakeCopy => (self.world.policy.is_god(actor), false),
            DeRezAction::Take => {
                let take = self.world.policy.can_take_object(grp, actor);
                // If they can take, they can delete.
                (take, take)
            }
            DeRezAction::Delete => {
                let delete = self.world.policy.can_delete_object(grp, actor);
                (delete, delete)
            }
            DeRezAction::Return => {
                let ok = self.world.policy.can_return_object(grp, actor);
                if ok {
                    let notify = if grp.is_deeded() {
                        grp.last_owner()
                    } else {
                        grp.owner()
                    };
                    self.world.events.publish(&WorldEvent::ReturnNotice {
                        owner: notify,
                        object_name: grp.name(),
                        position: grp.position(),
                        reason: "parcel owner return".to_string(),
                    });
                }
                (ok, ok)
            }
        };

        match (permission_to_take, permission_to_delete) {
            (true, true) => DeRezResult::Both,
            (true, false) => DeRezResult::Take,
            (false, true) => DeRezResult::Delete,
            (false, false) => DeRezResult::None,
        }
    }

    /// Claim the group for removal when the intended result implies one.
    /// Returns false when another trigger already holds the claim.
    fn claim_if_derez_ok(
        &self,
        intended: DeRezResult,
        grp: &Arc<SceneObject>,
        groups: &mut Vec<Arc<SceneObject>>,
    ) -> bool {
        if matches!(intended, DeRezResult::Both | DeRezResult::Delete) && !grp.begin_derez() {
            return false;
        }
        groups.push(grp.clone());
        true
    }

    fn release_claims(&self, groups: &[Arc<SceneObject>]) {
        for grp in groups {
            grp.end_derez();
        }
    }

    /// Dispatch to the outcome handler for `action`. Returns the groups that
    /// were actually packaged and are therefore eligible for removal.
    fn delete_to_inventory(
        &self,
        session: Option<&dyn ActorSession>,
        action: DeRezAction,
        preferred_folder: Option<Uuid>,
        groups: &[Arc<SceneObject>],
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let actor = session
            .map(|s| s.actor().to_string())
            .unwrap_or_else(|| "(unknown/internal)".to_string());
        info!(
            action = %action,
            actor = %actor,
            count = groups.len(),
            "about to derez groups"
        );

        match action {
            DeRezAction::Delete => self.perform_inventory_delete(session, groups),
            DeRezAction::Return => self.perform_inventory_return(session, groups),
            DeRezAction::GodTakeCopy => self.perform_god_take_copy(session, groups),
            DeRezAction::SaveToExistingUserInventoryItem => {
                self.perform_save_to_existing(session, groups)
            }
            DeRezAction::Take => self.perform_take(session, preferred_folder, groups, true),
            DeRezAction::TakeCopy => self.perform_take(session, preferred_folder, groups, false),
        }
    }

    /// Group the batch by the individual user who should receive the
    /// packaged items. Deeded objects resolve through their last individual
    /// owner; unresolvable owners fall back to the acting user when there is
    /// one, otherwise the object is dropped from the grouping (logged, and
    /// left in the scene by the caller).
    fn collect_by_owner(
        &self,
        groups: &[Arc<SceneObject>],
        session: Option<&dyn ActorSession>,
    ) -> Result<Vec<(Uuid, Vec<Arc<SceneObject>>)>, TransferError> {
        let mut owners: Vec<(Uuid, Vec<Arc<SceneObject>>)> = Vec::new();
        for grp in groups {
            let owner = grp.owner();
            let resolved = if !grp.is_deeded() && self.world.inventory.account_exists(owner)? {
                Some(owner)
            } else {
                let last = grp.last_owner();
                if self.world.inventory.account_exists(last)? {
                    // Normal path for a group-deeded object.
                    Some(last)
                } else if let Some(session) = session {
                    warn!(
                        last_owner = %last,
                        object = %grp.id(),
                        name = %grp.name(),
                        "owner not found for object, sending to acting user instead"
                    );
                    Some(session.actor())
                } else {
                    warn!(
                        last_owner = %last,
                        object = %grp.id(),
                        name = %grp.name(),
                        "owner not found for object and no client requesting; skipping"
                    );
                    None
                }
            };
            if let Some(resolved) = resolved {
                match owners.iter_mut().find(|(o, _)| *o == resolved) {
                    Some((_, list)) => list.push(grp.clone()),
                    None => owners.push((resolved, vec![grp.clone()])),
                }
            }
        }
        Ok(owners)
    }

    /// Delete: the actor's own objects go to their Trash, anything they
    /// deleted on behalf of someone else goes to the true owner's Lost and
    /// Found. Scripts are stopped in the payload.
    fn perform_inventory_delete(
        &self,
        session: Option<&dyn ActorSession>,
        groups: &[Arc<SceneObject>],
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let actor = session.map(|s| s.actor());
        for (owner, batch) in self.collect_by_owner(groups, session)? {
            let kind = if actor == Some(owner) {
                FolderKind::Trash
            } else {
                FolderKind::LostAndFound
            };
            let folder = self
                .world
                .inventory
                .folder_for_kind(owner, kind)?
                .ok_or_else(|| TransferError::NotFound(format!("{kind} folder for {owner}")))?;
            self.copy_items_to_folder(owner, folder.id, &batch, session, true)?;
        }
        Ok(groups.to_vec())
    }

    /// Return: every object goes, individually, to its resolved owner's Lost
    /// and Found. A missing destination is a per-object failure: logged,
    /// skipped, and the sibling objects still proceed.
    fn perform_inventory_return(
        &self,
        session: Option<&dyn ActorSession>,
        groups: &[Arc<SceneObject>],
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let mut packaged = Vec::new();
        for (owner, batch) in self.collect_by_owner(groups, session)? {
            for grp in batch {
                let folder = match self
                    .world
                    .inventory
                    .folder_for_kind(owner, FolderKind::LostAndFound)
                {
                    Ok(Some(folder)) => folder,
                    Ok(None) => {
                        error!(
                            owner = %owner,
                            object = %grp.id(),
                            name = %grp.name(),
                            "return failed: no Lost and Found for owner; leaving object in scene"
                        );
                        continue;
                    }
                    // A storage failure must abort before anything is
                    // removed from the scene.
                    Err(e) => return Err(e),
                };
                self.copy_items_to_folder(
                    owner,
                    folder.id,
                    std::slice::from_ref(&grp),
                    session,
                    true,
                )?;
                packaged.push(grp);
            }
        }
        Ok(packaged)
    }

    /// GodTakeCopy: a privileged copy into the acting user's Objects folder.
    /// Ownership is untouched and scripts keep running.
    fn perform_god_take_copy(
        &self,
        session: Option<&dyn ActorSession>,
        groups: &[Arc<SceneObject>],
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let session = session.ok_or_else(|| {
            TransferError::PermissionDenied("god take requires an acting user".to_string())
        })?;
        let actor = session.actor();
        let folder = self
            .world
            .inventory
            .folder_for_kind(actor, FolderKind::Objects)?
            .ok_or_else(|| TransferError::NotFound(format!("Objects folder for {actor}")))?;
        for (_, batch) in self.collect_by_owner(groups, Some(session))? {
            self.copy_items_to_folder(actor, folder.id, &batch, Some(session), false)?;
        }
        Ok(groups.to_vec())
    }

    /// Save over the inventory item the object was rezzed from, leaving the
    /// object in the scene.
    fn perform_save_to_existing(
        &self,
        session: Option<&dyn ActorSession>,
        groups: &[Arc<SceneObject>],
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let session = session.ok_or_else(|| {
            TransferError::PermissionDenied("save to inventory requires an acting user".to_string())
        })?;
        for grp in groups {
            let Some(item_id) = grp.with_state(|s| s.from_item) else {
                debug!(object = %grp.id(), "object has no originating item; skipping save");
                continue;
            };
            let Some(mut item) = self.world.inventory.find_item(session.actor(), item_id)? else {
                debug!(
                    object = %grp.id(),
                    name = %grp.name(),
                    "object scheduled for save to inventory does not exist"
                );
                continue;
            };
            let bytes = packager::serialize_object(grp, PackFlags { stop_scripts: true })?;
            let asset_id = match self.world.assets.add_asset(bytes) {
                Ok(id) => id,
                Err(e) => {
                    session.alert("Unable to create asset. Please try again later.");
                    return Err(e);
                }
            };
            item.asset_id = asset_id;
            self.world.inventory.update_item(&item)?;
            session.notify_item_created(&item);
        }
        Ok(Vec::new())
    }

    /// Take/TakeCopy: resolve the destination folder by priority, then
    /// package the whole selection into it as one item.
    fn perform_take(
        &self,
        session: Option<&dyn ActorSession>,
        preferred_folder: Option<Uuid>,
        groups: &[Arc<SceneObject>],
        stop_scripts: bool,
    ) -> Result<Vec<Arc<SceneObject>>, TransferError> {
        let session = session.ok_or_else(|| {
            TransferError::PermissionDenied("take requires an acting user".to_string())
        })?;
        let actor = session.actor();

        let mut folder: Option<Folder> = None;

        // A sole selected object the actor owns can go back into the folder
        // it was rezzed from, if that folder still exists outside Trash.
        if groups.len() == 1 && groups[0].owner() == actor {
            if let Some(origin) = groups[0].with_state(|s| s.rezzed_from_folder) {
                folder = self.folder_if_valid_and_not_in_trash(actor, origin);
            }
        }

        if folder.is_none()
            && let Some(preferred) = preferred_folder
        {
            folder = self.folder_if_valid_and_not_in_trash(actor, preferred);
        }

        if folder.is_none() {
            folder = match self.world.inventory.folder_for_kind(actor, FolderKind::Objects) {
                Ok(found) => found,
                Err(e) => {
                    error!(actor = %actor, error = %e, "could not find objects folder");
                    None
                }
            };
        }

        if folder.is_none() {
            folder = match self.world.inventory.folder_for_kind(actor, FolderKind::Root) {
                Ok(found) => found,
                Err(e) => {
                    error!(actor = %actor, error = %e, "could not find root folder");
                    None
                }
            };
        }

        let Some(folder) = folder else {
            error!(actor = %actor, "root folder not found, can not take item");
            return Err(TransferError::NotFound(format!("root folder for {actor}")));
        };

        self.copy_items_to_folder(actor, folder.id, groups, Some(session), stop_scripts)?;
        Ok(groups.to_vec())
    }

    /// A folder usable as a take destination: it must exist, belong to
    /// `owner`, and not hang under their Trash.
    fn folder_if_valid_and_not_in_trash(&self, owner: Uuid, folder_id: Uuid) -> Option<Folder> {
        let folder = match self.world.inventory.find_folder(owner, folder_id) {
            Ok(Some(folder)) if folder.owner == owner => folder,
            Ok(_) => return None,
            Err(e) => {
                info!(folder = %folder_id, error = %e, "unable to check folder");
                return None;
            }
        };
        match self.world.inventory.top_level_ancestor(owner, folder.id) {
            Ok(Some(top)) if top.kind != FolderKind::Trash => Some(folder),
            Ok(Some(_)) => None,
            Ok(None) => Some(folder),
            Err(e) => {
                info!(folder = %folder_id, error = %e, "unable to check folder hierarchy");
                None
            }
        }
    }

    /// Package one or many groups into a folder as a single inventory item.
    /// The multi-group path serializes coalesced, with per-member permission
    /// blocks and the collapsed minimum on the item itself.
    fn copy_items_to_folder(
        &self,
        inventory_owner: Uuid,
        folder: Uuid,
        groups: &[Arc<SceneObject>],
        session: Option<&dyn ActorSession>,
        stop_scripts: bool,
    ) -> Result<(), TransferError> {
        if groups.is_empty() {
            return Err(TransferError::InternalInvariantViolation(
                "given 0 items to copy".to_string(),
            ));
        }

        let flags = PackFlags { stop_scripts };
        if stop_scripts {
            for grp in groups {
                self.world.scripts.stop_scripts(grp);
            }
        }

        let propagate = self.world.policy.propagate_permissions();
        let (bytes, perms, coalesced) = if groups.len() == 1 {
            let perms = groups[0].new_item_permissions(inventory_owner, propagate);
            (packager::serialize_object(&groups[0], flags)?, perms, false)
        } else {
            let blocks: Vec<PermissionBlock> = groups
                .iter()
                .map(|g| g.new_item_permissions(inventory_owner, propagate))
                .collect();
            let pairs: Vec<(&SceneObject, PermissionBlock)> = groups
                .iter()
                .zip(blocks.iter())
                .map(|(g, b)| (g.as_ref(), *b))
                .collect();
            let bytes = packager::serialize_coalesced(&pairs, flags)?;
            (bytes, PermissionBlock::coalesced_minimum(blocks.iter()), true)
        };

        // A failure storing the asset must surface before anything leaves
        // the scene.
        let asset_id = match self.world.assets.add_asset(bytes) {
            Ok(id) => id,
            Err(e) => {
                if let Some(session) = session {
                    session.alert("Unable to create asset. Please try again later.");
                }
                return Err(e);
            }
        };

        let model = &groups[0];
        let creator = model.with_state(|s| s.parts[0].creator);
        let mut item = InventoryItem::new_object(
            inventory_owner,
            creator,
            folder,
            asset_id,
            model.name(),
            model.description(),
            perms,
            unix_now(),
        );
        item.coalesced = coalesced;
        self.world.inventory.add_item(&item)?;

        if let Some(session) = session
            && session.actor() == item.owner
        {
            session.notify_item_created(&item);
        }
        Ok(())
    }

    /// Remove a packaged group from the live scene. A removal failure after
    /// successful packaging is an internal invariant violation: logged, and
    /// only this object's processing halts.
    fn remove_from_scene(&self, grp: &Arc<SceneObject>) {
        self.world.scripts.remove_script_instances(grp);
        let owner = grp.owner();
        match self.world.scene.remove_object(grp.id()) {
            Ok(()) => {
                self.world.events.publish(&WorldEvent::ObjectRemoved {
                    object: grp.id(),
                    owner,
                });
            }
            Err(e) => {
                error!(
                    object = %grp.id(),
                    error = %e,
                    "could not remove object after packaging; halting this object only"
                );
            }
        }
    }
}
