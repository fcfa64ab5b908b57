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

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::model::geometry::{BoundingBox, Vector3};
use crate::model::item::{SaleState, TaskItem, TaskItemKind};
use crate::model::permissions::{
    FULL_RIGHTS, MCT_RIGHTS, PermBit, PermMask, PermissionBlock,
};

/// Whether a live object is worn by an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Unattached,
    Attached { wearer: Uuid, point: u8 },
}

/// One linked part of an object group. The part at index 0 of the group is
/// the root; child transforms are offsets from the group position.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPart {
    pub id: Uuid,
    pub creator: Uuid,
    pub owner: Uuid,
    pub last_owner: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub perms: PermissionBlock,
    pub offset: Vector3,
    pub size: Vector3,
    pub inventory: Vec<TaskItem>,
    pub temporary: bool,
    pub sale: SaleState,
    pub sale_price: i32,
}

impl ObjectPart {
    /// Fold of the current masks of everything in this part's inventory.
    #[must_use]
    pub fn inventory_effective_mask(&self) -> PermMask {
        let mut perms = FULL_RIGHTS;
        for item in &self.inventory {
            perms &= item.perms.current;
        }
        perms
    }

    /// Fold of the next-owner masks of everything in this part's inventory.
    #[must_use]
    pub fn inventory_effective_next_mask(&self) -> PermMask {
        let mut perms = FULL_RIGHTS;
        for item in &self.inventory {
            perms &= item.perms.next;
        }
        perms
    }
}

/// The mutable half of a [`SceneObject`], kept behind one mutex.
#[derive(Debug)]
pub struct ObjectState {
    /// Parts, root first. Never empty.
    pub parts: Vec<ObjectPart>,
    /// Absolute position of the root part.
    pub position: Vector3,
    pub attachment: AttachmentState,
    /// Anti-recursion depth of this group, synced across parts.
    pub generation: u8,
    /// Unix seconds this group was rezzed/created.
    pub rezzed_at: u64,
    /// Unix seconds this group last rezzed something, if ever.
    pub last_rez: Option<u64>,
    /// Folder the source item lived in when this group was rezzed.
    pub rezzed_from_folder: Option<Uuid>,
    /// Inventory item this group can be saved back over.
    pub from_item: Option<Uuid>,
    /// Unsaved changes since the last persist.
    pub changed: bool,
    /// Permissions were forcibly narrowed when this group was rezzed.
    pub slam_applied: bool,
    /// Region-local numeric handle, 0 until inserted into a scene.
    pub local_handle: u32,
}

/// A live object group in the scene. Shared as `Arc<SceneObject>`; the
/// de-rez guard is a lock-free flag so racing triggers resolve without
/// taking the state mutex.
#[derive(Debug)]
pub struct SceneObject {
    id: Uuid,
    being_derezzed: AtomicBool,
    state: Mutex<ObjectState>,
}

impl SceneObject {
    #[must_use]
    pub fn new(id: Uuid, state: ObjectState) -> Self {
        assert!(!state.parts.is_empty(), "object group must have a root part");
        Self {
            id,
            being_derezzed: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Claim this object for an operation that will remove it from the scene.
    /// Returns false when another trigger already holds the claim; the caller
    /// must treat that as "already being handled" and back off.
    pub fn begin_derez(&self) -> bool {
        self.being_derezzed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the de-rez claim after an aborted operation.
    pub fn end_derez(&self) {
        self.being_derezzed.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_being_derezzed(&self) -> bool {
        self.being_derezzed.load(Ordering::Acquire)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ObjectState) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ObjectState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    #[must_use]
    pub fn owner(&self) -> Uuid {
        self.with_state(|s| s.parts[0].owner)
    }

    #[must_use]
    pub fn last_owner(&self) -> Uuid {
        self.with_state(|s| s.parts[0].last_owner)
    }

    #[must_use]
    pub fn group_id(&self) -> Option<Uuid> {
        self.with_state(|s| s.parts[0].group_id)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.with_state(|s| s.parts[0].name.clone())
    }

    #[must_use]
    pub fn description(&self) -> String {
        self.with_state(|s| s.parts[0].description.clone())
    }

    #[must_use]
    pub fn position(&self) -> Vector3 {
        self.with_state(|s| s.position)
    }

    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.with_state(|s| matches!(s.attachment, AttachmentState::Attached { .. }))
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.with_state(|s| s.parts[0].temporary)
    }

    /// Owned by a group rather than an individual (deeded).
    #[must_use]
    pub fn is_deeded(&self) -> bool {
        self.with_state(|s| s.parts[0].group_id == Some(s.parts[0].owner))
    }

    /// Capacity this group charges against a parcel/region budget.
    #[must_use]
    pub fn land_impact(&self) -> u32 {
        self.with_state(|s| s.parts.len() as u32)
    }

    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        self.with_state(|s| {
            BoundingBox::containing(
                s.parts
                    .iter()
                    .map(|p| (s.position + p.offset, p.size)),
            )
            .expect("object group has at least a root part")
        })
    }

    /// The rights an owner effectively holds over the whole group: the fold
    /// of every part's current mask and, transitively, everything in the
    /// embedded inventories. Move is deliberately not folded; a no-move part
    /// does not pin the group.
    #[must_use]
    pub fn effective_perms(&self) -> PermMask {
        self.with_state(|s| {
            let mut perms = FULL_RIGHTS;
            let mut owner_fold = FULL_RIGHTS;
            for part in &s.parts {
                owner_fold &= part.perms.current;
                perms &= part.inventory_effective_mask();
            }
            for bit in [PermBit::Modify, PermBit::Copy, PermBit::Transfer, PermBit::Export] {
                if !owner_fold.contains(bit) {
                    perms.clear(bit);
                }
            }
            perms
        })
    }

    /// The rights the next owner would receive, folded the same way. Export
    /// only survives when full Modify/Copy/Transfer terms survive.
    #[must_use]
    pub fn effective_next_perms(&self) -> PermMask {
        self.with_state(|s| {
            let mut perms = FULL_RIGHTS;
            let mut next_fold = FULL_RIGHTS;
            for part in &s.parts {
                next_fold &= part.perms.next;
                perms &= part.inventory_effective_next_mask();
            }
            for bit in [PermBit::Modify, PermBit::Copy, PermBit::Transfer] {
                if !next_fold.contains(bit) {
                    perms.clear(bit);
                }
            }
            if !perms.contains_all(MCT_RIGHTS) {
                perms.clear(PermBit::Export);
            }
            perms
        })
    }

    /// The permission block a new inventory item capturing this group should
    /// carry. Folded item perms are narrowed by the next-owner mask when the
    /// capture is headed to a different owner and propagation is on.
    #[must_use]
    pub fn new_item_permissions(&self, inventory_owner: Uuid, propagate: bool) -> PermissionBlock {
        let eperms = self.effective_perms();
        let nperms = self.effective_next_perms();
        self.with_state(|s| {
            let root = &s.parts[0].perms;
            if inventory_owner != s.parts[0].owner && propagate {
                PermissionBlock::with_masks(
                    eperms & root.next,
                    eperms & nperms,
                    PermMask::new(),
                    PermMask::new(),
                    eperms & nperms,
                )
            } else {
                PermissionBlock::with_masks(
                    eperms,
                    eperms,
                    eperms & root.group,
                    eperms & root.everyone,
                    eperms & nperms,
                )
            }
        })
    }

    /// Narrow every part (and embedded inventory) for an ownership change.
    pub fn apply_next_owner_permissions(&self) {
        let effective_next = self.effective_next_perms();
        self.with_state_mut(|s| {
            for part in &mut s.parts {
                part.perms = part.perms.applied_next_owner(effective_next);
                for item in &mut part.inventory {
                    let is_object = item.kind == TaskItemKind::Object;
                    let (derived, _) = item.perms.derive_transfer_block(true, true, is_object);
                    item.perms = derived;
                }
            }
        });
    }

    /// Re-derive child-part masks from the root, repairing pre-fix link
    /// drift.
    pub fn sync_child_perms_with_root(&self) {
        self.with_state_mut(|s| {
            let root = s.parts[0].perms;
            for part in &mut s.parts[1..] {
                part.perms = part.perms.synced_with_root(&root);
            }
        });
    }

    /// Fix locked bits, sale status and runtime grants when rezzing or
    /// transferring. Returns whether ownership actually changed.
    pub fn rationalize(&self, item_owner: Uuid) -> bool {
        self.with_state_mut(|s| {
            let mut owner_changed = false;
            for part in &mut s.parts {
                // The fake "locked" bit only applies to the current owner;
                // base always allows Move so an unlock is possible.
                part.perms.base.set(PermBit::Move);
                if part.owner != item_owner {
                    part.sale = SaleState::Not;
                    part.sale_price = 10;
                    part.perms.current.set(PermBit::Move);
                    owner_changed = true;
                    for item in &mut part.inventory {
                        item.revoke_grants();
                    }
                }
            }
            owner_changed
        })
    }

    /// Hand every part to `new_owner`, recording the previous owner.
    /// Returns whether any part actually changed hands.
    pub fn transfer_ownership(&self, new_owner: Uuid) -> bool {
        self.with_state_mut(|s| {
            let mut changed = false;
            for part in &mut s.parts {
                if part.owner != new_owner {
                    part.last_owner = part.owner;
                    part.owner = new_owner;
                    for item in &mut part.inventory {
                        item.owner = new_owner;
                    }
                    changed = true;
                }
            }
            changed
        })
    }

    /// Re-validate the root part's masks against the basemask rules.
    pub fn trim_permissions(&self) {
        self.with_state_mut(|s| {
            let root = &mut s.parts[0];
            root.perms = root.perms.trimmed(root.creator == root.owner);
        });
    }

    pub fn set_generation(&self, generation: u8) {
        self.with_state_mut(|s| s.generation = generation);
    }

    pub fn stamp_last_rez(&self, now: u64) {
        self.with_state_mut(|s| s.last_rez = Some(now));
    }

    pub fn set_group(&self, group: Option<Uuid>) {
        self.with_state_mut(|s| {
            for part in &mut s.parts {
                part.group_id = group;
            }
        });
    }

    #[must_use]
    pub fn find_task_item(&self, item_id: Uuid) -> Option<TaskItem> {
        self.with_state(|s| {
            s.parts
                .iter()
                .flat_map(|p| p.inventory.iter())
                .find(|i| i.id == item_id)
                .cloned()
        })
    }

    /// Remove a task inventory entry, returning it if present.
    pub fn remove_task_item(&self, item_id: Uuid) -> Option<TaskItem> {
        self.with_state_mut(|s| {
            for part in &mut s.parts {
                if let Some(idx) = part.inventory.iter().position(|i| i.id == item_id) {
                    return Some(part.inventory.remove(idx));
                }
            }
            None
        })
    }
}
