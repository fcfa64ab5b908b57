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

//! Inventory-to-inventory transfers: giving single items, giving whole
//! folder trees, and permission edits on held items. The slam flag
//! originates here: editing an object item's outward masks arms it so the
//! next rez forces the narrowed masks onto the live object.

use std::collections::VecDeque;

use tracing::{error, warn};
use uuid::Uuid;

use rezport_common::model::{
    ActorSession, Folder, FolderKind, InventoryItem, PermBit, PermMask, TransferError,
};

use crate::world::{WorldHandles, unix_now};

/// Give one item to another avatar. The copy lands in `dest_folder` (the
/// recipient's Objects folder when unset) with masks derived under the
/// transfer rules; a no-copy source is consumed.
pub fn give_item(
    world: &WorldHandles,
    session: &dyn ActorSession,
    recipient: Uuid,
    item_id: Uuid,
    dest_folder: Option<Uuid>,
) -> Result<InventoryItem, TransferError> {
    let sender = session.actor();
    let item = world
        .inventory
        .find_item(sender, item_id)?
        .ok_or_else(|| TransferError::NotFound(format!("inventory item {item_id}")))?;

    if !world.policy.bypass_permissions() && !item.perms.current.contains(PermBit::Transfer) {
        return Err(TransferError::PermissionDenied(format!(
            "'{}' is not transferable",
            item.name
        )));
    }

    let folder = match dest_folder {
        Some(folder) => folder,
        None => {
            world
                .inventory
                .folder_for_kind(recipient, FolderKind::Objects)?
                .ok_or_else(|| {
                    TransferError::NotFound(format!("Objects folder for {recipient}"))
                })?
                .id
        }
    };

    deliver_item(world, session, recipient, &item, folder)
}

/// Give a whole folder tree. Reimplemented as an explicit worklist so deep
/// hierarchies cannot exhaust the call stack; parents are always created
/// before their children. Untransferable items inside the tree are skipped
/// with a log line rather than aborting the give.
pub fn give_folder(
    world: &WorldHandles,
    session: &dyn ActorSession,
    recipient: Uuid,
    folder_id: Uuid,
    dest_parent: Option<Uuid>,
) -> Result<Folder, TransferError> {
    let sender = session.actor();
    let source_root = world
        .inventory
        .find_folder(sender, folder_id)?
        .ok_or_else(|| TransferError::NotFound(format!("folder {folder_id}")))?;

    let dest_parent = match dest_parent {
        Some(parent) => parent,
        None => {
            world
                .inventory
                .folder_for_kind(recipient, FolderKind::Root)?
                .ok_or_else(|| TransferError::NotFound(format!("root folder for {recipient}")))?
                .id
        }
    };

    let mut created_root: Option<Folder> = None;
    let mut worklist: VecDeque<(Folder, Uuid)> = VecDeque::new();
    worklist.push_back((source_root, dest_parent));

    while let Some((src, parent)) = worklist.pop_front() {
        let dest = Folder {
            id: Uuid::new_v4(),
            owner: recipient,
            kind: FolderKind::Other,
            parent: Some(parent),
            name: src.name.clone(),
        };
        world.inventory.create_folder(&dest)?;
        if created_root.is_none() {
            created_root = Some(dest.clone());
        }

        for item in world.inventory.items_in(sender, src.id)? {
            if !world.policy.bypass_permissions()
                && !item.perms.current.contains(PermBit::Transfer)
            {
                warn!(
                    item = %item.id,
                    name = %item.name,
                    "skipping untransferable item in folder give"
                );
                continue;
            }
            deliver_item(world, session, recipient, &item, dest.id)?;
        }
        for child in world.inventory.folders_in(sender, src.id)? {
            worklist.push_back((child, dest.id));
        }
    }

    // The worklist ran at least once, so the root copy exists.
    created_root.ok_or_else(|| {
        TransferError::InternalInvariantViolation("folder give created nothing".to_string())
    })
}

/// The delivery core shared by item and folder gives: derive the transfer
/// block, store the copy, consume a no-copy source.
fn deliver_item(
    world: &WorldHandles,
    session: &dyn ActorSession,
    recipient: Uuid,
    item: &InventoryItem,
    dest_folder: Uuid,
) -> Result<InventoryItem, TransferError> {
    let owner_change = recipient != item.owner;
    let (perms, slam_marked) = item.perms.derive_transfer_block(
        world.policy.propagate_permissions(),
        owner_change,
        true,
    );

    let mut copy = InventoryItem::new_object(
        recipient,
        item.creator,
        dest_folder,
        item.asset_id,
        item.name.clone(),
        item.description.clone(),
        perms,
        unix_now(),
    );
    copy.coalesced = item.coalesced;
    copy.slam_marked = item.slam_marked || slam_marked;
    world.inventory.add_item(&copy)?;

    if !world.policy.bypass_permissions() && !item.perms.current.contains(PermBit::Copy) {
        // Moving a no-copy item removes the source occurrence.
        world.inventory.delete_item(item.owner, item.id)?;
        if session.actor() == item.owner {
            session.notify_item_removed(item.id);
        }
    }
    Ok(copy)
}

/// A client-side permissions edit on a held item. Zeroed masks mean "no
/// change" in the legacy protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionUpdate {
    pub next: PermMask,
    pub everyone: PermMask,
    pub group: PermMask,
}

/// Apply a permissions edit to a held object item. Masks are clamped to the
/// item's base mask; an actual change arms the slam bit so the narrowed
/// masks are forced onto the object at its next rez/ownership event.
pub fn update_item_permissions(
    world: &WorldHandles,
    session: &dyn ActorSession,
    item_id: Uuid,
    update: PermissionUpdate,
) -> Result<InventoryItem, TransferError> {
    let actor = session.actor();
    let mut item = world
        .inventory
        .find_item(actor, item_id)?
        .ok_or_else(|| TransferError::NotFound(format!("inventory item {item_id}")))?;

    if item.owner != actor {
        error!(item = %item_id, actor = %actor, "user does not own item, not updating");
        return Err(TransferError::PermissionDenied(
            "item is not owned by this user".to_string(),
        ));
    }

    let next = if update.next.is_empty() {
        item.perms.next
    } else {
        update.next & item.perms.base
    };
    let everyone = if update.everyone.is_empty() {
        item.perms.everyone
    } else {
        update.everyone & item.perms.base
    };
    let group = if update.group.is_empty() {
        item.perms.group
    } else {
        update.group & item.perms.base
    };

    let changing = next != item.perms.next
        || everyone != item.perms.everyone
        || group != item.perms.group;

    if changing {
        if world.scene.attachment_by_item(actor, item_id).is_some() {
            session.alert(
                "To change an attachment's permissions, you must first drop it or detach it.",
            );
            return Err(TransferError::PermissionDenied(
                "cannot change permissions on a worn attachment".to_string(),
            ));
        }
        item.perms.next = next;
        item.perms.everyone = everyone;
        item.perms.group = group;
        item.perms = item.perms.with_export_terms_enforced();
        // Arm the slam so the next rez forces these masks onto the live
        // object, and tell the viewer so.
        item.perms.current.set(PermBit::Slam);
        item.slam_marked = true;
    }

    world.inventory.update_item(&item)?;
    session.notify_item_created(&item);
    Ok(item)
}
