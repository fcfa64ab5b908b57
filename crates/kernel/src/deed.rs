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

//! Deeding a live object to a group: ownership moves to the group id, the
//! previous individual owner is recorded (returns resolve through them), and
//! next-owner narrowing applies exactly as on any other ownership change.

use tracing::info;
use uuid::Uuid;

use rezport_common::events::WorldEvent;
use rezport_common::model::{ActorSession, PermBit, TransferError};

use crate::world::WorldHandles;

pub fn deed_to_group(
    world: &WorldHandles,
    session: &dyn ActorSession,
    handle: u32,
    group_id: Uuid,
) -> Result<(), TransferError> {
    let actor = session.actor();
    let object = world
        .scene
        .object_by_handle(handle)
        .ok_or_else(|| TransferError::NotFound(format!("object handle {handle}")))?;

    if !world.policy.is_god(actor) {
        if object.owner() != actor {
            return Err(TransferError::PermissionDenied(
                "only the owner can deed an object".to_string(),
            ));
        }
        if !object.with_state(|s| s.parts[0].perms.current.contains(PermBit::Transfer)) {
            return Err(TransferError::PermissionDenied(
                "deeding requires transfer rights".to_string(),
            ));
        }
    }

    // Must deed to the object's current group.
    if object.group_id() != Some(group_id) {
        return Err(TransferError::PermissionDenied(
            "object is not set to this group".to_string(),
        ));
    }

    let previous = object.owner();
    object.transfer_ownership(group_id);
    object.apply_next_owner_permissions();

    info!(object = %object.id(), group = %group_id, "object deeded to group");
    world.events.publish(&WorldEvent::OwnershipChanged {
        object: object.id(),
        previous,
        owner: group_id,
    });
    Ok(())
}
