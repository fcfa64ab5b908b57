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

//! Serialization of object groups into opaque inventory asset payloads and
//! back. A payload holds either one group or an ordered coalesced set, each
//! member paired with its computed permission block. Payloads are snapshots:
//! reconstruction always mints fresh runtime identity.

use bincode::{Decode, Encode};
use uuid::Uuid;

use rezport_common::PAYLOAD_LAYOUT_VERSION;
use rezport_common::model::{
    AttachmentState, ObjectPart, ObjectState, PermMask, PermissionBlock, SaleState, SceneObject,
    TaskItem, TaskItemKind, TransferError, Vector3,
};

const PAYLOAD_MAGIC: [u8; 4] = *b"RZOB";
const KIND_SINGLE: u8 = 1;
const KIND_COALESCED: u8 = 2;
const HEADER_LEN: usize = PAYLOAD_MAGIC.len() + 2;

/// Serialization behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackFlags {
    /// Strip running-script state: set whenever the object leaves the live
    /// scene un-rezzed (trash, lost-and-found), never for transient
    /// attachment saves.
    pub stop_scripts: bool,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TaskItemSnapshot {
    pub id: u128,
    pub asset_id: u128,
    pub owner: u128,
    pub creator: u128,
    pub name: String,
    pub description: String,
    pub kind: TaskItemKind,
    pub running: bool,
    pub perms: PermissionBlock,
    pub created_at: u64,
    pub granter: Option<u128>,
    pub granted: PermMask,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PartSnapshot {
    pub id: u128,
    pub creator: u128,
    pub owner: u128,
    pub last_owner: u128,
    pub group_id: Option<u128>,
    pub name: String,
    pub description: String,
    pub perms: PermissionBlock,
    pub offset: Vector3,
    pub size: Vector3,
    pub temporary: bool,
    pub sale: SaleState,
    pub sale_price: i32,
    pub inventory: Vec<TaskItemSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ObjectSnapshot {
    /// Parts, root first.
    pub parts: Vec<PartSnapshot>,
    /// Absolute position at capture time. Placement-relative for coalesced
    /// members once the set is re-anchored.
    pub position: Vector3,
    /// Attach point the group was worn at, 0 when it was a world object.
    pub attachment_point: u8,
}

impl ObjectSnapshot {
    #[must_use]
    pub fn land_impact(&self) -> u32 {
        self.parts.len() as u32
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.parts.first().is_some_and(|p| p.temporary)
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct CoalescedMember {
    object: ObjectSnapshot,
    perms: PermissionBlock,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct CoalescedSnapshot {
    groups: Vec<CoalescedMember>,
}

/// A decoded inventory asset payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RezPayload {
    Single(ObjectSnapshot),
    Coalesced(Vec<(ObjectSnapshot, PermissionBlock)>),
}

fn snapshot_task_item(item: &TaskItem, flags: PackFlags) -> TaskItemSnapshot {
    TaskItemSnapshot {
        id: item.id.as_u128(),
        asset_id: item.asset_id.as_u128(),
        owner: item.owner.as_u128(),
        creator: item.creator.as_u128(),
        name: item.name.clone(),
        description: item.description.clone(),
        kind: item.kind,
        running: item.running && !flags.stop_scripts,
        perms: item.perms,
        created_at: item.created_at,
        granter: item.granter.map(|g| g.as_u128()),
        granted: item.granted,
    }
}

fn snapshot_part(part: &ObjectPart, flags: PackFlags) -> PartSnapshot {
    PartSnapshot {
        id: part.id.as_u128(),
        creator: part.creator.as_u128(),
        owner: part.owner.as_u128(),
        last_owner: part.last_owner.as_u128(),
        group_id: part.group_id.map(|g| g.as_u128()),
        name: part.name.clone(),
        description: part.description.clone(),
        perms: part.perms,
        offset: part.offset,
        size: part.size,
        temporary: part.temporary,
        sale: part.sale,
        sale_price: part.sale_price,
        inventory: part.inventory.iter().map(|i| snapshot_task_item(i, flags)).collect(),
    }
}

/// Capture one live group.
#[must_use]
pub fn snapshot_object(object: &SceneObject, flags: PackFlags) -> ObjectSnapshot {
    object.with_state(|s| ObjectSnapshot {
        parts: s.parts.iter().map(|p| snapshot_part(p, flags)).collect(),
        position: s.position,
        attachment_point: match s.attachment {
            AttachmentState::Attached { point, .. } => point,
            AttachmentState::Unattached => 0,
        },
    })
}

fn encode_payload<T: Encode>(kind: u8, body: &T) -> Result<Vec<u8>, TransferError> {
    let body = bincode::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| TransferError::StorageFailure(format!("could not encode payload: {e}")))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&PAYLOAD_MAGIC);
    out.push(PAYLOAD_LAYOUT_VERSION);
    out.push(kind);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Serialize one object group.
pub fn serialize_object(object: &SceneObject, flags: PackFlags) -> Result<Vec<u8>, TransferError> {
    encode_payload(KIND_SINGLE, &snapshot_object(object, flags))
}

/// Serialize a multi-object selection as one coalesced payload, pairing each
/// member with its computed permission block.
pub fn serialize_coalesced(
    groups: &[(&SceneObject, PermissionBlock)],
    flags: PackFlags,
) -> Result<Vec<u8>, TransferError> {
    let snap = CoalescedSnapshot {
        groups: groups
            .iter()
            .map(|(object, perms)| CoalescedMember {
                object: snapshot_object(object, flags),
                perms: *perms,
            })
            .collect(),
    };
    encode_payload(KIND_COALESCED, &snap)
}

/// Whether the payload carries our magic and a layout version we read.
#[must_use]
pub fn can_deserialize(bytes: &[u8]) -> bool {
    bytes.len() > HEADER_LEN
        && bytes[..PAYLOAD_MAGIC.len()] == PAYLOAD_MAGIC
        && bytes[PAYLOAD_MAGIC.len()] == PAYLOAD_LAYOUT_VERSION
}

/// Decode an inventory asset payload.
pub fn deserialize(bytes: &[u8]) -> Result<RezPayload, TransferError> {
    if !can_deserialize(bytes) {
        return Err(TransferError::StorageFailure(
            "unrecognized object payload format".to_string(),
        ));
    }
    let kind = bytes[PAYLOAD_MAGIC.len() + 1];
    let body = &bytes[HEADER_LEN..];
    let config = bincode::config::standard();
    match kind {
        KIND_SINGLE => {
            let (snap, _): (ObjectSnapshot, usize) = bincode::decode_from_slice(body, config)
                .map_err(|e| {
                    TransferError::StorageFailure(format!("could not decode payload: {e}"))
                })?;
            Ok(RezPayload::Single(snap))
        }
        KIND_COALESCED => {
            let (snap, _): (CoalescedSnapshot, usize) = bincode::decode_from_slice(body, config)
                .map_err(|e| {
                    TransferError::StorageFailure(format!("could not decode payload: {e}"))
                })?;
            Ok(RezPayload::Coalesced(
                snap.groups.into_iter().map(|m| (m.object, m.perms)).collect(),
            ))
        }
        other => Err(TransferError::StorageFailure(format!(
            "unknown payload kind {other}"
        ))),
    }
}

fn restore_task_item(snap: TaskItemSnapshot) -> TaskItem {
    TaskItem {
        id: Uuid::from_u128(snap.id),
        asset_id: Uuid::from_u128(snap.asset_id),
        owner: Uuid::from_u128(snap.owner),
        creator: Uuid::from_u128(snap.creator),
        name: snap.name,
        description: snap.description,
        kind: snap.kind,
        running: snap.running,
        perms: snap.perms,
        created_at: snap.created_at,
        granter: snap.granter.map(Uuid::from_u128),
        granted: snap.granted,
    }
}

/// Rebuild a live group from a snapshot. Runtime identity is reset: every
/// part gets a fresh id, the local handle is cleared, transient flags are
/// dropped, and masks are re-validated against the basemask rules before the
/// object is visible to anything else.
#[must_use]
pub fn instantiate(snapshot: ObjectSnapshot, now: u64) -> SceneObject {
    let parts: Vec<ObjectPart> = snapshot
        .parts
        .into_iter()
        .map(|p| {
            let creator = Uuid::from_u128(p.creator);
            let owner = Uuid::from_u128(p.owner);
            ObjectPart {
                id: Uuid::new_v4(),
                creator,
                owner,
                last_owner: Uuid::from_u128(p.last_owner),
                group_id: p.group_id.map(Uuid::from_u128),
                name: p.name,
                description: p.description,
                perms: p.perms.trimmed(creator == owner),
                offset: p.offset,
                size: p.size,
                inventory: p.inventory.into_iter().map(restore_task_item).collect(),
                temporary: p.temporary,
                sale: p.sale,
                sale_price: p.sale_price,
            }
        })
        .collect();
    let id = parts[0].id;
    SceneObject::new(
        id,
        ObjectState {
            parts,
            position: snapshot.position,
            attachment: AttachmentState::Unattached,
            generation: 0,
            rezzed_at: now,
            last_rez: None,
            rezzed_from_folder: None,
            from_item: None,
            changed: false,
            slam_applied: false,
            local_handle: 0,
        },
    )
}
