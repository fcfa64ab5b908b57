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

//! The seams between the transfer engine and the rest of the simulator.
//! Everything here is consumed, never implemented, by this workspace; hosts
//! provide the storage, policy and script runtimes behind these traits.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::model::geometry::Vector3;
use crate::model::item::{Folder, FolderKind, InventoryItem};
use crate::model::object::SceneObject;

/// Errors raised by transfer operations and their collaborators.
///
/// Everything except `StorageFailure` and `InternalInvariantViolation` is an
/// expected, actor-recoverable outcome: report the reason and abort cleanly
/// with no state mutated. `StorageFailure` additionally alerts the actor once
/// and must leave the source representation intact. An invariant violation is
/// logged and halts only the affected object, never the batch or the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Land capacity exceeded: would exceed the {0} limit")]
    LandCapacityExceeded(String),
    #[error("Cannot determine land parcel at target position")]
    LandUnresolved,
    #[error("Object rez refused: generation fence exceeded")]
    FenceExceeded,
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

/// A parcel of land as the transfer engine sees it: identity, charge budget,
/// and enough ownership context for policy decisions made elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: Uuid,
    pub owner: Uuid,
    /// Land-impact budget for this parcel.
    pub prim_capacity: u32,
    /// Land-impact already charged.
    pub prims_used: u32,
}

impl Parcel {
    #[must_use]
    pub fn remaining_capacity(&self) -> u32 {
        self.prim_capacity.saturating_sub(self.prims_used)
    }
}

/// Pure policy predicates. Implementations must be side-effect free; the
/// engine never encodes policy rules itself beyond mask arithmetic.
pub trait PolicyOracle: Send + Sync {
    fn can_take_object(&self, object: &SceneObject, actor: Uuid) -> bool;
    fn can_take_copy_object(&self, object: &SceneObject, actor: Uuid) -> bool;
    fn can_delete_object(&self, object: &SceneObject, actor: Uuid) -> bool;
    fn can_return_object(&self, object: &SceneObject, actor: Uuid) -> bool;
    fn is_god(&self, actor: Uuid) -> bool;

    /// Whether `owner` may create an object of the given land impact at
    /// `pos`. `rezzed_by` carries the in-world rezzer when the rez did not
    /// come straight from an avatar's inventory.
    fn can_rez_object(
        &self,
        land_impact: u32,
        owner: Uuid,
        rezzed_by: Option<Uuid>,
        pos: Vector3,
        temporary: bool,
    ) -> bool;

    /// Whether permission propagation applies on ownership changes. Off means
    /// the legacy pass-through behavior.
    fn propagate_permissions(&self) -> bool;

    /// Gods-with-the-lights-off mode: skip permission enforcement entirely.
    fn bypass_permissions(&self) -> bool;

    /// Whether generation-fence cooldown relief applies for this rezzer.
    /// Restricted regions may deny it for temporary objects of guests.
    fn allow_fence_cooldown(&self, owner: Uuid, temporary: bool) -> bool;
}

/// Per-avatar inventory storage. Any call may fail with a storage error;
/// such failures are surfaced to the caller, never swallowed.
pub trait InventoryStore: Send + Sync {
    fn find_item(&self, owner: Uuid, item: Uuid) -> Result<Option<InventoryItem>, TransferError>;
    fn add_item(&self, item: &InventoryItem) -> Result<(), TransferError>;
    fn update_item(&self, item: &InventoryItem) -> Result<(), TransferError>;
    fn delete_item(&self, owner: Uuid, item: Uuid) -> Result<(), TransferError>;

    fn find_folder(&self, owner: Uuid, folder: Uuid) -> Result<Option<Folder>, TransferError>;
    fn folder_for_kind(
        &self,
        owner: Uuid,
        kind: FolderKind,
    ) -> Result<Option<Folder>, TransferError>;
    fn create_folder(&self, folder: &Folder) -> Result<(), TransferError>;
    /// The top-level folder a folder ultimately hangs under, for "is this
    /// inside Trash" checks.
    fn top_level_ancestor(
        &self,
        owner: Uuid,
        folder: Uuid,
    ) -> Result<Option<Folder>, TransferError>;
    /// Direct child folders, for worklist folder copies.
    fn folders_in(&self, owner: Uuid, folder: Uuid) -> Result<Vec<Folder>, TransferError>;
    /// Items directly inside a folder.
    fn items_in(&self, owner: Uuid, folder: Uuid) -> Result<Vec<InventoryItem>, TransferError>;

    /// Whether an individual user account exists. Group ids and deleted
    /// accounts resolve false; return destinations route around them.
    fn account_exists(&self, user: Uuid) -> Result<bool, TransferError>;
}

/// Opaque asset payload storage.
pub trait AssetStore: Send + Sync {
    fn get_asset(&self, id: Uuid) -> Result<Option<Vec<u8>>, TransferError>;
    fn add_asset(&self, data: Vec<u8>) -> Result<Uuid, TransferError>;
}

/// The live scene: object lookup, insertion/removal, and the land queries
/// placement depends on.
pub trait SceneGraph: Send + Sync {
    fn object_by_handle(&self, handle: u32) -> Option<Arc<SceneObject>>;
    fn object_by_id(&self, id: Uuid) -> Option<Arc<SceneObject>>;
    /// The attachment a wearer has on for a given originating item.
    fn attachment_by_item(&self, wearer: Uuid, item: Uuid) -> Option<Arc<SceneObject>>;

    /// Insert a reconstructed object into the scene, assigning its local
    /// handle. `persist` is false for temporaries and attachments.
    fn insert_object(&self, object: Arc<SceneObject>, persist: bool)
    -> Result<(), TransferError>;
    fn remove_object(&self, id: Uuid) -> Result<(), TransferError>;

    fn parcel_at(&self, x: f32, y: f32) -> Option<Parcel>;
    /// Land impact still available region-wide.
    fn region_capacity_remaining(&self) -> u32;
    /// Width/height of the region's terrain.
    fn terrain_extent(&self) -> (f32, f32);
    fn terrain_height_at(&self, x: f32, y: f32) -> f32;
    fn avatar_position(&self, avatar: Uuid) -> Option<Vector3>;
}

/// The script runtime, driven but never implemented here.
pub trait ScriptHost: Send + Sync {
    /// Instantiate scripts for a freshly placed object. `post_on_rez` fires
    /// the on-rez event with `start_param`.
    fn create_script_instances(&self, object: &SceneObject, start_param: i32, post_on_rez: bool);
    fn remove_script_instances(&self, object: &SceneObject);
    /// Stop running scripts in place, e.g. ahead of packaging.
    fn stop_scripts(&self, object: &SceneObject);
}

/// The acting client, where one exists. Parcel auto-return sweeps and other
/// internal callers operate with no session.
pub trait ActorSession: Send + Sync {
    fn actor(&self) -> Uuid;
    /// One-line message surfaced in the client UI.
    fn alert(&self, message: &str);
    fn notify_item_created(&self, item: &InventoryItem);
    fn notify_item_removed(&self, item: Uuid);
}
