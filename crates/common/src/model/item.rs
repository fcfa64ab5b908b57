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

use bincode::{Decode, Encode};
use strum::Display;
use uuid::Uuid;

use crate::model::permissions::{PermMask, PermissionBlock};

/// Sale state of an object or item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Encode, Decode)]
pub enum SaleState {
    #[default]
    Not,
    Original,
    Copy,
    Contents,
}

/// The system folders destination resolution cares about. Everything else is
/// an ordinary user folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FolderKind {
    Root,
    Trash,
    LostAndFound,
    Objects,
    Other,
}

/// A folder handle, just enough to resolve destinations and walk ancestry.
#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
    pub id: Uuid,
    pub owner: Uuid,
    pub kind: FolderKind,
    pub parent: Option<Uuid>,
    pub name: String,
}

/// An inventory item resident in an avatar's folder tree. Owned by exactly
/// one avatar; a no-copy move consumes the source occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryItem {
    pub id: Uuid,
    pub owner: Uuid,
    pub creator: Uuid,
    pub folder: Uuid,
    pub asset_id: Uuid,
    pub name: String,
    pub description: String,
    pub perms: PermissionBlock,
    pub sale: SaleState,
    pub sale_price: i32,
    /// Unix seconds.
    pub created_at: u64,
    /// The asset holds multiple coalesced object groups.
    pub coalesced: bool,
    /// Client-visible marker that permissions will be forcibly narrowed on
    /// the next ownership change.
    pub slam_marked: bool,
    pub group_id: Option<Uuid>,
    pub group_owned: bool,
}

impl InventoryItem {
    /// A fresh object item with a random id.
    #[must_use]
    pub fn new_object(
        owner: Uuid,
        creator: Uuid,
        folder: Uuid,
        asset_id: Uuid,
        name: impl Into<String>,
        description: impl Into<String>,
        perms: PermissionBlock,
        created_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            creator,
            folder,
            asset_id,
            name: name.into(),
            description: description.into(),
            perms,
            sale: SaleState::Not,
            sale_price: 10,
            created_at,
            coalesced: false,
            slam_marked: false,
            group_id: None,
            group_owned: false,
        }
    }
}

/// What kind of content a task inventory entry holds. Scripts are the only
/// kind this engine treats specially (stop-on-package).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Encode, Decode)]
pub enum TaskItemKind {
    Object,
    Script,
    Other,
}

/// An inventory item resident inside a scene object's embedded inventory.
/// Destroyed with the containing object or entry. Carries the runtime
/// permission grant a script may have negotiated.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub owner: Uuid,
    pub creator: Uuid,
    pub name: String,
    pub description: String,
    pub kind: TaskItemKind,
    /// Script is running; meaningless for other kinds.
    pub running: bool,
    pub perms: PermissionBlock,
    pub created_at: u64,
    pub granter: Option<Uuid>,
    pub granted: PermMask,
}

impl TaskItem {
    /// Clear any runtime capability grant, e.g. when the containing object
    /// changes hands.
    pub fn revoke_grants(&mut self) {
        self.granter = None;
        self.granted = PermMask::new();
    }
}
