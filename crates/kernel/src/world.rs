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

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rezport_common::events::EventRegistry;
use rezport_common::model::{
    AssetStore, InventoryStore, PolicyOracle, SceneGraph, ScriptHost,
};

/// The collaborator bundle every engine component works against. Constructed
/// once by the host and shared; all members are trait objects so hosts can
/// swap storage and policy implementations freely.
#[derive(Clone)]
pub struct WorldHandles {
    pub policy: Arc<dyn PolicyOracle>,
    pub inventory: Arc<dyn InventoryStore>,
    pub assets: Arc<dyn AssetStore>,
    pub scene: Arc<dyn SceneGraph>,
    pub scripts: Arc<dyn ScriptHost>,
    pub events: Arc<EventRegistry>,
}

/// Wall-clock unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
