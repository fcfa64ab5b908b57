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

//! The ownership-and-permission transfer engine: moving object groups
//! between the live scene and avatar/object inventories under the
//! base/owner/group/everyone/next-owner mask model, with slam semantics,
//! coalesced packaging, a grey-goo rez fence, and idempotent de-rez guards.
//! Storage, policy, scripting and transport are consumed through the traits
//! in `rezport-common`.

pub mod attach;
pub mod deed;
pub mod derez;
pub mod fence;
pub mod items;
pub mod packager;
pub mod rez;
pub mod world;

pub use attach::AttachmentManager;
pub use derez::{DeRezAction, DeRezResolver, DeRezResult};
pub use fence::FenceSettings;
pub use rez::{PlacementHint, RezEngine};
pub use world::WorldHandles;
