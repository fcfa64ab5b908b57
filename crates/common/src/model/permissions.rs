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
use enum_primitive_derive::Primitive;

use crate::util::BitEnum;

/// The individual rights an object or inventory item can grant.
#[derive(Debug, Ord, PartialOrd, Copy, Clone, Eq, PartialEq, Hash, Primitive, Encode, Decode)]
pub enum PermBit {
    Modify = 0,
    Copy = 1,
    Move = 2,
    Transfer = 3,
    Export = 4,
    /// Forces the everyone/next-owner masks onto a live object at the next
    /// ownership-affecting event instead of intersecting them in.
    Slam = 5,
}

pub type PermMask = BitEnum<PermBit>;

/// Modify | Copy | Move | Transfer.
pub const ALL_RIGHTS: PermMask = PermMask::from_u16(0b1111);
/// Modify | Copy | Transfer. Export terms require all three.
pub const MCT_RIGHTS: PermMask = PermMask::from_u16(0b1011);
/// ALL_RIGHTS | Export.
pub const FULL_RIGHTS: PermMask = PermMask::from_u16(0b1_1111);
/// Every bit this version of the system understands, Slam included.
const KNOWN_BITS: u16 = 0b11_1111;

/// Whether a stored base mask predates the current mask layout. Legacy content
/// carries bits outside the known set and must be re-trimmed on load.
#[must_use]
pub fn is_legacy_basemask(mask: PermMask) -> bool {
    mask.to_u16() & !KNOWN_BITS != 0
}

/// The five permission masks carried by every object part and inventory item.
///
/// This is a plain value type. Nothing mutates masks in place at call sites;
/// every derivation is one of the pure functions below, so the subset
/// invariant (`other & base == other`) can be audited in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PermissionBlock {
    pub base: PermMask,
    pub current: PermMask,
    pub group: PermMask,
    pub everyone: PermMask,
    pub next: PermMask,
}

impl Default for PermissionBlock {
    fn default() -> Self {
        Self::full()
    }
}

impl PermissionBlock {
    /// Full rights everywhere. Group never carries Export.
    #[must_use]
    pub fn full() -> Self {
        Self {
            base: FULL_RIGHTS,
            current: FULL_RIGHTS,
            group: ALL_RIGHTS,
            everyone: FULL_RIGHTS,
            next: FULL_RIGHTS,
        }
    }

    #[must_use]
    pub fn with_masks(
        base: PermMask,
        current: PermMask,
        group: PermMask,
        everyone: PermMask,
        next: PermMask,
    ) -> Self {
        Self {
            base,
            current,
            group,
            everyone,
            next,
        }
    }

    /// Clamp every other mask to the base mask.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.current &= self.base;
        self.group &= self.base;
        self.everyone &= self.base;
        self.next &= self.base;
        self
    }

    /// True when every non-base mask is a subset of base.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.current.difference(self.base).is_empty()
            && self.group.difference(self.base).is_empty()
            && self.everyone.difference(self.base).is_empty()
            && self.next.difference(self.base).is_empty()
    }

    /// Export may only be offered to everyone when the next owner would
    /// receive full Modify/Copy/Transfer rights.
    #[must_use]
    pub fn with_export_terms_enforced(mut self) -> Self {
        if !self.next.contains_all(MCT_RIGHTS) {
            self.everyone.clear(PermBit::Export);
        }
        self
    }

    /// Whether the current mask carries the slam bit.
    #[must_use]
    pub fn slam_set(&self) -> bool {
        self.current.contains(PermBit::Slam)
    }

    /// Derive the permission block for an item copy headed to `owner_change`
    /// hands. The legacy path (propagation disabled) hands the masks over
    /// untouched; the modern path narrows base/current by the next-owner mask
    /// and carries the next-owner mask forward. Group and everyone rights
    /// never survive a transfer.
    ///
    /// Returns the derived block and whether the slam bit was re-asserted,
    /// which the caller must surface to the destination client.
    #[must_use]
    pub fn derive_transfer_block(
        &self,
        propagate: bool,
        owner_change: bool,
        is_object: bool,
    ) -> (Self, bool) {
        let mut slam_marked = false;
        let mut out = *self;

        if owner_change && propagate {
            out.base = self.base & self.next;
            out.current = self.current & self.next;
            out.next = self.next;
            if is_object && self.slam_set() {
                // The & with next above may have stripped it.
                out.current.set(PermBit::Slam);
                slam_marked = true;
            }
        }

        if owner_change {
            out.everyone = PermMask::new();
            out.group = PermMask::new();
        }

        (out, slam_marked)
    }

    /// The minimum rights across a set of blocks, per mask class, used when a
    /// multi-object selection collapses to a single inventory item.
    #[must_use]
    pub fn coalesced_minimum<'a>(blocks: impl Iterator<Item = &'a PermissionBlock>) -> Self {
        let mut out = Self::full();
        for block in blocks {
            out.base &= block.base;
            out.current &= block.current;
            out.group &= block.group;
            out.everyone &= block.everyone;
            out.next &= block.next;
        }
        out.normalized()
    }

    /// Narrow this part's masks for an ownership change. `effective_next` is
    /// the group-wide folded next-owner mask. Export survives only when the
    /// everyone mask already offered it.
    #[must_use]
    pub fn applied_next_owner(mut self, effective_next: PermMask) -> Self {
        let mut nperms = effective_next;
        if self.everyone.contains(PermBit::Export) {
            nperms.set(PermBit::Export);
        } else {
            nperms.clear(PermBit::Export);
        }
        self.base &= nperms;
        self.current &= nperms;
        self.everyone &= nperms;
        self
    }

    /// Re-derive the outward-facing masks of a child part from its root.
    /// Old link operations did not force these onto children, so groups in
    /// the wild carry drifted child masks; rez is the repair point.
    #[must_use]
    pub fn synced_with_root(mut self, root: &PermissionBlock) -> Self {
        self.next = self.base & root.next;
        self.group = self.base & root.group;
        self.everyone = self.base & root.everyone;
        self
    }

    /// Re-validate masks loaded from a serialized payload. Legacy-format
    /// masks are stripped to the known set, with Export only retained for
    /// content still held by its creator. Modern masks with full rights and a
    /// creator-owner get Export granted, covering content created between the
    /// mask-layout change and Export support.
    #[must_use]
    pub fn trimmed(mut self, creator_is_owner: bool) -> Self {
        if is_legacy_basemask(self.base) {
            let mut trim_mask = ALL_RIGHTS;
            if creator_is_owner {
                trim_mask.set(PermBit::Export);
            }
            self.base &= trim_mask;
            self.current &= trim_mask;
            self.group &= trim_mask;
            self.everyone &= trim_mask;
            self.next &= trim_mask;
        } else {
            if creator_is_owner && self.base.contains_all(ALL_RIGHTS) {
                self.base.set(PermBit::Export);
                self.current.set(PermBit::Export);
            }
            self.base &= FULL_RIGHTS;
            self.current &= FULL_RIGHTS;
            self.group &= FULL_RIGHTS;
            self.everyone &= FULL_RIGHTS;
            self.next &= FULL_RIGHTS;
        }
        self
    }
}
