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

//! Fire-and-forget notifications about scene mutations. Subscribers are
//! unrelated subsystems (presence, accounting, replication); one of them
//! failing must never abort the operation that published, so every listener
//! runs isolated and failures are logged and dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;
use uuid::Uuid;

use crate::model::Vector3;

#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    ObjectAdded {
        object: Uuid,
        owner: Uuid,
    },
    ObjectRemoved {
        object: Uuid,
        owner: Uuid,
    },
    OwnershipChanged {
        object: Uuid,
        previous: Uuid,
        owner: Uuid,
    },
    /// Scripts in the object saw a state-relevant change (owner, running
    /// set, ...).
    ScriptChanged {
        object: Uuid,
    },
    /// A worn object left its wearer, for inventory or for the ground.
    AttachmentDetached {
        object: Uuid,
        wearer: Uuid,
    },
    /// An object was returned to its owner's Lost and Found.
    ReturnNotice {
        owner: Uuid,
        object_name: String,
        position: Vector3,
        reason: String,
    },
}

type Listener = Arc<dyn Fn(&WorldEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Explicit publish/subscribe registry with per-subscriber failure
/// isolation.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&WorldEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Deliver to every subscriber. A panicking subscriber is logged and the
    /// remaining subscribers still run; the listener list is snapshotted so
    /// subscribers may themselves (un)subscribe.
    pub fn publish(&self, event: &WorldEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(?event, "event subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}
