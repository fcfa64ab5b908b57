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

//! Attachment lifecycle: wearing objects, detaching them back to inventory
//! or to the ground, and the asynchronous persistence of changed
//! attachments. Operations for one avatar run strictly in order; different
//! avatars proceed in parallel. Saves in flight are tracked in an owned
//! pending table keyed by object id, with entries removed on completion or
//! failure.

use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ahash::AHasher;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rezport_common::events::WorldEvent;
use rezport_common::model::{
    ActorSession, AttachmentState, FolderKind, InventoryItem, SceneObject, TransferError,
};

use crate::packager::{self, PackFlags};
use crate::rez::RezEngine;
use crate::world::{WorldHandles, unix_now};

type PendingMap = Arc<Mutex<HashMap<Uuid, PendingSave, BuildHasherDefault<AHasher>>>>;

/// A detach-to-inventory save awaiting persistence.
struct PendingSave {
    object: Arc<SceneObject>,
    item_id: Uuid,
    wearer: Uuid,
    session: Option<Arc<dyn ActorSession>>,
    /// Remove the live object once the save lands.
    for_deletion: bool,
}

enum SaveJob {
    Save(Uuid),
    Shutdown,
}

/// One avatar's attachment operations, drained in FIFO order by whichever
/// thread enqueued first.
#[derive(Default)]
struct AvatarQueue {
    ops: VecDeque<QueuedOp>,
    running: bool,
}

enum QueuedOp {
    Attach {
        session: Arc<dyn ActorSession>,
        item_id: Uuid,
        point: u8,
    },
    DetachToInventory {
        session: Arc<dyn ActorSession>,
        item_id: Uuid,
    },
    DetachToGround {
        session: Arc<dyn ActorSession>,
        item_id: Uuid,
    },
}

pub struct AttachmentManager {
    world: WorldHandles,
    rez: Arc<RezEngine>,
    pending: PendingMap,
    queues: Mutex<HashMap<Uuid, AvatarQueue, BuildHasherDefault<AHasher>>>,
    saver_tx: flume::Sender<SaveJob>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl AttachmentManager {
    #[must_use]
    pub fn new(world: WorldHandles, rez: Arc<RezEngine>) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::default()));
        let (saver_tx, saver_rx) = flume::unbounded();
        let saver = spawn_saver(world.clone(), pending.clone(), saver_rx);
        Self {
            world,
            rez,
            pending,
            queues: Mutex::new(HashMap::default()),
            saver_tx,
            saver: Mutex::new(Some(saver)),
        }
    }

    /// Wear an inventory item. Runs on the wearer's attachment queue.
    pub fn attach_from_inventory(
        &self,
        session: Arc<dyn ActorSession>,
        item_id: Uuid,
        point: u8,
    ) {
        let avatar = session.actor();
        self.run_queued(
            avatar,
            QueuedOp::Attach {
                session,
                item_id,
                point,
            },
        );
    }

    /// Detach a worn item back to inventory. The acknowledgment is
    /// immediate; a changed attachment persists in the background.
    pub fn detach_to_inventory(&self, session: Arc<dyn ActorSession>, item_id: Uuid) {
        let avatar = session.actor();
        self.run_queued(avatar, QueuedOp::DetachToInventory { session, item_id });
    }

    /// Drop a worn item as a free-standing world object.
    pub fn detach_to_ground(&self, session: Arc<dyn ActorSession>, item_id: Uuid) {
        let avatar = session.actor();
        self.run_queued(avatar, QueuedOp::DetachToGround { session, item_id });
    }

    /// Wear an object that is already rezzed in the scene: mint its
    /// inventory item and link the two. Scripts keep running across this
    /// transition, so the payload keeps their state.
    pub fn attach_in_world(
        &self,
        session: &dyn ActorSession,
        handle: u32,
        point: u8,
        preferred_folder: Option<Uuid>,
    ) -> Result<InventoryItem, TransferError> {
        let actor = session.actor();
        let group = self
            .world
            .scene
            .object_by_handle(handle)
            .ok_or_else(|| TransferError::NotFound(format!("object handle {handle}")))?;

        let bytes = packager::serialize_object(&group, PackFlags::default())?;
        let asset_id = match self.world.assets.add_asset(bytes) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "unable to attach object, storing asset failed");
                return Err(e);
            }
        };

        let folder = match preferred_folder {
            Some(preferred) => self
                .world
                .inventory
                .find_folder(actor, preferred)?
                .filter(|f| f.owner == actor),
            None => None,
        };
        let folder = match folder {
            Some(folder) => folder,
            None => self
                .world
                .inventory
                .folder_for_kind(actor, FolderKind::Objects)?
                .ok_or_else(|| TransferError::NotFound(format!("Objects folder for {actor}")))?,
        };

        let perms =
            group.new_item_permissions(actor, self.world.policy.propagate_permissions());
        let creator = group.with_state(|s| s.parts[0].creator);
        let item = InventoryItem::new_object(
            actor,
            creator,
            folder.id,
            asset_id,
            group.name(),
            group.description(),
            perms,
            unix_now(),
        );
        self.world.inventory.add_item(&item)?;

        group.with_state_mut(|s| {
            s.from_item = Some(item.id);
            s.attachment = AttachmentState::Attached {
                wearer: actor,
                point,
            };
        });
        session.notify_item_created(&item);
        Ok(item)
    }

    /// Synchronously complete every save still in flight. Hosts call this on
    /// shutdown; tests use it to make the asynchronous path deterministic.
    pub fn flush_pending(&self) {
        let ids: Vec<Uuid> = self.pending.lock().unwrap().keys().copied().collect();
        for id in ids {
            process_save(&self.world, &self.pending, id);
        }
    }

    /// Saves currently awaiting persistence.
    #[must_use]
    pub fn pending_saves(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Enqueue on the avatar's FIFO queue. The first enqueuer becomes the
    /// drainer, executing operations (its own and any that arrive meanwhile)
    /// until the queue is empty; later enqueuers just append and leave.
    fn run_queued(&self, avatar: Uuid, op: QueuedOp) {
        {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(avatar).or_default();
            queue.ops.push_back(op);
            if queue.running {
                return;
            }
            queue.running = true;
        }
        loop {
            let op = {
                let mut queues = self.queues.lock().unwrap();
                let queue = queues.entry(avatar).or_default();
                match queue.ops.pop_front() {
                    Some(op) => op,
                    None => {
                        queue.running = false;
                        break;
                    }
                }
            };
            self.execute(avatar, op);
        }
    }

    fn execute(&self, avatar: Uuid, op: QueuedOp) {
        let result = match op {
            QueuedOp::Attach {
                session,
                item_id,
                point,
            } => self.do_attach(&session, item_id, point),
            QueuedOp::DetachToInventory { session, item_id } => {
                self.do_detach_to_inventory(&session, item_id)
            }
            QueuedOp::DetachToGround { session, item_id } => {
                self.do_detach_to_ground(&session, item_id)
            }
        };
        if let Err(e) = result {
            warn!(avatar = %avatar, error = %e, "attachment operation failed");
        }
    }

    fn do_attach(
        &self,
        session: &Arc<dyn ActorSession>,
        item_id: Uuid,
        point: u8,
    ) -> Result<(), TransferError> {
        let actor = session.actor();
        let item = self
            .world
            .inventory
            .find_item(actor, item_id)?
            .ok_or_else(|| TransferError::NotFound(format!("inventory item {item_id}")))?;

        match self.rez.rez_attachment(session.as_ref(), &item, actor, point) {
            Ok(group) => {
                self.world
                    .scripts
                    .create_script_instances(&group, 0, true);
                Ok(())
            }
            Err(e) => {
                session.alert(&format!("Could not attach '{}'.", item.name));
                Err(e)
            }
        }
    }

    fn do_detach_to_inventory(
        &self,
        session: &Arc<dyn ActorSession>,
        item_id: Uuid,
    ) -> Result<(), TransferError> {
        let actor = session.actor();
        let group = self
            .world
            .scene
            .attachment_by_item(actor, item_id)
            .ok_or_else(|| TransferError::NotFound(format!("attachment for item {item_id}")))?;
        if group.owner() != actor {
            return Err(TransferError::PermissionDenied(
                "not the owner of this attachment".to_string(),
            ));
        }

        self.world.events.publish(&WorldEvent::AttachmentDetached {
            object: group.id(),
            wearer: actor,
        });

        let (changed, temporary) = group.with_state(|s| (s.changed, s.parts[0].temporary));
        if !changed {
            info!(object = %group.id(), "save request for attachment which is unchanged");
            remove_attachment_object(&self.world, &group);
            return Ok(());
        }
        if temporary {
            info!(object = %group.id(), "ignored save request for attachment which is temporary");
            remove_attachment_object(&self.world, &group);
            return Ok(());
        }

        debug!(
            object = %group.id(),
            name = %group.name(),
            "saving changed attachment before removal"
        );
        self.pending.lock().unwrap().insert(
            group.id(),
            PendingSave {
                object: group.clone(),
                item_id,
                wearer: actor,
                session: Some(session.clone()),
                for_deletion: true,
            },
        );
        // Acknowledged; persistence completes on the saver thread.
        let _ = self.saver_tx.send(SaveJob::Save(group.id()));
        Ok(())
    }

    fn do_detach_to_ground(
        &self,
        session: &Arc<dyn ActorSession>,
        item_id: Uuid,
    ) -> Result<(), TransferError> {
        let actor = session.actor();
        let group = self
            .world
            .scene
            .attachment_by_item(actor, item_id)
            .ok_or_else(|| TransferError::NotFound(format!("attachment for item {item_id}")))?;
        let avatar_pos = self
            .world
            .scene
            .avatar_position(actor)
            .ok_or_else(|| TransferError::NotFound(format!("avatar {actor}")))?;

        // The ground drop is an ordinary rez as far as land policy cares.
        let temporary = group.is_temporary();
        if !self.world.policy.can_rez_object(
            group.land_impact(),
            actor,
            None,
            avatar_pos,
            temporary,
        ) {
            session.alert("You cannot drop that here.");
            return Err(TransferError::PermissionDenied(
                "cannot drop object at this position".to_string(),
            ));
        }

        self.world.events.publish(&WorldEvent::AttachmentDetached {
            object: group.id(),
            wearer: actor,
        });

        group.with_state_mut(|s| {
            s.attachment = AttachmentState::Unattached;
            s.position = avatar_pos;
            s.from_item = None;
            // Dropped objects shed any temp-on-rez state and persist.
            for part in &mut s.parts {
                part.temporary = false;
            }
            s.changed = true;
        });

        self.world.inventory.delete_item(actor, item_id)?;
        session.notify_item_removed(item_id);
        Ok(())
    }
}

impl Drop for AttachmentManager {
    fn drop(&mut self) {
        let _ = self.saver_tx.send(SaveJob::Shutdown);
        if let Some(handle) = self.saver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn spawn_saver(
    world: WorldHandles,
    pending: PendingMap,
    rx: flume::Receiver<SaveJob>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("rezport-attachment-saver".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                match job {
                    SaveJob::Save(object_id) => process_save(&world, &pending, object_id),
                    SaveJob::Shutdown => break,
                }
            }
        })
        .expect("Failed to spawn attachment saver thread")
}

/// Complete one pending attachment save. The entry is removed up front so a
/// concurrent flush and the saver thread never double-process; whoever wins
/// the removal does the work.
fn process_save(world: &WorldHandles, pending: &PendingMap, object_id: Uuid) {
    let Some(req) = pending.lock().unwrap().remove(&object_id) else {
        return;
    };

    info!(
        object = %object_id,
        item = %req.item_id,
        "updating asset for detached attachment"
    );

    let bytes = match packager::serialize_object(&req.object, PackFlags { stop_scripts: true }) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(object = %object_id, error = %e, "could not serialize attachment for save");
            return;
        }
    };

    let item = match world.inventory.find_item(req.wearer, req.item_id) {
        Ok(Some(item)) => item,
        Ok(None) => {
            debug!(
                object = %object_id,
                item = %req.item_id,
                "attachment scheduled for save has no inventory item; leaving object"
            );
            return;
        }
        Err(e) => {
            error!(object = %object_id, error = %e, "could not look up attachment item for save");
            return;
        }
    };

    let asset_id = match world.assets.add_asset(bytes) {
        Ok(id) => id,
        Err(e) => {
            error!(object = %object_id, error = %e, "unable to store asset to save attachment");
            if let Some(session) = &req.session {
                session.alert("Unable to create asset. Please try again later.");
            }
            // The live object is left alone; never delete before a
            // confirmed save.
            return;
        }
    };

    let mut item = item;
    item.asset_id = asset_id;
    item.name = req.object.name();
    item.description = req.object.description();
    if let Err(e) = world.inventory.update_item(&item) {
        error!(object = %object_id, error = %e, "could not update attachment item after save");
        return;
    }

    if req.for_deletion {
        remove_attachment_object(world, &req.object);
    }
    if let Some(session) = &req.session {
        session.notify_item_created(&item);
    }
}

fn remove_attachment_object(world: &WorldHandles, group: &Arc<SceneObject>) {
    world.scripts.remove_script_instances(group);
    let owner = group.owner();
    match world.scene.remove_object(group.id()) {
        Ok(()) => world.events.publish(&WorldEvent::ObjectRemoved {
            object: group.id(),
            owner,
        }),
        Err(e) => error!(object = %group.id(), error = %e, "could not remove detached attachment"),
    }
}
