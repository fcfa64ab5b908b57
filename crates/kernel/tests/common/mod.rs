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

//! In-memory collaborator fakes shared by the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use rezport_common::events::EventRegistry;
use rezport_common::model::{
    ActorSession, AssetStore, AttachmentState, Folder, FolderKind, InventoryItem, InventoryStore,
    ObjectPart, ObjectState, Parcel, PermissionBlock, PolicyOracle, SaleState, SceneGraph,
    SceneObject, ScriptHost, TransferError, Vector3,
};
use rezport_kernel::world::WorldHandles;

#[derive(Debug)]
pub struct PolicyConfig {
    pub allow_take: bool,
    pub allow_take_copy: bool,
    pub allow_delete: bool,
    pub allow_return: bool,
    pub allow_rez: bool,
    pub propagate: bool,
    pub bypass: bool,
    pub allow_cooldown: bool,
    pub gods: HashSet<Uuid>,
    /// Objects for which `can_return_object` is denied regardless of the
    /// blanket switch.
    pub deny_return_for: HashSet<Uuid>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_take: true,
            allow_take_copy: true,
            allow_delete: true,
            allow_return: true,
            allow_rez: true,
            propagate: true,
            bypass: false,
            allow_cooldown: true,
            gods: HashSet::new(),
            deny_return_for: HashSet::new(),
        }
    }
}

#[derive(Default)]
pub struct MockPolicy {
    pub config: Mutex<PolicyConfig>,
}

impl MockPolicy {
    pub fn configure(&self, f: impl FnOnce(&mut PolicyConfig)) {
        f(&mut self.config.lock().unwrap());
    }
}

impl PolicyOracle for MockPolicy {
    fn can_take_object(&self, _object: &SceneObject, _actor: Uuid) -> bool {
        self.config.lock().unwrap().allow_take
    }

    fn can_take_copy_object(&self, _object: &SceneObject, _actor: Uuid) -> bool {
        self.config.lock().unwrap().allow_take_copy
    }

    fn can_delete_object(&self, _object: &SceneObject, _actor: Uuid) -> bool {
        self.config.lock().unwrap().allow_delete
    }

    fn can_return_object(&self, object: &SceneObject, _actor: Uuid) -> bool {
        let config = self.config.lock().unwrap();
        config.allow_return && !config.deny_return_for.contains(&object.id())
    }

    fn is_god(&self, actor: Uuid) -> bool {
        self.config.lock().unwrap().gods.contains(&actor)
    }

    fn can_rez_object(
        &self,
        _land_impact: u32,
        _owner: Uuid,
        _rezzed_by: Option<Uuid>,
        _pos: Vector3,
        _temporary: bool,
    ) -> bool {
        self.config.lock().unwrap().allow_rez
    }

    fn propagate_permissions(&self) -> bool {
        self.config.lock().unwrap().propagate
    }

    fn bypass_permissions(&self) -> bool {
        self.config.lock().unwrap().bypass
    }

    fn allow_fence_cooldown(&self, _owner: Uuid, _temporary: bool) -> bool {
        self.config.lock().unwrap().allow_cooldown
    }
}

#[derive(Default)]
struct InventoryInner {
    items: HashMap<Uuid, InventoryItem>,
    folders: HashMap<Uuid, Folder>,
    accounts: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemInventory {
    inner: Mutex<InventoryInner>,
    pub fail_all: AtomicBool,
}

impl MemInventory {
    fn check_fail(&self) -> Result<(), TransferError> {
        if self.fail_all.load(Ordering::SeqCst) {
            Err(TransferError::StorageFailure(
                "inventory store offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Register an account with its standard system folders, returning the
    /// id of the Objects folder.
    pub fn seed_avatar(&self, avatar: Uuid) -> Uuid {
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.insert(avatar);
        let root = Folder {
            id: Uuid::new_v4(),
            owner: avatar,
            kind: FolderKind::Root,
            parent: None,
            name: "My Inventory".to_string(),
        };
        let root_id = root.id;
        let mut objects_id = Uuid::nil();
        inner.folders.insert(root.id, root);
        for kind in [FolderKind::Objects, FolderKind::Trash, FolderKind::LostAndFound] {
            let folder = Folder {
                id: Uuid::new_v4(),
                owner: avatar,
                kind,
                parent: Some(root_id),
                name: format!("{kind}"),
            };
            if kind == FolderKind::Objects {
                objects_id = folder.id;
            }
            inner.folders.insert(folder.id, folder);
        }
        objects_id
    }

    pub fn items_for(&self, owner: Uuid) -> Vec<InventoryItem> {
        self.inner
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|i| i.owner == owner)
            .cloned()
            .collect()
    }

    pub fn item(&self, id: Uuid) -> Option<InventoryItem> {
        self.inner.lock().unwrap().items.get(&id).cloned()
    }

    pub fn insert_item(&self, item: InventoryItem) {
        self.inner.lock().unwrap().items.insert(item.id, item);
    }

    pub fn folder_of_kind(&self, owner: Uuid, kind: FolderKind) -> Option<Folder> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .values()
            .find(|f| f.owner == owner && f.kind == kind)
            .cloned()
    }

    pub fn insert_folder(&self, folder: Folder) {
        self.inner.lock().unwrap().folders.insert(folder.id, folder);
    }

    pub fn folders_for(&self, owner: Uuid) -> Vec<Folder> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .values()
            .filter(|f| f.owner == owner)
            .cloned()
            .collect()
    }
}

impl InventoryStore for MemInventory {
    fn find_item(&self, owner: Uuid, item: Uuid) -> Result<Option<InventoryItem>, TransferError> {
        self.check_fail()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .items
            .get(&item)
            .filter(|i| i.owner == owner)
            .cloned())
    }

    fn add_item(&self, item: &InventoryItem) -> Result<(), TransferError> {
        self.check_fail()?;
        self.inner.lock().unwrap().items.insert(item.id, item.clone());
        Ok(())
    }

    fn update_item(&self, item: &InventoryItem) -> Result<(), TransferError> {
        self.check_fail()?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.items.contains_key(&item.id) {
            return Err(TransferError::NotFound(format!("item {}", item.id)));
        }
        inner.items.insert(item.id, item.clone());
        Ok(())
    }

    fn delete_item(&self, owner: Uuid, item: Uuid) -> Result<(), TransferError> {
        self.check_fail()?;
        let mut inner = self.inner.lock().unwrap();
        match inner.items.get(&item) {
            Some(existing) if existing.owner == owner => {
                inner.items.remove(&item);
                Ok(())
            }
            _ => Err(TransferError::NotFound(format!("item {item}"))),
        }
    }

    fn find_folder(&self, owner: Uuid, folder: Uuid) -> Result<Option<Folder>, TransferError> {
        self.check_fail()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .folders
            .get(&folder)
            .filter(|f| f.owner == owner)
            .cloned())
    }

    fn folder_for_kind(
        &self,
        owner: Uuid,
        kind: FolderKind,
    ) -> Result<Option<Folder>, TransferError> {
        self.check_fail()?;
        Ok(self.folder_of_kind(owner, kind))
    }

    fn create_folder(&self, folder: &Folder) -> Result<(), TransferError> {
        self.check_fail()?;
        self.inner
            .lock()
            .unwrap()
            .folders
            .insert(folder.id, folder.clone());
        Ok(())
    }

    fn top_level_ancestor(
        &self,
        owner: Uuid,
        folder: Uuid,
    ) -> Result<Option<Folder>, TransferError> {
        self.check_fail()?;
        let inner = self.inner.lock().unwrap();
        let mut current = match inner.folders.get(&folder) {
            Some(f) if f.owner == owner => f.clone(),
            _ => return Ok(None),
        };
        while let Some(parent) = current.parent {
            match inner.folders.get(&parent) {
                Some(f) if f.parent.is_some() => current = f.clone(),
                Some(_) => return Ok(Some(current)),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn folders_in(&self, owner: Uuid, folder: Uuid) -> Result<Vec<Folder>, TransferError> {
        self.check_fail()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .folders
            .values()
            .filter(|f| f.owner == owner && f.parent == Some(folder))
            .cloned()
            .collect())
    }

    fn items_in(&self, owner: Uuid, folder: Uuid) -> Result<Vec<InventoryItem>, TransferError> {
        self.check_fail()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|i| i.owner == owner && i.folder == folder)
            .cloned()
            .collect())
    }

    fn account_exists(&self, user: Uuid) -> Result<bool, TransferError> {
        self.check_fail()?;
        Ok(self.inner.lock().unwrap().accounts.contains(&user))
    }
}

#[derive(Default)]
pub struct MemAssets {
    assets: Mutex<HashMap<Uuid, Vec<u8>>>,
    pub fail_next_add: AtomicBool,
}

impl MemAssets {
    pub fn count(&self) -> usize {
        self.assets.lock().unwrap().len()
    }

    pub fn insert(&self, data: Vec<u8>) -> Uuid {
        let id = Uuid::new_v4();
        self.assets.lock().unwrap().insert(id, data);
        id
    }
}

impl AssetStore for MemAssets {
    fn get_asset(&self, id: Uuid) -> Result<Option<Vec<u8>>, TransferError> {
        Ok(self.assets.lock().unwrap().get(&id).cloned())
    }

    fn add_asset(&self, data: Vec<u8>) -> Result<Uuid, TransferError> {
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            return Err(TransferError::StorageFailure(
                "asset server unavailable".to_string(),
            ));
        }
        Ok(self.insert(data))
    }
}

struct SceneInner {
    objects: HashMap<Uuid, Arc<SceneObject>>,
    next_handle: u32,
    parcels: Vec<Parcel>,
    region_capacity: u32,
    avatars: HashMap<Uuid, Vector3>,
}

pub struct MemScene {
    inner: Mutex<SceneInner>,
}

impl Default for MemScene {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SceneInner {
                objects: HashMap::new(),
                next_handle: 1,
                parcels: vec![Parcel {
                    id: Uuid::new_v4(),
                    owner: Uuid::new_v4(),
                    prim_capacity: 1000,
                    prims_used: 0,
                    // One parcel covering the whole region.
                }],
                region_capacity: 10_000,
                avatars: HashMap::new(),
            }),
        }
    }
}

impl MemScene {
    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&id)
    }

    pub fn set_parcel_capacity(&self, capacity: u32) {
        self.inner.lock().unwrap().parcels[0].prim_capacity = capacity;
    }

    pub fn clear_parcels(&self) {
        self.inner.lock().unwrap().parcels.clear();
    }

    pub fn place_avatar(&self, avatar: Uuid, pos: Vector3) {
        self.inner.lock().unwrap().avatars.insert(avatar, pos);
    }

    pub fn objects(&self) -> Vec<Arc<SceneObject>> {
        self.inner.lock().unwrap().objects.values().cloned().collect()
    }
}

impl SceneGraph for MemScene {
    fn object_by_handle(&self, handle: u32) -> Option<Arc<SceneObject>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .values()
            .find(|o| o.with_state(|s| s.local_handle) == handle)
            .cloned()
    }

    fn object_by_id(&self, id: Uuid) -> Option<Arc<SceneObject>> {
        self.inner.lock().unwrap().objects.get(&id).cloned()
    }

    fn attachment_by_item(&self, wearer: Uuid, item: Uuid) -> Option<Arc<SceneObject>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .values()
            .find(|o| {
                o.with_state(|s| {
                    s.from_item == Some(item)
                        && matches!(s.attachment, AttachmentState::Attached { wearer: w, .. } if w == wearer)
                })
            })
            .cloned()
    }

    fn insert_object(
        &self,
        object: Arc<SceneObject>,
        _persist: bool,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        object.with_state_mut(|s| s.local_handle = handle);
        inner.objects.insert(object.id(), object);
        Ok(())
    }

    fn remove_object(&self, id: Uuid) -> Result<(), TransferError> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| TransferError::NotFound(format!("object {id}")))
    }

    fn parcel_at(&self, x: f32, y: f32) -> Option<Parcel> {
        let inner = self.inner.lock().unwrap();
        if !(0.0..256.0).contains(&x) || !(0.0..256.0).contains(&y) {
            return None;
        }
        inner.parcels.first().cloned()
    }

    fn region_capacity_remaining(&self) -> u32 {
        self.inner.lock().unwrap().region_capacity
    }

    fn terrain_extent(&self) -> (f32, f32) {
        (256.0, 256.0)
    }

    fn terrain_height_at(&self, _x: f32, _y: f32) -> f32 {
        20.0
    }

    fn avatar_position(&self, avatar: Uuid) -> Option<Vector3> {
        self.inner.lock().unwrap().avatars.get(&avatar).copied()
    }
}

#[derive(Default)]
pub struct RecordingScripts {
    pub log: Mutex<Vec<String>>,
}

impl RecordingScripts {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl ScriptHost for RecordingScripts {
    fn create_script_instances(&self, object: &SceneObject, _start_param: i32, _post_on_rez: bool) {
        self.log.lock().unwrap().push(format!("create:{}", object.id()));
    }

    fn remove_script_instances(&self, object: &SceneObject) {
        self.log.lock().unwrap().push(format!("remove:{}", object.id()));
    }

    fn stop_scripts(&self, object: &SceneObject) {
        self.log.lock().unwrap().push(format!("stop:{}", object.id()));
    }
}

pub struct RecordingSession {
    actor: Uuid,
    pub alerts: Mutex<Vec<String>>,
    pub created: Mutex<Vec<Uuid>>,
    pub removed: Mutex<Vec<Uuid>>,
}

impl RecordingSession {
    pub fn new(actor: Uuid) -> Arc<Self> {
        Arc::new(Self {
            actor,
            alerts: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn alert_lines(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl ActorSession for RecordingSession {
    fn actor(&self) -> Uuid {
        self.actor
    }

    fn alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }

    fn notify_item_created(&self, item: &InventoryItem) {
        self.created.lock().unwrap().push(item.id);
    }

    fn notify_item_removed(&self, item: Uuid) {
        self.removed.lock().unwrap().push(item);
    }
}

pub struct Fixture {
    pub world: WorldHandles,
    pub policy: Arc<MockPolicy>,
    pub inventory: Arc<MemInventory>,
    pub assets: Arc<MemAssets>,
    pub scene: Arc<MemScene>,
    pub scripts: Arc<RecordingScripts>,
    pub events: Arc<EventRegistry>,
}

pub fn fixture() -> Fixture {
    let policy = Arc::new(MockPolicy::default());
    let inventory = Arc::new(MemInventory::default());
    let assets = Arc::new(MemAssets::default());
    let scene = Arc::new(MemScene::default());
    let scripts = Arc::new(RecordingScripts::default());
    let events = Arc::new(EventRegistry::new());
    let world = WorldHandles {
        policy: policy.clone(),
        inventory: inventory.clone(),
        assets: assets.clone(),
        scene: scene.clone(),
        scripts: scripts.clone(),
        events: events.clone(),
    };
    Fixture {
        world,
        policy,
        inventory,
        assets,
        scene,
        scripts,
        events,
    }
}

pub fn make_part(owner: Uuid, perms: PermissionBlock) -> ObjectPart {
    ObjectPart {
        id: Uuid::new_v4(),
        creator: owner,
        owner,
        last_owner: owner,
        group_id: None,
        name: "widget".to_string(),
        description: "a widget".to_string(),
        perms,
        offset: Vector3::zero(),
        size: Vector3::new(0.5, 0.5, 0.5),
        inventory: Vec::new(),
        temporary: false,
        sale: SaleState::Not,
        sale_price: 10,
    }
}

pub fn make_object(owner: Uuid, perms: PermissionBlock, position: Vector3) -> SceneObject {
    let part = make_part(owner, perms);
    let id = part.id;
    SceneObject::new(
        id,
        ObjectState {
            parts: vec![part],
            position,
            attachment: AttachmentState::Unattached,
            generation: 0,
            rezzed_at: 0,
            last_rez: None,
            rezzed_from_folder: None,
            from_item: None,
            changed: false,
            slam_applied: false,
            local_handle: 0,
        },
    )
}

/// Insert a fresh object into the scene, returning it and its handle.
pub fn spawn_object(
    fix: &Fixture,
    owner: Uuid,
    perms: PermissionBlock,
    position: Vector3,
) -> (Arc<SceneObject>, u32) {
    let object = Arc::new(make_object(owner, perms, position));
    fix.scene.insert_object(object.clone(), true).unwrap();
    let handle = object.with_state(|s| s.local_handle);
    (object, handle)
}

/// Spin until `cond` holds, panicking after `timeout`. For the
/// asynchronous attachment-save path.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            panic!("condition not reached within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
