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

mod common;

use std::sync::{Arc, Barrier};

use uuid::Uuid;

use common::{RecordingSession, fixture, spawn_object};
use rezport_common::model::{
    FULL_RIGHTS, Folder, FolderKind, InventoryItem, PermBit, PermissionBlock, TransferError,
    Vector3,
};
use rezport_kernel::derez::{DeRezAction, DeRezResolver};

fn pos() -> Vector3 {
    Vector3::new(128.0, 128.0, 25.0)
}

#[test]
fn test_simple_take_into_origin_folder() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);

    // A distinct user folder the object was originally rezzed from.
    let root = fix.inventory.folder_of_kind(actor, FolderKind::Root).unwrap();
    let origin = Folder {
        id: Uuid::new_v4(),
        owner: actor,
        kind: FolderKind::Other,
        parent: Some(root.id),
        name: "Gadgets".to_string(),
    };
    fix.inventory.insert_folder(origin.clone());

    let (object, handle) = spawn_object(&fix, actor, PermissionBlock::full(), pos());
    object.with_state_mut(|s| s.rezzed_from_folder = Some(origin.id));

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    let count = resolver
        .derez_object(Some(&*session), handle, DeRezAction::Take, None)
        .unwrap();

    assert_eq!(count, 1);
    assert!(!fix.scene.contains(object.id()));

    let items = fix.inventory.items_for(actor);
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.folder, origin.id);
    // Same-owner capture: current mask carries over unchanged.
    assert_eq!(item.perms.current, FULL_RIGHTS);
    assert!(!item.coalesced);
    assert_eq!(fix.assets.count(), 1);
    assert_eq!(session.created.lock().unwrap().len(), 1);
}

#[test]
fn test_take_skips_origin_folder_under_trash() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);
    let trash = fix.inventory.folder_of_kind(actor, FolderKind::Trash).unwrap();
    let buried = Folder {
        id: Uuid::new_v4(),
        owner: actor,
        kind: FolderKind::Other,
        parent: Some(trash.id),
        name: "Old Stuff".to_string(),
    };
    fix.inventory.insert_folder(buried.clone());

    let (object, handle) = spawn_object(&fix, actor, PermissionBlock::full(), pos());
    object.with_state_mut(|s| s.rezzed_from_folder = Some(buried.id));

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(Some(&*session), handle, DeRezAction::Take, None)
        .unwrap();

    let objects = fix.inventory.folder_of_kind(actor, FolderKind::Objects).unwrap();
    let items = fix.inventory.items_for(actor);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].folder, objects.id);
}

#[test]
fn test_batch_permission_failure_is_atomic() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    let owner = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);
    fix.inventory.seed_avatar(owner);

    let mut objects = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let (object, handle) = spawn_object(&fix, owner, PermissionBlock::full(), pos());
        objects.push(object);
        handles.push(handle);
    }
    // The middle object refuses the return predicate.
    fix.policy.configure(|c| {
        c.deny_return_for.insert(objects[1].id());
    });

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    let result = resolver.derez_objects(Some(&*session), &handles, DeRezAction::Return, None);

    assert!(matches!(result, Err(TransferError::PermissionDenied(_))));
    // Nothing was removed and no claim is left behind on any of the three.
    for object in &objects {
        assert!(fix.scene.contains(object.id()));
        assert!(!object.is_being_derezzed());
    }
    assert!(fix.inventory.items_for(owner).is_empty());
    assert!(!session.alert_lines().is_empty());
}

#[test]
fn test_concurrent_returns_remove_exactly_once() {
    let fix = fixture();
    let owner = Uuid::new_v4();
    fix.inventory.seed_avatar(owner);
    let (object, handle) = spawn_object(&fix, owner, PermissionBlock::full(), pos());

    let resolver = Arc::new(DeRezResolver::new(fix.world.clone()));
    let barrier = Arc::new(Barrier::new(2));
    let mut joins = Vec::new();
    for _ in 0..2 {
        let resolver = resolver.clone();
        let barrier = barrier.clone();
        joins.push(std::thread::spawn(move || {
            barrier.wait();
            resolver
                .derez_objects(None, &[handle], DeRezAction::Return, None)
                .unwrap()
        }));
    }
    let total: usize = joins.into_iter().map(|j| j.join().unwrap()).sum();

    // Exactly one sweep processed the object; the other observed a no-op.
    assert_eq!(total, 1);
    assert!(!fix.scene.contains(object.id()));
    assert_eq!(fix.inventory.items_for(owner).len(), 1);
}

#[test]
fn test_delete_own_object_goes_to_trash() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);
    let (object, handle) = spawn_object(&fix, actor, PermissionBlock::full(), pos());

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(Some(&*session), handle, DeRezAction::Delete, None)
        .unwrap();

    assert!(!fix.scene.contains(object.id()));
    let trash = fix.inventory.folder_of_kind(actor, FolderKind::Trash).unwrap();
    let items = fix.inventory.items_for(actor);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].folder, trash.id);
    // Scripts were stopped ahead of packaging.
    assert_eq!(fix.scripts.count_of("stop"), 1);
}

#[test]
fn test_delete_foreign_object_goes_to_owners_lost_and_found() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    let owner = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);
    fix.inventory.seed_avatar(owner);
    let (object, handle) = spawn_object(&fix, owner, PermissionBlock::full(), pos());

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(Some(&*session), handle, DeRezAction::Delete, None)
        .unwrap();

    assert!(!fix.scene.contains(object.id()));
    let lost_and_found = fix
        .inventory
        .folder_of_kind(owner, FolderKind::LostAndFound)
        .unwrap();
    let items = fix.inventory.items_for(owner);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].folder, lost_and_found.id);
    assert!(fix.inventory.items_for(actor).is_empty());
}

#[test]
fn test_god_take_copy_leaves_object_and_ownership() {
    let fix = fixture();
    let god = Uuid::new_v4();
    let owner = Uuid::new_v4();
    fix.inventory.seed_avatar(god);
    fix.inventory.seed_avatar(owner);
    fix.policy.configure(|c| {
        c.gods.insert(god);
    });
    let (object, handle) = spawn_object(&fix, owner, PermissionBlock::full(), pos());

    let session = RecordingSession::new(god);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(Some(&*session), handle, DeRezAction::GodTakeCopy, None)
        .unwrap();

    // The live object is untouched.
    assert!(fix.scene.contains(object.id()));
    assert_eq!(object.owner(), owner);
    assert!(!object.is_being_derezzed());
    // The copy went to the god's Objects folder, scripts still running.
    let objects_folder = fix.inventory.folder_of_kind(god, FolderKind::Objects).unwrap();
    let items = fix.inventory.items_for(god);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].folder, objects_folder.id);
    assert_eq!(fix.scripts.count_of("stop"), 0);
}

#[test]
fn test_save_to_existing_item_updates_asset_in_place() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    let objects_folder = fix.inventory.seed_avatar(actor);
    let (object, handle) = spawn_object(&fix, actor, PermissionBlock::full(), pos());

    let original_asset = fix.assets.insert(b"old payload".to_vec());
    let item = InventoryItem::new_object(
        actor,
        actor,
        objects_folder,
        original_asset,
        "widget",
        "a widget",
        PermissionBlock::full(),
        1_000,
    );
    fix.inventory.insert_item(item.clone());
    object.with_state_mut(|s| s.from_item = Some(item.id));

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(
            Some(&*session),
            handle,
            DeRezAction::SaveToExistingUserInventoryItem,
            None,
        )
        .unwrap();

    // Still rezzed, but the item now points at a fresh asset.
    assert!(fix.scene.contains(object.id()));
    assert!(!object.is_being_derezzed());
    let saved = fix.inventory.item(item.id).unwrap();
    assert_ne!(saved.asset_id, original_asset);
}

#[test]
fn test_storage_failure_leaves_scene_intact() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);
    let (object, handle) = spawn_object(&fix, actor, PermissionBlock::full(), pos());
    fix.assets.fail_next_add.store(true, std::sync::atomic::Ordering::SeqCst);

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    let result = resolver.derez_object(Some(&*session), handle, DeRezAction::Take, None);

    assert!(matches!(result, Err(TransferError::StorageFailure(_))));
    assert!(fix.scene.contains(object.id()));
    assert!(!object.is_being_derezzed());
    assert!(fix.inventory.items_for(actor).is_empty());
    assert!(
        session
            .alert_lines()
            .iter()
            .any(|l| l.contains("try again later"))
    );
}

#[test]
fn test_return_owner_resolution_failure_skips_only_that_object() {
    let fix = fixture();
    let known = Uuid::new_v4();
    fix.inventory.seed_avatar(known);
    // This owner has no account anywhere; their object cannot be returned.
    let vanished = Uuid::new_v4();

    let (good, _) = spawn_object(&fix, known, PermissionBlock::full(), pos());
    let (orphan, _) = spawn_object(&fix, vanished, PermissionBlock::full(), pos());

    let resolver = DeRezResolver::new(fix.world.clone());
    let count = resolver
        .return_objects(&[good.clone(), orphan.clone()], "parcel owner return")
        .unwrap();

    assert_eq!(count, 2);
    // The resolvable sibling was returned.
    assert!(!fix.scene.contains(good.id()));
    assert_eq!(fix.inventory.items_for(known).len(), 1);
    // The orphan stays in the scene with its claim released for a retry.
    assert!(fix.scene.contains(orphan.id()));
    assert!(!orphan.is_being_derezzed());
}

#[test]
fn test_coalesced_take_collapses_to_minimum_permissions() {
    let fix = fixture();
    let actor = Uuid::new_v4();
    fix.inventory.seed_avatar(actor);

    let (a, handle_a) = spawn_object(&fix, actor, PermissionBlock::full(), pos());
    let mut narrowed = PermissionBlock::full();
    narrowed.current.clear(PermBit::Modify);
    let (b, handle_b) = spawn_object(&fix, actor, narrowed, Vector3::new(130.0, 128.0, 25.0));

    let session = RecordingSession::new(actor);
    let resolver = DeRezResolver::new(fix.world.clone());
    let count = resolver
        .derez_objects(Some(&*session), &[handle_a, handle_b], DeRezAction::Take, None)
        .unwrap();

    assert_eq!(count, 2);
    assert!(!fix.scene.contains(a.id()));
    assert!(!fix.scene.contains(b.id()));
    let items = fix.inventory.items_for(actor);
    assert_eq!(items.len(), 1);
    assert!(items[0].coalesced);
    // The collapsed block is the per-class minimum across members.
    assert!(!items[0].perms.current.contains(PermBit::Modify));
    assert!(items[0].perms.current.contains(PermBit::Copy));
}

#[test]
fn test_take_copy_of_no_copy_object_consumes_it() {
    let fix = fixture();
    let taker = Uuid::new_v4();
    let owner = Uuid::new_v4();
    fix.inventory.seed_avatar(taker);
    fix.inventory.seed_avatar(owner);

    let mut perms = PermissionBlock::full();
    perms.current.clear(PermBit::Copy);
    perms.next.clear(PermBit::Modify);
    let (object, handle) = spawn_object(&fix, owner, perms, pos());

    let session = RecordingSession::new(taker);
    let resolver = DeRezResolver::new(fix.world.clone());
    resolver
        .derez_object(Some(&*session), handle, DeRezAction::TakeCopy, None)
        .unwrap();

    // The recipient got the capture, narrowed by the next-owner mask.
    let items = fix.inventory.items_for(taker);
    assert_eq!(items.len(), 1);
    assert!(!items[0].perms.current.contains(PermBit::Modify));
    // Copying a no-copy object consumes the original.
    assert!(!fix.scene.contains(object.id()));
}
