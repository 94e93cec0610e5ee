// SPDX-License-Identifier: MIT OR Apache-2.0

use std::task::Poll;

use assert_matches::assert_matches;
use futures_test::task::noop_context;
use perm_core::{
    Entity, EntityKind, EntityRef, Entry, Membership, ModelError, QualifiedPermission, Timestamp,
};
use tokio::pin;

use crate::{EntryStore, StoreError, StoreTransaction, assert_all_stores};

fn group(name: &str, parent: Option<&str>, priority: i32) -> Entity {
    let mut entity = Entity::new(EntityKind::Group, name).unwrap();
    entity.parent = parent.map(str::to_lowercase);
    entity.priority = priority;
    entity
}

fn entry(entity: EntityRef, permission: &str, value: bool) -> Entry {
    Entry::new(entity, permission.parse().unwrap(), value)
}

#[tokio::test]
async fn entity_crud() {
    assert_all_stores!(|store| async {
        let mut tx = store.begin().await.unwrap();
        assert!(tx.put_entity(group("Admins", None, 0)).await.unwrap());
        assert!(tx.put_entity(group("Staff", Some("admins"), 5)).await.unwrap());

        // Updating an existing entity is not an insertion.
        assert!(!tx.put_entity(group("ADMINS", None, 100)).await.unwrap());

        let admins = tx.entity(&EntityRef::group("admins")).await.unwrap().unwrap();
        assert_eq!(admins.display_name, "ADMINS");
        assert_eq!(admins.priority, 100);

        assert_eq!(tx.children("admins").await.unwrap(), vec!["staff"]);
        assert_eq!(tx.entities(EntityKind::Group).await.unwrap().len(), 2);
        assert!(tx.entities(EntityKind::Player).await.unwrap().is_empty());
        assert_eq!(tx.entity(&EntityRef::player("admins")).await.unwrap(), None);
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let staff = snapshot.group("staff").unwrap();
        assert_eq!(staff.parent.as_deref(), Some("admins"));
        assert_eq!(staff.priority, 5);
        assert_eq!(snapshot.children("admins").collect::<Vec<_>>(), vec!["staff"]);
    });
}

#[tokio::test]
async fn memberships_and_entries() {
    assert_all_stores!(|store| async {
        let alice = EntityRef::player("alice");
        let expires_at = Some(Timestamp::from_secs(5_000));

        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("vip", None, 10)).await.unwrap();
        assert!(
            tx.put_membership(Membership::new("alice", "vip").unwrap())
                .await
                .unwrap()
        );
        assert!(
            !tx.put_membership(
                Membership::new("alice", "vip")
                    .unwrap()
                    .with_expiry(expires_at)
            )
            .await
            .unwrap()
        );
        assert!(tx.put_entry(entry(alice.clone(), "fly", true)).await.unwrap());
        assert!(
            tx.put_entry(entry(alice.clone(), "spawn/arena:fly", false))
                .await
                .unwrap()
        );
        assert!(!tx.put_entry(entry(alice.clone(), "fly", false)).await.unwrap());

        let memberships = tx.memberships("alice").await.unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].expires_at, expires_at);
        assert_eq!(tx.members("vip").await.unwrap(), memberships);
        assert_eq!(tx.entries(&alice).await.unwrap().len(), 2);
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let regional = QualifiedPermission::scoped("fly", Some("arena"), Some("spawn")).unwrap();
        assert_eq!(snapshot.entry(&alice, &regional).map(|entry| entry.value), Some(false));
        assert_eq!(
            snapshot
                .entry(&alice, &QualifiedPermission::new("fly").unwrap())
                .map(|entry| entry.value),
            Some(false)
        );

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete_entry(&alice, &regional).await.unwrap());
        assert!(!tx.delete_entry(&alice, &regional).await.unwrap());
        assert!(tx.delete_membership("alice", "vip").await.unwrap());
        assert!(!tx.delete_membership("alice", "vip").await.unwrap());
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.entries_of(&alice).count(), 1);
        assert_eq!(snapshot.memberships_of("alice").count(), 0);
    });
}

#[tokio::test]
async fn rollback_discards_changes() {
    assert_all_stores!(|store| async {
        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("default", None, 0)).await.unwrap();
        tx.rollback().await.unwrap();

        // Dropping a transaction discards its changes as well.
        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("vip", None, 0)).await.unwrap();
        drop(tx);

        assert!(store.snapshot().await.unwrap().is_empty());
    });
}

#[tokio::test]
async fn deleting_groups() {
    assert_all_stores!(|store| async {
        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("default", None, 0)).await.unwrap();
        tx.put_entity(group("vip", Some("default"), 10)).await.unwrap();
        tx.put_membership(Membership::new("alice", "vip").unwrap())
            .await
            .unwrap();
        tx.put_entry(entry(EntityRef::group("vip"), "fly", true))
            .await
            .unwrap();

        assert_matches!(
            tx.delete_entity(&EntityRef::group("default")).await,
            Err(StoreError::Model(ModelError::HasChildren(name))) if name == "default"
        );

        assert!(tx.delete_entity(&EntityRef::group("vip")).await.unwrap());
        assert!(!tx.delete_entity(&EntityRef::group("vip")).await.unwrap());
        assert!(tx.memberships("alice").await.unwrap().is_empty());
        assert!(tx.entries(&EntityRef::group("vip")).await.unwrap().is_empty());
        assert!(tx.delete_entity(&EntityRef::group("default")).await.unwrap());
        tx.commit().await.unwrap();

        assert!(store.snapshot().await.unwrap().is_empty());
    });
}

#[tokio::test]
async fn deleting_expired_items() {
    assert_all_stores!(|store| async {
        let bob = EntityRef::player("bob");

        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("vip", None, 0)).await.unwrap();
        tx.put_membership(
            Membership::new("alice", "vip")
                .unwrap()
                .with_expiry(Some(Timestamp::from_secs(100))),
        )
        .await
        .unwrap();
        tx.put_membership(Membership::new("bob", "vip").unwrap())
            .await
            .unwrap();
        tx.put_entry(entry(bob.clone(), "fly", true).with_expiry(Some(Timestamp::from_secs(50))))
            .await
            .unwrap();
        tx.put_entry(entry(bob.clone(), "chat", true)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(
            tx.delete_expired(Timestamp::from_secs(49))
                .await
                .unwrap()
                .is_empty()
        );
        let expired = tx.delete_expired(Timestamp::from_secs(100)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(expired.entries.len(), 1);
        assert_eq!(expired.entries[0].permission.permission(), "fly");
        assert_eq!(expired.memberships.len(), 1);
        assert_eq!(expired.memberships[0].member, "alice");

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.entries_of(&bob).count(), 1);
        assert_eq!(snapshot.members_of("vip").count(), 1);
    });
}

#[tokio::test]
async fn snapshots_are_immutable() {
    assert_all_stores!(|store| async {
        let before = store.snapshot().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put_entity(group("default", None, 0)).await.unwrap();
        tx.commit().await.unwrap();

        let after = store.snapshot().await.unwrap();
        assert!(before.is_empty());
        assert!(after.group("default").is_some());

        // Repeated snapshots without commits in between see the same state.
        let again = store.snapshot().await.unwrap();
        assert!(again.group("default").is_some());
    });
}

#[tokio::test]
async fn transactions_are_serialized() {
    assert_all_stores!(|store| async {
        let tx = store.begin().await.unwrap();

        // Attempting to start a second one should make us wait.
        assert_matches!(
            {
                let fut = store.begin();
                let mut cx = noop_context();
                pin!(fut);
                fut.poll(&mut cx)
            },
            Poll::Pending
        );

        tx.commit().await.unwrap();

        // After the commit a new transaction can begin.
        let tx = store.begin().await.unwrap();
        tx.rollback().await.unwrap();
    });
}
