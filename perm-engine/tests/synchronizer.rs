// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use assert_matches::assert_matches;
use perm_core::{
    Context, EntityKind, EntityRef, InvalidationScope, QualifiedPermission, Timestamp,
};
use perm_engine::test_utils::{RecordingSink, memory_engine, setup_logging};
use perm_engine::{EngineError, Synchronizer};
use perm_store::{EntryStore, StoreTransaction};

fn permission(value: &str) -> QualifiedPermission {
    value.parse().unwrap()
}

#[tokio::test]
async fn installs_and_refreshes_online_players() {
    setup_logging();

    let engine = memory_engine();
    engine.create_group("default").await.unwrap();
    engine.create_group("vip").await.unwrap();
    engine.set_parent("vip", Some("default")).await.unwrap();
    engine
        .set_permission(EntityKind::Group, "default", permission("fly"), false, None)
        .await
        .unwrap();
    engine
        .set_permission(EntityKind::Group, "vip", permission("arena:fly"), true, None)
        .await
        .unwrap();

    let synchronizer = Synchronizer::spawn(engine.clone(), 2);
    let alice = RecordingSink::new();
    synchronizer
        .enter("Alice", Context::new("world"), alice.clone())
        .unwrap();

    // Alice has no membership yet and falls back to the default group.
    alice.wait_until(|set| set.get("fly") == Some(false)).await;
    assert_eq!(synchronizer.online().await.unwrap(), vec!["Alice".to_string()]);

    // Writes are picked up through the engine's invalidations.
    engine.add_member("vip", "alice", None).await.unwrap();
    synchronizer
        .context_changed("alice", Context::new("arena"))
        .unwrap();
    let installed = alice.wait_until(|set| set.get("fly") == Some(true)).await;
    assert_eq!(installed.assigned, vec!["vip".to_string()]);

    engine
        .set_permission(EntityKind::Group, "vip", permission("arena:fly"), false, None)
        .await
        .unwrap();
    alice.wait_until(|set| set.get("fly") == Some(false)).await;

    synchronizer.exit("ALICE").unwrap();
    alice.wait_detached().await;
    assert!(synchronizer.online().await.unwrap().is_empty());

    // Results arriving after the exit are not installed anymore.
    let installs = alice.installs();
    engine
        .set_permission(EntityKind::Group, "default", permission("build"), true, None)
        .await
        .unwrap();
    synchronizer.invalidated(InvalidationScope::All).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.installs(), installs);
    assert!(alice.current().is_none());

    synchronizer.shutdown().await.unwrap();
}

#[tokio::test]
async fn only_the_latest_context_is_installed() {
    let engine = memory_engine();
    for world in ["w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7"] {
        engine
            .set_permission(
                EntityKind::Player,
                "bob",
                permission(&format!("{world}:in_{world}")),
                true,
                None,
            )
            .await
            .unwrap();
    }

    let synchronizer = Synchronizer::spawn(engine.clone(), 4);
    let bob = RecordingSink::new();
    synchronizer
        .enter("bob", Context::new("w0"), bob.clone())
        .unwrap();
    for world in ["w1", "w2", "w3", "w4", "w5", "w6", "w7"] {
        synchronizer
            .context_changed("bob", Context::new(world))
            .unwrap();
    }

    // Only the last requested context may end up installed, whatever order workers finish in.
    bob.wait_until(|set| set.get("in_w7") == Some(true)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let engine_view = engine
        .resolve(EntityRef::player("bob"), Context::new("w7"))
        .await
        .unwrap();
    assert_eq!(bob.current().unwrap(), engine_view);
}

#[tokio::test]
async fn shutdown_detaches_everyone() {
    let engine = memory_engine();
    let synchronizer = Synchronizer::spawn(engine, 1);

    let carol = RecordingSink::new();
    let dave = RecordingSink::new();
    synchronizer
        .enter("carol", Context::new("world"), carol.clone())
        .unwrap();
    synchronizer
        .enter("dave", Context::new("world"), dave.clone())
        .unwrap();

    // Entering again replaces the sink, the previous one gets detached.
    let replacement = RecordingSink::new();
    synchronizer
        .enter("dave", Context::new("world"), replacement.clone())
        .unwrap();
    dave.wait_detached().await;
    replacement.wait_until(|_| true).await;

    synchronizer.shutdown().await.unwrap();
    assert!(carol.is_detached());
    assert!(replacement.is_detached());
    assert!(synchronizer.online().await.is_err());
}

#[tokio::test]
async fn expired_grants_are_removed_from_online_players() {
    let engine = memory_engine();
    // Timestamps have second precision, two seconds leave at least one for the first install.
    let expires_at = Timestamp::now().after(Duration::from_secs(2));
    engine
        .set_permission(
            EntityKind::Player,
            "erin",
            permission("fly"),
            true,
            Some(expires_at),
        )
        .await
        .unwrap();

    let synchronizer = Synchronizer::spawn(engine.clone(), 1);
    let erin = RecordingSink::new();
    synchronizer
        .enter("erin", Context::new("world"), erin.clone())
        .unwrap();

    let installed = erin.wait_until(|set| set.get("fly") == Some(true)).await;
    assert_eq!(installed.expires_at, Some(expires_at));

    // Nothing is written and nothing is swept, reaching the expiry alone refreshes the set.
    let refreshed = erin.wait_until(|set| set.get("fly").is_none()).await;
    assert_eq!(refreshed.expires_at, None);
    assert_eq!(erin.installs(), 2);

    synchronizer.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_recomputations_keep_the_installed_set() {
    let engine = memory_engine();
    engine.create_group("a").await.unwrap();
    engine.create_group("b").await.unwrap();
    engine.set_parent("b", Some("a")).await.unwrap();
    engine
        .set_permission(EntityKind::Group, "b", permission("build"), true, None)
        .await
        .unwrap();
    engine.add_member("b", "frank", None).await.unwrap();

    let synchronizer = Synchronizer::spawn(engine.clone(), 1);
    let frank = RecordingSink::new();
    synchronizer
        .enter("frank", Context::new("world"), frank.clone())
        .unwrap();
    let installed = frank.wait_until(|set| set.get("build") == Some(true)).await;

    // Store a parent cycle directly, bypassing the checks of the engine.
    let mut tx = engine.store().begin().await.unwrap();
    let mut a = tx.entity(&EntityRef::group("a")).await.unwrap().unwrap();
    a.parent = Some("b".into());
    tx.put_entity(a).await.unwrap();
    tx.commit().await.unwrap();

    engine.clear_cache();
    assert_matches!(
        engine
            .resolve(EntityRef::player("frank"), Context::new("world"))
            .await,
        Err(EngineError::Resolve(_))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(frank.installs(), 1);
    assert_eq!(frank.current(), Some(installed));
    assert!(!frank.is_detached());

    synchronizer.shutdown().await.unwrap();
}
