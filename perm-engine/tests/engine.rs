// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use perm_core::{Context, EntityKind, EntityRef, InvalidationScope, QualifiedPermission, Timestamp};
use perm_engine::test_utils::{faulty_engine, memory_engine, setup_logging, sqlite_engine};
use perm_engine::{Config, EngineError, Permissions, spawn_sweeper};
use perm_store::EntryStore;
use perm_store::memory::MemoryStore;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn permission(value: &str) -> QualifiedPermission {
    value.parse().unwrap()
}

fn map(values: &[(&str, bool)]) -> BTreeMap<String, bool> {
    values
        .iter()
        .map(|(permission, value)| (permission.to_string(), *value))
        .collect()
}

async fn arena_scenario<S: EntryStore>(engine: &Permissions<S>) {
    engine.create_group("default").await.unwrap();
    engine.create_group("vip").await.unwrap();
    engine.set_priority("vip", 10).await.unwrap();
    engine.set_parent("vip", Some("default")).await.unwrap();
    engine
        .set_permission(EntityKind::Group, "default", permission("fly"), false, None)
        .await
        .unwrap();
    engine
        .set_permission(EntityKind::Group, "vip", permission("arena:fly"), true, None)
        .await
        .unwrap();
    assert!(engine.add_member("vip", "alice", None).await.unwrap());

    let arena = engine
        .player_permissions(&Context::new("arena"), "alice")
        .await
        .unwrap();
    assert_eq!(arena, map(&[("fly", true)]));

    let world = engine
        .player_permissions(&Context::new("world"), "alice")
        .await
        .unwrap();
    assert_eq!(world, map(&[("fly", false)]));

    assert_eq!(
        engine.player_assigned_groups("Alice").await.unwrap(),
        vec!["vip".to_string()]
    );
    assert_eq!(
        engine.player_groups("alice").await.unwrap(),
        vec!["vip".to_string(), "default".to_string()]
    );
    assert_eq!(
        engine.group_members("VIP").await.unwrap(),
        vec!["alice".to_string()]
    );
    assert_eq!(
        engine
            .group_permissions(&Context::new("arena"), "vip")
            .await
            .unwrap(),
        map(&[("fly", true)])
    );
}

#[tokio::test]
async fn arena_scenario_on_all_stores() {
    setup_logging();

    arena_scenario(&*memory_engine()).await;
    arena_scenario(&*sqlite_engine().await).await;
}

async fn writes_are_visible_to_the_next_read<S: EntryStore>(engine: &Permissions<S>) {
    let context = Context::new("world");

    engine.create_group("default").await.unwrap();
    engine.create_group("member").await.unwrap();
    engine.set_parent("member", Some("default")).await.unwrap();
    engine.add_member("member", "bob", None).await.unwrap();

    // Warm up the cache.
    assert_eq!(engine.check(&context, "bob", "build").await.unwrap(), None);
    assert_eq!(engine.check(&context, "bob", "build").await.unwrap(), None);
    assert!(engine.cache_stats().hits >= 1);

    // Writes on an ancestor reach members of descendants.
    engine
        .set_permission(EntityKind::Group, "default", permission("build"), false, None)
        .await
        .unwrap();
    assert_eq!(
        engine.check(&context, "bob", "build").await.unwrap(),
        Some(false)
    );

    // Descendant entries shadow ancestor entries.
    engine
        .set_permission(EntityKind::Group, "member", permission("build"), true, None)
        .await
        .unwrap();
    assert_eq!(
        engine.check(&context, "bob", "build").await.unwrap(),
        Some(true)
    );

    // Player entries shadow every group.
    engine
        .set_permission(EntityKind::Player, "Bob", permission("build"), false, None)
        .await
        .unwrap();
    assert_eq!(
        engine.check(&context, "bob", "build").await.unwrap(),
        Some(false)
    );

    assert!(
        engine
            .unset_permission(&EntityRef::player("bob"), &permission("build"))
            .await
            .unwrap()
    );
    assert_eq!(
        engine.check(&context, "bob", "build").await.unwrap(),
        Some(true)
    );

    // Removing the membership falls back to the default group.
    assert!(engine.remove_member("member", "bob").await.unwrap());
    assert_eq!(
        engine.check(&context, "bob", "build").await.unwrap(),
        Some(false)
    );
    assert_eq!(
        engine.player_assigned_groups("bob").await.unwrap(),
        vec!["default".to_string()]
    );

    // Detaching the hierarchy.
    engine.add_member("member", "bob", None).await.unwrap();
    engine.set_parent("member", None).await.unwrap();
    engine
        .unset_permission(&EntityRef::group("member"), &permission("build"))
        .await
        .unwrap();
    assert_eq!(engine.check(&context, "bob", "build").await.unwrap(), None);

    // Purging the player drops its entries and memberships.
    engine
        .set_permission(EntityKind::Player, "bob", permission("chat"), true, None)
        .await
        .unwrap();
    engine.purge(&EntityRef::player("bob")).await.unwrap();
    assert_eq!(
        engine.player_permissions(&context, "bob").await.unwrap(),
        map(&[("build", false)])
    );
    assert!(engine.group_members("member").await.unwrap().is_empty());
}

#[tokio::test]
async fn cache_consistency_after_mutations() {
    setup_logging();

    writes_are_visible_to_the_next_read(&*memory_engine()).await;
    writes_are_visible_to_the_next_read(&*sqlite_engine().await).await;
}

#[tokio::test]
async fn priorities_and_ties() {
    let engine = memory_engine();
    let context = Context::new("world");

    for (group, priority, value) in [("a", 10, true), ("b", 20, false), ("c", 20, true)] {
        engine.create_group(group).await.unwrap();
        engine.set_priority(group, priority).await.unwrap();
        engine
            .set_permission(EntityKind::Group, group, permission("pvp"), value, None)
            .await
            .unwrap();
        engine.add_member(group, "carol", None).await.unwrap();
    }

    // `b` and `c` share the highest priority, the name sorting first wins.
    assert_eq!(
        engine.player_assigned_groups("carol").await.unwrap(),
        vec!["b".to_string(), "c".to_string(), "a".to_string()]
    );
    assert_eq!(
        engine.check(&context, "carol", "pvp").await.unwrap(),
        Some(false)
    );

    engine.set_priority("c", 30).await.unwrap();
    assert_eq!(
        engine.check(&context, "carol", "pvp").await.unwrap(),
        Some(true)
    );
}

#[tokio::test]
async fn region_order_changes_result_and_cache_key() {
    let engine = memory_engine();

    engine
        .set_permission(
            EntityKind::Player,
            "dave",
            permission("r1/world:build"),
            true,
            None,
        )
        .await
        .unwrap();
    engine
        .set_permission(
            EntityKind::Player,
            "dave",
            permission("r2/world:build"),
            false,
            None,
        )
        .await
        .unwrap();

    let forward = Context::new("world").with_regions(["r1", "r2"]);
    let backward = Context::new("world").with_regions(["r2", "r1"]);

    assert_eq!(
        engine.check(&forward, "dave", "build").await.unwrap(),
        Some(false)
    );
    assert_eq!(
        engine.check(&backward, "dave", "build").await.unwrap(),
        Some(true)
    );
    assert_eq!(engine.cache_stats().entries, 2);
}

#[tokio::test]
async fn rejected_writes_change_nothing() {
    let engine = memory_engine();

    engine.create_group("a").await.unwrap();
    engine.create_group("b").await.unwrap();
    engine.create_group("c").await.unwrap();
    engine.set_parent("b", Some("a")).await.unwrap();
    engine.set_parent("c", Some("b")).await.unwrap();

    let before = engine.snapshot().await.unwrap();
    let stats = engine.cache_stats();
    let mut invalidations = engine.subscribe();

    let result = engine.set_parent("a", Some("c")).await;
    assert_matches!(result, Err(EngineError::Validation(_)));
    let result = engine.set_parent("a", Some("a")).await;
    assert_matches!(result, Err(EngineError::Validation(_)));
    let result = engine.set_parent("a", Some("unknown")).await;
    assert_matches!(result, Err(EngineError::NotFound(_)));
    let result = engine.purge(&EntityRef::group("a")).await;
    assert_matches!(result, Err(EngineError::Validation(_)));
    let result = engine.purge(&EntityRef::player("nobody")).await;
    assert_matches!(result, Err(EngineError::NotFound(_)));
    let result = engine
        .set_permission(EntityKind::Group, "bad name", permission("fly"), true, None)
        .await;
    assert_matches!(result, Err(EngineError::Validation(_)));

    let after = engine.snapshot().await.unwrap();
    assert_eq!(
        before.ancestry("c").unwrap().len(),
        after.ancestry("c").unwrap().len()
    );
    assert_eq!(after.group("a").unwrap().parent, None);
    assert_eq!(engine.cache_stats().invalidations, stats.invalidations);
    assert_matches!(invalidations.try_recv(), Err(TryRecvError::Empty));

    // Creating an existing group is not an error but also not a change.
    assert!(!engine.create_group("A").await.unwrap());
    assert_matches!(invalidations.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn group_changes_invalidate_dependents() {
    let engine = Permissions::new(
        MemoryStore::new(),
        Config {
            default_group: None,
            ..Config::default()
        },
    );

    engine.create_group("member").await.unwrap();
    engine.create_group("vip").await.unwrap();
    engine.create_group("staff").await.unwrap();
    engine.set_parent("vip", Some("member")).await.unwrap();
    engine.add_member("vip", "alice", None).await.unwrap();
    engine.add_member("staff", "erin", None).await.unwrap();

    let mut invalidations = engine.subscribe();
    engine
        .set_permission(EntityKind::Group, "member", permission("build"), true, None)
        .await
        .unwrap();

    let invalidation = invalidations.recv().await.unwrap();
    assert!(invalidation.scope.affects(&EntityRef::group("vip")));
    assert!(invalidation.scope.affects(&EntityRef::player("alice")));
    assert!(!invalidation.scope.affects(&EntityRef::player("erin")));

    engine.reload(Config::default());
    let invalidation = invalidations.recv().await.unwrap();
    assert_eq!(invalidation.scope, InvalidationScope::All);
    assert_eq!(engine.config().default_group(), Some("default"));
}

#[tokio::test]
async fn expired_items_are_ignored_and_swept() {
    let engine = memory_engine();
    let context = Context::new("world");
    let past = Some(Timestamp::from_secs(1));
    let future = Some(Timestamp::now().after(std::time::Duration::from_secs(3600)));

    engine.create_group("vip").await.unwrap();
    engine
        .set_permission(EntityKind::Group, "vip", permission("fly"), true, None)
        .await
        .unwrap();
    engine.add_member("vip", "frank", past).await.unwrap();
    engine
        .set_permission(EntityKind::Player, "frank", permission("build"), true, past)
        .await
        .unwrap();
    engine
        .set_permission(EntityKind::Player, "frank", permission("chat"), true, future)
        .await
        .unwrap();

    let expected = map(&[("chat", true)]);
    assert_eq!(
        engine.player_permissions(&context, "frank").await.unwrap(),
        expected
    );
    assert!(engine.group_members("vip").await.unwrap().is_empty());
    assert_eq!(
        engine
            .resolve(EntityRef::player("frank"), context.clone())
            .await
            .unwrap()
            .expires_at,
        future
    );

    assert_eq!(engine.sweep_expired().await.unwrap(), 2);
    assert_eq!(
        engine.player_permissions(&context, "frank").await.unwrap(),
        expected
    );
    assert_eq!(engine.sweep_expired().await.unwrap(), 0);
    assert_eq!(engine.entries(&EntityRef::player("frank")).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_never_observe_stale_results() {
    setup_logging();

    let engine = memory_engine();
    let context = Context::new("world");
    engine.create_group("default").await.unwrap();
    engine.create_group("member").await.unwrap();
    engine.set_parent("member", Some("default")).await.unwrap();
    for player in ["p0", "p1", "p2", "p3"] {
        engine.add_member("member", player, None).await.unwrap();
    }

    let mut tasks = Vec::new();
    for writer in 0..4 {
        let engine: Arc<Permissions<MemoryStore>> = engine.clone();
        let context = context.clone();
        tasks.push(tokio::spawn(async move {
            let perm = format!("perm{writer}");
            for _ in 0..25 {
                let value = rand::random::<u32>() % 2 == 0;
                let group = if rand::random::<u32>() % 2 == 0 {
                    "default"
                } else {
                    "member"
                };

                // Only this task writes `perm`, so a stale read would be a missed invalidation.
                engine
                    .unset_permission(&EntityRef::group("default"), &permission(&perm))
                    .await
                    .unwrap();
                engine
                    .unset_permission(&EntityRef::group("member"), &permission(&perm))
                    .await
                    .unwrap();
                engine
                    .set_permission(EntityKind::Group, group, permission(&perm), value, None)
                    .await
                    .unwrap();

                let player = format!("p{}", rand::random::<u32>() % 4);
                assert_eq!(
                    engine.check(&context, &player, &perm).await.unwrap(),
                    Some(value)
                );
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    // Every cached answer matches a fresh resolution.
    let model = engine.snapshot().await.unwrap();
    for player in ["p0", "p1", "p2", "p3"] {
        let cached = engine.player_permissions(&context, player).await.unwrap();
        let fresh = perm_core::Resolver::new(&model, Timestamp::now())
            .with_default_group(Some("default"))
            .resolve_player(player, &context)
            .unwrap();
        assert_eq!(cached, fresh.permissions);
    }
}

#[tokio::test]
async fn failed_commits_publish_no_invalidation() {
    let (engine, store) = faulty_engine();
    let context = Context::new("world");

    engine
        .set_permission(EntityKind::Player, "gina", permission("build"), true, None)
        .await
        .unwrap();
    let before = engine.player_permissions(&context, "gina").await.unwrap();
    let invalidations_before = engine.cache_stats().invalidations;

    let mut invalidations = engine.subscribe();
    store.fail_commits(1);
    assert_matches!(
        engine
            .set_permission(EntityKind::Player, "gina", permission("build"), false, None)
            .await,
        Err(EngineError::Store(_))
    );

    assert_matches!(invalidations.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(engine.cache_stats().invalidations, invalidations_before);
    assert_eq!(
        engine.player_permissions(&context, "gina").await.unwrap(),
        before
    );

    // The store recovers and the next write goes through as usual.
    engine
        .set_permission(EntityKind::Player, "gina", permission("build"), false, None)
        .await
        .unwrap();
    let invalidation = invalidations.recv().await.unwrap();
    assert!(invalidation.scope.affects(&EntityRef::player("gina")));
    assert_eq!(
        engine.player_permissions(&context, "gina").await.unwrap(),
        map(&[("build", false)])
    );
}

#[tokio::test(start_paused = true)]
async fn sweeper_removes_expired_items_on_every_tick() {
    let (engine, store) = faulty_engine();
    let past = Some(Timestamp::from_secs(1));
    let period = Duration::from_secs(60);
    let mut invalidations = engine.subscribe();

    engine
        .set_permission(EntityKind::Player, "hank", permission("fly"), true, past)
        .await
        .unwrap();
    invalidations.recv().await.unwrap();

    let token = CancellationToken::new();
    let started = Instant::now();
    let sweeper = spawn_sweeper(engine.clone(), period, token.clone());

    // The first tick fires right away.
    let invalidation = invalidations.recv().await.unwrap();
    assert!(invalidation.scope.affects(&EntityRef::player("hank")));
    assert_eq!(engine.snapshot().await.unwrap().entries().count(), 0);
    assert!(started.elapsed() < period);

    // A failed sweep is retried with the next tick.
    engine
        .set_permission(EntityKind::Player, "hank", permission("build"), true, past)
        .await
        .unwrap();
    invalidations.recv().await.unwrap();
    store.fail_begins(1);

    tokio::time::advance(period).await;
    tokio::task::yield_now().await;
    assert!(engine.entries(&EntityRef::player("hank")).await.unwrap().is_empty());
    assert_eq!(engine.snapshot().await.unwrap().entries().count(), 1);

    let invalidation = invalidations.recv().await.unwrap();
    assert!(invalidation.scope.affects(&EntityRef::player("hank")));
    assert!(started.elapsed() >= period * 2);
    assert_eq!(engine.snapshot().await.unwrap().entries().count(), 0);

    token.cancel();
    sweeper.await.unwrap();
}
