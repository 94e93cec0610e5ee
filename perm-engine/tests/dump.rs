// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use perm_core::{Context, EntityKind, QualifiedPermission, Timestamp};
use perm_engine::dump::{export, import};
use perm_engine::test_utils::{memory_engine, setup_logging, sqlite_engine};

fn permission(value: &str) -> QualifiedPermission {
    value.parse().unwrap()
}

#[tokio::test]
async fn export_and_import_reproduce_effective_permissions() {
    setup_logging();

    let source = memory_engine();
    let in_a_day = Some(Timestamp::now().after(Duration::from_secs(86_400)));

    source.create_group("Default").await.unwrap();
    source.create_group("member").await.unwrap();
    source.create_group("VIP").await.unwrap();
    source.set_parent("member", Some("default")).await.unwrap();
    source.set_parent("vip", Some("member")).await.unwrap();
    source.set_priority("vip", 10).await.unwrap();
    source.set_priority("member", -5).await.unwrap();

    for (kind, name, entry, value, expires_at) in [
        (EntityKind::Group, "default", "build", false, None),
        (EntityKind::Group, "member", "build", true, None),
        (EntityKind::Group, "vip", "arena:fly", true, None),
        (EntityKind::Group, "vip", "spawn/arena:fly", false, None),
        (EntityKind::Player, "Alice", "chat.color", true, in_a_day),
        (EntityKind::Player, "bob", "build", false, None),
        (EntityKind::Player, "carol", "expired", true, Some(Timestamp::from_secs(1))),
    ] {
        source
            .set_permission(kind, name, permission(entry), value, expires_at)
            .await
            .unwrap();
    }
    source.add_member("vip", "alice", None).await.unwrap();
    source.add_member("member", "bob", in_a_day).await.unwrap();

    let mut dump = Vec::new();
    export(&*source, &mut dump).await.unwrap();

    let target = sqlite_engine().await;
    import(&*target, dump.as_slice()).await.unwrap();

    let contexts = [
        Context::new("world"),
        Context::new("arena"),
        Context::new("arena").with_regions(["spawn"]),
    ];
    for player in ["alice", "bob", "carol", "nobody"] {
        for context in &contexts {
            assert_eq!(
                source.player_permissions(context, player).await.unwrap(),
                target.player_permissions(context, player).await.unwrap(),
                "{player} in {context:?}"
            );
        }
    }

    assert_eq!(
        source.all_groups().await.unwrap(),
        target.all_groups().await.unwrap()
    );
    assert_eq!(
        target.player_groups("alice").await.unwrap(),
        vec!["VIP".to_string(), "member".to_string(), "Default".to_string()]
    );
    let membership = &target.memberships("bob").await.unwrap()[0];
    assert!(membership.expires_at.is_some());

    // The expired entry of carol was not exported.
    let dump = String::from_utf8(dump).unwrap();
    assert!(!dump.contains("expired"));
    assert!(dump.contains("group VIP setpriority 10"));
}
