// SPDX-License-Identifier: MIT OR Apache-2.0

/// Macro to run the same test logic against all store backend implementations.
///
/// This macro takes an async block that will be executed against each store type:
/// - In-memory store (`MemoryStore`)
/// - SQLite store (`SqliteStore`)
///
/// The SQLite store runs on a single connection, loading a snapshot while a transaction of the
/// same test is still open will therefore never finish.
///
/// ## Example
///
/// ```rust
/// # use perm_store::{EntryStore, assert_all_stores};
/// # async fn run() {
/// assert_all_stores!(|store| async {
///     assert!(store.snapshot().await.unwrap().is_empty());
/// });
/// # }
/// ```
#[macro_export]
macro_rules! assert_all_stores {
    (|$store:ident| $test_body:expr) => {
        // Test with MemoryStore.
        {
            let $store = $crate::memory::MemoryStore::new();
            $test_body.await;
        }

        // Test with SqliteStore.
        {
            let $store = $crate::sqlite::SqliteStore::temporary().await;
            $test_body.await;
        }
    };
}
