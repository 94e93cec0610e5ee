// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use perm_core::{
    Entity, EntityKind, EntityRef, Entry, Expired, Membership, Model, QualifiedPermission,
    Resolution, Timestamp,
};
use perm_store::memory::{MemoryStore, MemoryTransaction};
use perm_store::sqlite::SqliteStore;
use perm_store::{EntryStore, StoreError, StoreTransaction};
use tokio::sync::watch;

use crate::config::Config;
use crate::engine::Permissions;
use crate::synchronizer::CapabilitySink;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

pub fn memory_engine() -> Arc<Permissions<MemoryStore>> {
    Arc::new(Permissions::new(MemoryStore::new(), Config::default()))
}

pub async fn sqlite_engine() -> Arc<Permissions<SqliteStore>> {
    Arc::new(Permissions::new(SqliteStore::temporary().await, Config::default()))
}

pub fn faulty_engine() -> (Arc<Permissions<FaultyStore>>, FaultyStore) {
    let store = FaultyStore::default();
    let engine = Arc::new(Permissions::new(store.clone(), Config::default()));
    (engine, store)
}

/// In-memory store which can be told to fail the next transactions.
#[derive(Clone, Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    failing_begins: Arc<AtomicUsize>,
    failing_commits: Arc<AtomicUsize>,
}

impl FaultyStore {
    /// Lets the next `count` calls to `begin` fail.
    pub fn fail_begins(&self, count: usize) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }

    /// Lets the next `count` commits fail, their changes are discarded.
    pub fn fail_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
        .is_ok()
}

impl EntryStore for FaultyStore {
    type Transaction = FaultyTransaction;

    async fn begin(&self) -> Result<FaultyTransaction, StoreError> {
        if take_failure(&self.failing_begins) {
            return Err(StoreError::Closed);
        }

        Ok(FaultyTransaction {
            inner: self.inner.begin().await?,
            failing_commits: self.failing_commits.clone(),
        })
    }

    async fn snapshot(&self) -> Result<Arc<Model>, StoreError> {
        self.inner.snapshot().await
    }
}

#[derive(Debug)]
pub struct FaultyTransaction {
    inner: MemoryTransaction,
    failing_commits: Arc<AtomicUsize>,
}

impl StoreTransaction for FaultyTransaction {
    async fn entity(&mut self, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
        self.inner.entity(entity).await
    }

    async fn entities(&mut self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        self.inner.entities(kind).await
    }

    async fn children(&mut self, group: &str) -> Result<Vec<String>, StoreError> {
        self.inner.children(group).await
    }

    async fn memberships(&mut self, member: &str) -> Result<Vec<Membership>, StoreError> {
        self.inner.memberships(member).await
    }

    async fn members(&mut self, group: &str) -> Result<Vec<Membership>, StoreError> {
        self.inner.members(group).await
    }

    async fn entries(&mut self, entity: &EntityRef) -> Result<Vec<Entry>, StoreError> {
        self.inner.entries(entity).await
    }

    async fn put_entity(&mut self, entity: Entity) -> Result<bool, StoreError> {
        self.inner.put_entity(entity).await
    }

    async fn delete_entity(&mut self, entity: &EntityRef) -> Result<bool, StoreError> {
        self.inner.delete_entity(entity).await
    }

    async fn put_membership(&mut self, membership: Membership) -> Result<bool, StoreError> {
        self.inner.put_membership(membership).await
    }

    async fn delete_membership(&mut self, member: &str, group: &str) -> Result<bool, StoreError> {
        self.inner.delete_membership(member, group).await
    }

    async fn put_entry(&mut self, entry: Entry) -> Result<bool, StoreError> {
        self.inner.put_entry(entry).await
    }

    async fn delete_entry(
        &mut self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> Result<bool, StoreError> {
        self.inner.delete_entry(entity, permission).await
    }

    async fn delete_expired(&mut self, now: Timestamp) -> Result<Expired, StoreError> {
        self.inner.delete_expired(now).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        if take_failure(&self.failing_commits) {
            self.inner.rollback().await?;
            return Err(StoreError::Closed);
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

/// Capability sink remembering the last installed permission set.
#[derive(Debug)]
pub struct RecordingSink {
    installed: watch::Sender<Option<Arc<Resolution>>>,
    installs: AtomicUsize,
    detached: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        let (installed, _) = watch::channel(None);
        Arc::new(Self {
            installed,
            installs: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
        })
    }

    pub fn current(&self) -> Option<Arc<Resolution>> {
        self.installed.borrow().clone()
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Waits until an installed set matches `predicate`, panics after a few seconds.
    pub async fn wait_until<F>(&self, predicate: F) -> Arc<Resolution>
    where
        F: Fn(&Resolution) -> bool,
    {
        let mut rx = self.installed.subscribe();
        let installed = tokio::time::timeout(
            WAIT_TIMEOUT,
            rx.wait_for(|installed| installed.as_deref().is_some_and(&predicate)),
        )
        .await
        .expect("expected permissions were installed in time")
        .expect("sink is alive");

        installed.clone().expect("predicate matched an installed set")
    }

    /// Waits until the sink was detached, panics after a few seconds.
    pub async fn wait_detached(&self) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !self.is_detached() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sink was detached in time");
    }
}

impl CapabilitySink for RecordingSink {
    fn install(&self, resolution: Arc<Resolution>) {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.installed.send_replace(Some(resolution));
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.installed.send_replace(None);
    }
}
