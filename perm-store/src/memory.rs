// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory store, mostly useful for tests and ephemeral setups.
use std::sync::{Arc, PoisonError, RwLock};

use perm_core::{
    Entity, EntityKind, EntityRef, Entry, Expired, Membership, Model, QualifiedPermission,
    Timestamp,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StoreError;
use crate::traits::{EntryStore, StoreTransaction};

/// Keeps the committed model behind a lock and swaps it out on every commit.
///
/// A transaction works on a private copy of the committed model, which makes writes expensive for
/// large models but keeps snapshots free.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    committed: Arc<RwLock<Arc<Model>>>,
    semaphore: Arc<Semaphore>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_model(Model::default())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store starting out with the given model as committed state.
    pub fn from_model(model: Model) -> Self {
        Self {
            committed: Arc::new(RwLock::new(Arc::new(model))),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    fn committed(&self) -> Arc<Model> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EntryStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;

        // Copy only after acquiring the permit, otherwise we might miss the previous commit.
        let staged = Model::clone(&self.committed());

        Ok(MemoryTransaction {
            store: self.clone(),
            staged,
            _permit: permit,
        })
    }

    async fn snapshot(&self) -> Result<Arc<Model>, StoreError> {
        Ok(self.committed())
    }
}

#[derive(Debug)]
pub struct MemoryTransaction {
    store: MemoryStore,
    staged: Model,
    _permit: OwnedSemaphorePermit,
}

impl StoreTransaction for MemoryTransaction {
    async fn entity(&mut self, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(self.staged.entity(entity).cloned())
    }

    async fn entities(&mut self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        Ok(self.staged.entities(kind).cloned().collect())
    }

    async fn children(&mut self, group: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.staged.children(group).map(str::to_string).collect())
    }

    async fn memberships(&mut self, member: &str) -> Result<Vec<Membership>, StoreError> {
        Ok(self.staged.memberships_of(member).cloned().collect())
    }

    async fn members(&mut self, group: &str) -> Result<Vec<Membership>, StoreError> {
        Ok(self.staged.members_of(group).cloned().collect())
    }

    async fn entries(&mut self, entity: &EntityRef) -> Result<Vec<Entry>, StoreError> {
        Ok(self.staged.entries_of(entity).cloned().collect())
    }

    async fn put_entity(&mut self, entity: Entity) -> Result<bool, StoreError> {
        Ok(self.staged.put_entity(entity))
    }

    async fn delete_entity(&mut self, entity: &EntityRef) -> Result<bool, StoreError> {
        Ok(self.staged.remove_entity(entity)?)
    }

    async fn put_membership(&mut self, membership: Membership) -> Result<bool, StoreError> {
        Ok(self.staged.put_membership(membership))
    }

    async fn delete_membership(&mut self, member: &str, group: &str) -> Result<bool, StoreError> {
        Ok(self.staged.remove_membership(member, group).is_some())
    }

    async fn put_entry(&mut self, entry: Entry) -> Result<bool, StoreError> {
        Ok(self.staged.put_entry(entry))
    }

    async fn delete_entry(
        &mut self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> Result<bool, StoreError> {
        Ok(self.staged.remove_entry(entity, permission).is_some())
    }

    async fn delete_expired(&mut self, now: Timestamp) -> Result<Expired, StoreError> {
        Ok(self.staged.remove_expired(now))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut committed = self
            .store
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *committed = Arc::new(self.staged);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
