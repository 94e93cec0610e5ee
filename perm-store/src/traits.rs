// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use perm_core::{
    Entity, EntityKind, EntityRef, Entry, Expired, Membership, Model, QualifiedPermission,
    Timestamp,
};

use crate::error::StoreError;

/// Persistent storage of entities, memberships and permission entries.
///
/// Stores can be cloned cheaply, all clones share the same underlying state.
pub trait EntryStore: Clone + Send + Sync + 'static {
    type Transaction: StoreTransaction;

    /// Begins a write transaction.
    ///
    /// Transactions are strictly serialized, any concurrent caller waits here until the running
    /// transaction was committed, rolled back or dropped.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;

    /// Consistent view of all committed state.
    ///
    /// The returned model is never mutated. Writes committed later are only visible in snapshots
    /// taken after the commit.
    fn snapshot(&self) -> impl Future<Output = Result<Arc<Model>, StoreError>> + Send;
}

/// Scoped read-modify-write access to a store.
///
/// Reads observe the uncommitted writes of the same transaction. Dropping a transaction without
/// committing it discards all changes and releases the permit.
pub trait StoreTransaction: Send + Sized {
    fn entity(
        &mut self,
        entity: &EntityRef,
    ) -> impl Future<Output = Result<Option<Entity>, StoreError>> + Send;

    fn entities(
        &mut self,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send;

    /// Names of the direct child groups of `group`.
    fn children(
        &mut self,
        group: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Memberships of a player.
    fn memberships(
        &mut self,
        member: &str,
    ) -> impl Future<Output = Result<Vec<Membership>, StoreError>> + Send;

    /// Memberships into a group.
    fn members(
        &mut self,
        group: &str,
    ) -> impl Future<Output = Result<Vec<Membership>, StoreError>> + Send;

    fn entries(
        &mut self,
        entity: &EntityRef,
    ) -> impl Future<Output = Result<Vec<Entry>, StoreError>> + Send;

    /// Inserts or updates an entity, returns true if it was inserted.
    fn put_entity(
        &mut self,
        entity: Entity,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes an entity with all of its entries. Deleting a group also deletes all memberships
    /// into it and fails with [`ModelError::HasChildren`](perm_core::ModelError::HasChildren) if
    /// other groups still inherit from it.
    fn delete_entity(
        &mut self,
        entity: &EntityRef,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Inserts or updates a membership, returns true if it was inserted.
    fn put_membership(
        &mut self,
        membership: Membership,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn delete_membership(
        &mut self,
        member: &str,
        group: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Inserts or updates an entry, returns true if it was inserted.
    fn put_entry(&mut self, entry: Entry) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn delete_entry(
        &mut self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes all entries and memberships expired at `now` and returns them.
    fn delete_expired(
        &mut self,
        now: Timestamp,
    ) -> impl Future<Output = Result<Expired, StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
