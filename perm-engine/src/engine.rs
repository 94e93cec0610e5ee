// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use perm_core::{
    CacheKey, CacheStats, Context, Entity, EntityKind, EntityRef, Entry, InvalidationScope,
    Membership, Model, PermissionCache, QualifiedPermission, Resolution, Resolver, Timestamp,
    check_parent,
};
use perm_store::sqlite::SqliteStore;
use perm_store::{EntryStore, StoreTransaction};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::builder::PermissionsBuilder;
use crate::config::Config;
use crate::error::EngineError;

/// Number of invalidation events buffered for slow subscribers. Subscribers lagging further
/// behind have to treat everything as invalidated.
const INVALIDATION_CHANNEL_CAPACITY: usize = 1024;

/// Published after every committed write which might have changed a resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
    pub scope: InvalidationScope,
    pub generation: u64,
}

/// Entities whose resolutions a committed write might have changed.
#[derive(Debug, Default)]
struct Touched {
    entities: BTreeSet<EntityRef>,
}

impl Touched {
    fn none() -> Self {
        Self::default()
    }

    fn entity(entity: EntityRef) -> Self {
        Self {
            entities: BTreeSet::from([entity]),
        }
    }

    fn insert(&mut self, entity: EntityRef) {
        self.entities.insert(entity);
    }
}

/// Permission service: cached queries and transactional administration.
///
/// All writes run in a store transaction. After a successful commit the affected cached results
/// are invalidated and an [`Invalidation`] is published to subscribers, for example the
/// [`Synchronizer`](crate::Synchronizer) refreshing live sessions. Failed writes are rolled back
/// and do not invalidate anything.
#[derive(Debug)]
pub struct Permissions<S> {
    store: S,
    cache: PermissionCache,
    config: RwLock<Arc<Config>>,
    generation: AtomicU64,
    invalidations: broadcast::Sender<Invalidation>,
}

impl Permissions<SqliteStore> {
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::new()
    }
}

impl<S> Permissions<S>
where
    S: EntryStore,
{
    pub fn new(store: S, config: Config) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);

        Self {
            store,
            cache: PermissionCache::new(),
            config: RwLock::new(Arc::new(config)),
            generation: AtomicU64::new(0),
            invalidations,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes to invalidations of all writes committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.invalidations.subscribe()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Replaces the configuration and invalidates all cached results.
    ///
    /// Settings consumed at startup like the database URL or the worker count only take effect
    /// after a restart.
    pub fn reload(&self, config: Config) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        self.publish(InvalidationScope::All);
    }

    /// Drops all cached results and refreshes every live session.
    pub fn clear_cache(&self) {
        self.publish(InvalidationScope::All);
    }

    /// Effective permissions of a player or group, served from the cache when possible.
    pub async fn resolve(
        &self,
        entity: EntityRef,
        context: Context,
    ) -> Result<Arc<Resolution>, EngineError> {
        let now = Timestamp::now();
        let key = CacheKey::new(entity, context);
        if let Some(resolution) = self.cache.get(&key, now) {
            return Ok(resolution);
        }

        // The generation needs to be read before the snapshot, so a write committing in between
        // outdates this result.
        let generation = self.generation.load(Ordering::SeqCst);
        let model = self.store.snapshot().await?;
        let config = self.config();
        let resolver = Resolver::new(&model, now).with_default_group(config.default_group());

        let result = match key.entity.kind {
            EntityKind::Player => resolver.resolve_player(&key.entity.name, &key.context),
            EntityKind::Group => resolver.resolve_group(&key.entity.name, &key.context),
        };

        let resolution = match result {
            Ok(resolution) => Arc::new(resolution),
            Err(err) => {
                error!(entity = %key.entity, "aborted permission resolution: {err}");
                return Err(err.into());
            }
        };

        self.cache.insert(key, resolution.clone(), generation);
        Ok(resolution)
    }

    pub async fn player_permissions(
        &self,
        context: &Context,
        player: &str,
    ) -> Result<BTreeMap<String, bool>, EngineError> {
        let resolution = self
            .resolve(EntityRef::player(player), context.clone())
            .await?;
        Ok(resolution.permissions.clone())
    }

    pub async fn group_permissions(
        &self,
        context: &Context,
        group: &str,
    ) -> Result<BTreeMap<String, bool>, EngineError> {
        let resolution = self
            .resolve(EntityRef::group(group), context.clone())
            .await?;
        Ok(resolution.permissions.clone())
    }

    /// Resolved value of a single permission for a player, `None` if it is not set at all.
    pub async fn check(
        &self,
        context: &Context,
        player: &str,
        permission: &str,
    ) -> Result<Option<bool>, EngineError> {
        let resolution = self
            .resolve(EntityRef::player(player), context.clone())
            .await?;
        Ok(resolution.get(permission))
    }

    /// Committed state of the store.
    pub async fn snapshot(&self) -> Result<Arc<Model>, EngineError> {
        Ok(self.store.snapshot().await?)
    }

    pub async fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.snapshot().await?.is_empty())
    }

    /// Players with a record, an entry or a membership.
    pub async fn all_players(&self) -> Result<BTreeSet<String>, EngineError> {
        Ok(self.snapshot().await?.player_names())
    }

    /// Display names of all groups.
    pub async fn all_groups(&self) -> Result<Vec<String>, EngineError> {
        let model = self.snapshot().await?;
        Ok(model
            .entities(EntityKind::Group)
            .map(|group| group.display_name.clone())
            .collect())
    }

    pub async fn entity(&self, entity: &EntityRef) -> Result<Option<Entity>, EngineError> {
        Ok(self.snapshot().await?.entity(entity).cloned())
    }

    /// Live entries set directly on an entity.
    pub async fn entries(&self, entity: &EntityRef) -> Result<Vec<Entry>, EngineError> {
        let now = Timestamp::now();
        let model = self.snapshot().await?;
        Ok(model
            .entries_of(entity)
            .filter(|entry| entry.is_live(now))
            .cloned()
            .collect())
    }

    /// Live memberships of a player.
    pub async fn memberships(&self, player: &str) -> Result<Vec<Membership>, EngineError> {
        let now = Timestamp::now();
        let model = self.snapshot().await?;
        Ok(model
            .memberships_of(&player.to_lowercase())
            .filter(|membership| membership.is_live(now))
            .cloned()
            .collect())
    }

    /// Names of the live members of a group.
    pub async fn group_members(&self, group: &str) -> Result<Vec<String>, EngineError> {
        let now = Timestamp::now();
        let model = self.snapshot().await?;
        Ok(model
            .members_of(&group.to_lowercase())
            .filter(|membership| membership.is_live(now))
            .map(|membership| membership.member.clone())
            .collect())
    }

    /// Display names of the groups a player is directly assigned to, highest priority first.
    ///
    /// Players without any live membership are reported in the default group, if it exists.
    pub async fn player_assigned_groups(&self, player: &str) -> Result<Vec<String>, EngineError> {
        let model = self.snapshot().await?;
        let config = self.config();
        let resolver =
            Resolver::new(&model, Timestamp::now()).with_default_group(config.default_group());
        Ok(resolver
            .membership_chain(player)
            .into_iter()
            .map(|group| group.display_name.clone())
            .collect())
    }

    /// Display names of the assigned groups and all groups they inherit from.
    pub async fn player_groups(&self, player: &str) -> Result<Vec<String>, EngineError> {
        let model = self.snapshot().await?;
        let config = self.config();
        let resolver =
            Resolver::new(&model, Timestamp::now()).with_default_group(config.default_group());
        Ok(resolver
            .player_groups(player)?
            .into_iter()
            .map(|group| group.display_name.clone())
            .collect())
    }

    /// Grants (`true`) or denies (`false`) a permission, creating the entity if needed.
    pub async fn set_permission(
        &self,
        kind: EntityKind,
        name: &str,
        permission: QualifiedPermission,
        value: bool,
        expires_at: Option<Timestamp>,
    ) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<((), Touched), EngineError> = async {
            let entity = ensure_entity(&mut tx, kind, name).await?;
            let entry = Entry::new(entity.entity_ref(), permission, value).with_expiry(expires_at);
            tx.put_entry(entry).await?;
            Ok(((), Touched::entity(entity.entity_ref())))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Removes a permission entry, returns false if it was not set.
    pub async fn unset_permission(
        &self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<(bool, Touched), EngineError> = async {
            require_entity(&mut tx, entity).await?;
            let removed = tx.delete_entry(entity, permission).await?;
            Ok((removed, Touched::entity(entity.clone())))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Creates a group, returns false if it already existed.
    pub async fn create_group(&self, name: &str) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<(bool, Touched), EngineError> = async {
            let group = Entity::new(EntityKind::Group, name)?;
            if tx.entity(&group.entity_ref()).await?.is_some() {
                return Ok((false, Touched::none()));
            }
            let group_ref = group.entity_ref();
            tx.put_entity(group).await?;
            Ok((true, Touched::entity(group_ref)))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Removes an entity with all its entries and memberships.
    ///
    /// Groups which other groups inherit from can't be purged.
    pub async fn purge(&self, entity: &EntityRef) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<((), Touched), EngineError> = async {
            let mut touched = Touched::entity(entity.clone());

            match entity.kind {
                EntityKind::Player => {
                    let memberships = tx.memberships(&entity.name).await?;
                    let has_entries = !tx.entries(entity).await?.is_empty();
                    let removed = tx.delete_entity(entity).await?;
                    if !removed && !has_entries && memberships.is_empty() {
                        return Err(EngineError::NotFound(entity.clone()));
                    }
                    for membership in memberships {
                        tx.delete_membership(&membership.member, &membership.group)
                            .await?;
                    }
                }
                EntityKind::Group => {
                    require_entity(&mut tx, entity).await?;
                    for membership in tx.members(&entity.name).await? {
                        touched.insert(EntityRef::player(&membership.member));
                    }
                    tx.delete_entity(entity).await?;
                }
            }

            Ok(((), touched))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Assigns or clears the parent of a group. Assignments creating a cycle are rejected.
    pub async fn set_parent(&self, group: &str, parent: Option<&str>) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<((), Touched), EngineError> = async {
            let mut entity = require_entity(&mut tx, &EntityRef::group(group)).await?;

            entity.parent = match parent {
                Some(parent) => {
                    let parent = require_entity(&mut tx, &EntityRef::group(parent)).await?;

                    let parents: BTreeMap<String, Option<String>> = tx
                        .entities(EntityKind::Group)
                        .await?
                        .into_iter()
                        .map(|group| (group.name, group.parent))
                        .collect();
                    check_parent(&entity.name, &parent.name, |name| {
                        parents.get(name).cloned().flatten()
                    })?;

                    Some(parent.name)
                }
                None => None,
            };

            let entity_ref = entity.entity_ref();
            tx.put_entity(entity).await?;
            Ok(((), Touched::entity(entity_ref)))
        }
        .await;
        self.finish(tx, result).await
    }

    pub async fn set_priority(&self, group: &str, priority: i32) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<((), Touched), EngineError> = async {
            let mut entity = require_entity(&mut tx, &EntityRef::group(group)).await?;
            entity.priority = priority;
            let entity_ref = entity.entity_ref();
            tx.put_entity(entity).await?;
            Ok(((), Touched::entity(entity_ref)))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Adds a player to a group, optionally until `expires_at`. Returns false if the player was
    /// already a member, in which case only the expiry gets updated.
    pub async fn add_member(
        &self,
        group: &str,
        player: &str,
        expires_at: Option<Timestamp>,
    ) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<(bool, Touched), EngineError> = async {
            let group = require_entity(&mut tx, &EntityRef::group(group)).await?;
            let membership = Membership::new(player, &group.name)?.with_expiry(expires_at);
            let player = EntityRef::player(&membership.member);
            let added = tx.put_membership(membership).await?;
            Ok((added, Touched::entity(player)))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Removes a player from a group, returns false if it was not a member.
    pub async fn remove_member(&self, group: &str, player: &str) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<(bool, Touched), EngineError> = async {
            let group = require_entity(&mut tx, &EntityRef::group(group)).await?;
            let player = EntityRef::player(player);
            let removed = tx.delete_membership(&player.name, &group.name).await?;
            Ok((removed, Touched::entity(player)))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Replaces all memberships of a player with a single one.
    pub async fn set_group(
        &self,
        player: &str,
        group: &str,
        expires_at: Option<Timestamp>,
    ) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<((), Touched), EngineError> = async {
            let group = require_entity(&mut tx, &EntityRef::group(group)).await?;
            let membership = Membership::new(player, &group.name)?.with_expiry(expires_at);
            for previous in tx.memberships(&membership.member).await? {
                tx.delete_membership(&previous.member, &previous.group)
                    .await?;
            }
            let player = EntityRef::player(&membership.member);
            tx.put_membership(membership).await?;
            Ok(((), Touched::entity(player)))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Physically removes expired entries and memberships, returns the number of removed items.
    ///
    /// Resolution already ignores expired items, sweeping them does not change any result.
    pub async fn sweep_expired(&self) -> Result<usize, EngineError> {
        let mut tx = self.store.begin().await?;
        let result: Result<(usize, Touched), EngineError> = async {
            let expired = tx.delete_expired(Timestamp::now()).await?;
            let mut touched = Touched::none();
            for entry in &expired.entries {
                touched.insert(entry.entity.clone());
            }
            for membership in &expired.memberships {
                touched.insert(EntityRef::player(&membership.member));
            }
            Ok((expired.len(), touched))
        }
        .await;
        self.finish(tx, result).await
    }

    /// Commits on success and invalidates everything the write touched, rolls back otherwise.
    async fn finish<R>(
        &self,
        tx: S::Transaction,
        result: Result<(R, Touched), EngineError>,
    ) -> Result<R, EngineError> {
        match result {
            Ok((value, touched)) => {
                tx.commit().await?;
                self.invalidate(touched).await;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("failed rolling back transaction: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    async fn invalidate(&self, touched: Touched) {
        if touched.entities.is_empty() {
            return;
        }

        let scope = match self.store.snapshot().await {
            Ok(model) => {
                let config = self.config();
                dependents(&model, touched.entities, config.default_group())
            }
            Err(err) => {
                warn!("failed loading snapshot after commit, invalidating everything: {err}");
                InvalidationScope::All
            }
        };

        self.publish(scope);
    }

    fn publish(&self, scope: InvalidationScope) {
        // Writes commit before bumping the generation, see `resolve`.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cache.invalidate(&scope, generation);
        debug!(generation, ?scope, "invalidated permissions");

        // Not having any subscribers is fine.
        let _ = self.invalidations.send(Invalidation { scope, generation });
    }
}

/// Expands touched entities to everything inheriting from them.
///
/// A touched group affects its descendant groups and the members of all of them. If the default
/// group is among those every player without a membership is affected as well, which is
/// expressed as invalidating everything.
fn dependents(
    model: &Model,
    touched: BTreeSet<EntityRef>,
    default_group: Option<&str>,
) -> InvalidationScope {
    let default_group = default_group.map(str::to_lowercase);
    let mut scope = BTreeSet::new();

    for entity in touched {
        if entity.kind == EntityKind::Group {
            let mut groups = model.descendants(&entity.name);
            groups.insert(entity.name.clone());

            if default_group
                .as_ref()
                .is_some_and(|default| groups.contains(default))
            {
                return InvalidationScope::All;
            }

            for group in groups {
                for membership in model.members_of(&group) {
                    scope.insert(EntityRef::player(&membership.member));
                }
                scope.insert(EntityRef::group(&group));
            }
        }

        scope.insert(entity);
    }

    InvalidationScope::Entities(scope)
}

async fn ensure_entity<T>(tx: &mut T, kind: EntityKind, name: &str) -> Result<Entity, EngineError>
where
    T: StoreTransaction,
{
    let entity = Entity::new(kind, name)?;
    if let Some(existing) = tx.entity(&entity.entity_ref()).await? {
        return Ok(existing);
    }
    tx.put_entity(entity.clone()).await?;
    Ok(entity)
}

async fn require_entity<T>(tx: &mut T, entity: &EntityRef) -> Result<Entity, EngineError>
where
    T: StoreTransaction,
{
    tx.entity(entity)
        .await?
        .ok_or_else(|| EngineError::NotFound(entity.clone()))
}
