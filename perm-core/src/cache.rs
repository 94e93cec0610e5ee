// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent memoisation of resolution results.
//!
//! Every cached value is tagged with the generation it was computed at. Writers bump the
//! generation after committing and invalidate with the new value: this raises a watermark for
//! every affected entity (or a global one) and removes affected keys. A value computed at a
//! generation below the watermark of its entity is never served and never kept, even if the
//! computing reader inserts it after the invalidation ran. Readers therefore have to read the
//! generation _before_ loading the model snapshot they resolve against.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::model::{EntityKind, EntityRef};
use crate::resolver::{Context, Resolution};
use crate::time::Timestamp;

/// Identifies one resolution: the entity and the exact context it was resolved in.
///
/// Regions are kept in the order they were given, as order changes the resolved value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: EntityRef,
    pub context: Context,
}

impl CacheKey {
    pub fn new(entity: EntityRef, context: Context) -> Self {
        Self { entity, context }
    }
}

/// Which cached results a mutation affects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Results of a single entity.
    Entity(EntityRef),

    /// Results of a set of entities, usually a mutated entity together with its dependents
    /// (descendant groups and their members) as expanded by the writer.
    Entities(BTreeSet<EntityRef>),

    /// Every cached result.
    All,
}

impl InvalidationScope {
    pub fn affects(&self, entity: &EntityRef) -> bool {
        match self {
            InvalidationScope::Entity(target) => target == entity,
            InvalidationScope::Entities(targets) => targets.contains(entity),
            InvalidationScope::All => true,
        }
    }

    /// Names of all affected players, `None` if every player is affected.
    pub fn players(&self) -> Option<BTreeSet<&str>> {
        let players = match self {
            InvalidationScope::Entity(target) => vec![target],
            InvalidationScope::Entities(targets) => targets.iter().collect(),
            InvalidationScope::All => return None,
        };

        Some(
            players
                .into_iter()
                .filter(|entity| entity.kind == EntityKind::Player)
                .map(|entity| entity.name.as_str())
                .collect(),
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Clone, Debug)]
struct Cached {
    resolution: Arc<Resolution>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct PermissionCache {
    entries: DashMap<CacheKey, Cached>,
    watermarks: DashMap<EntityRef, u64>,
    global_watermark: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached result unless it expired at `now` or was invalidated.
    pub fn get(&self, key: &CacheKey, now: Timestamp) -> Option<Arc<Resolution>> {
        // Copy out before touching the map again, holding a reference into a shard while
        // removing from it would deadlock.
        let lookup = self
            .entries
            .get(key)
            .map(|cached| (cached.generation, cached.resolution.clone()));

        match lookup {
            Some((generation, resolution))
                if generation >= self.watermark(&key.entity) && !resolution.is_expired(now) =>
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(resolution)
            }
            Some((generation, _)) => {
                self.entries
                    .remove_if(key, |_, cached| cached.generation == generation);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a result computed at `generation`.
    ///
    /// Returns false if the result was already outdated by an invalidation, in which case it is
    /// not kept.
    pub fn insert(&self, key: CacheKey, resolution: Arc<Resolution>, generation: u64) -> bool {
        if generation < self.watermark(&key.entity) {
            return false;
        }

        self.entries.insert(
            key.clone(),
            Cached {
                resolution,
                generation,
            },
        );

        // An invalidation might have run between the check above and the insert.
        if generation < self.watermark(&key.entity) {
            self.entries
                .remove_if(&key, |_, cached| cached.generation == generation);
            return false;
        }

        true
    }

    /// Drops all results in `scope` computed before `generation` and rejects late inserts of
    /// such results.
    pub fn invalidate(&self, scope: &InvalidationScope, generation: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);

        match scope {
            InvalidationScope::All => {
                let global = self
                    .global_watermark
                    .fetch_max(generation, Ordering::SeqCst)
                    .max(generation);
                self.entries
                    .retain(|_, cached| cached.generation >= generation);
                // Entity watermarks at or below the global one don't reject anything anymore.
                self.watermarks.retain(|_, watermark| *watermark > global);
            }
            InvalidationScope::Entity(entity) => {
                self.raise_watermark(entity, generation);
                self.entries
                    .retain(|key, cached| &key.entity != entity || cached.generation >= generation);
            }
            InvalidationScope::Entities(entities) => {
                for entity in entities {
                    self.raise_watermark(entity, generation);
                }
                self.entries.retain(|key, cached| {
                    !entities.contains(&key.entity) || cached.generation >= generation
                });
            }
        }

        trace!(?scope, generation, "invalidated cached permissions");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn raise_watermark(&self, entity: &EntityRef, generation: u64) {
        self.watermarks
            .entry(entity.clone())
            .and_modify(|watermark| *watermark = (*watermark).max(generation))
            .or_insert(generation);
    }

    fn watermark(&self, entity: &EntityRef) -> u64 {
        let global = self.global_watermark.load(Ordering::SeqCst);
        let local = self
            .watermarks
            .get(entity)
            .map(|watermark| *watermark)
            .unwrap_or_default();
        global.max(local)
    }
}
