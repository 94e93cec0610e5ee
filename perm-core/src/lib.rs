// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core types for resolving hierarchical permissions.
//!
//! Subjects (players) are members of groups, groups inherit from a single parent group and every
//! entity carries explicit `true` / `false` grants for permission strings. A grant can be global,
//! bound to a world or bound to a region inside a world.
//!
//! This crate contains the pure parts of the system:
//!
//! - [`Model`]: an indexed, immutable-once-shared view of entities, memberships and entries.
//! - [`Resolver`]: computes the effective permission set of a subject or group in a [`Context`].
//! - [`PermissionCache`]: concurrent memoisation of resolution results with generation-based
//!   invalidation, so results computed from outdated state are never kept after an invalidation.
//!
//! Persistence lives in `perm-store`, the service layer with live session synchronisation in
//! `perm-engine`.
pub mod cache;
mod error;
pub mod model;
pub mod resolver;
mod time;

pub use cache::{CacheKey, CacheStats, InvalidationScope, PermissionCache};
pub use error::{ModelError, ResolveError};
pub use model::{
    Entity, EntityKind, EntityRef, Entry, Expired, Membership, Model, QualifiedPermission,
    check_parent, normalize_name,
};
pub use resolver::{Context, Resolution, Resolver};
pub use time::Timestamp;
