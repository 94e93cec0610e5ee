// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::model::EntityRef;

/// Validation errors raised when mutating the permission model.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Names must not be empty and must not contain whitespace. World and region names
    /// additionally can't contain the `:` and `/` qualifier separators.
    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    /// A region-scoped permission always needs to name the world the region lives in.
    #[error("region '{0}' requires a world")]
    RegionWithoutWorld(String),

    #[error("{0} does not exist")]
    NotFound(EntityRef),

    /// Assigning the parent would make a group its own ancestor.
    #[error("setting parent of '{group}' to '{parent}' would create a cycle")]
    Cycle { group: String, parent: String },

    /// Groups can only be removed after all child groups were detached or removed.
    #[error("group '{0}' still has child groups")]
    HasChildren(String),
}

/// Errors aborting a resolution.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// A parent cycle was found in stored data. The write path rejects cycles, so this only
    /// happens with externally modified storage.
    #[error("inheritance cycle detected at group '{0}'")]
    Cycle(String),
}
