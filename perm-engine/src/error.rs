// SPDX-License-Identifier: MIT OR Apache-2.0

use perm_core::{EntityRef, ModelError, ResolveError};
use perm_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected input or a write which would violate a model invariant. Nothing was changed.
    #[error(transparent)]
    Validation(ModelError),

    /// A mutation referenced an entity which does not exist.
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// Stored data is inconsistent, for example contains an inheritance cycle.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Storage failed. Transactions are rolled back and no invalidation happened.
    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotFound(entity) => EngineError::NotFound(entity),
            err => EngineError::Validation(err),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Model(err) => err.into(),
            err => EngineError::Store(err),
        }
    }
}
