// SPDX-License-Identifier: MIT OR Apache-2.0

use perm_core::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Write rejected because it would violate a model invariant.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The store is shutting down and does not hand out transactions anymore.
    #[error("store is closed")]
    Closed,

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] crate::sqlite::SqliteError),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Sqlite(crate::sqlite::SqliteError::Sqlite(err))
    }
}
