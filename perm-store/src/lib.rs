// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage backends for the permission model.
//!
//! All writes go through a [`StoreTransaction`] obtained from [`EntryStore::begin`].
//! Transactions are strictly serialized: a transaction holds a permit until it is committed,
//! rolled back or dropped, the latter discarding all of its changes. Committed state is read
//! through immutable [`Model`](perm_core::Model) snapshots.
mod error;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(test)]
mod tests;
#[cfg(any(test, feature = "test_utils"))]
mod test_utils;
mod traits;

pub use error::StoreError;
pub use traits::{EntryStore, StoreTransaction};
