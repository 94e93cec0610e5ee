// SPDX-License-Identifier: MIT OR Apache-2.0

//! Permission service on top of `perm-core` and `perm-store`.
//!
//! [`Permissions`] answers permission queries from a shared cache and runs every administrative
//! change as one store transaction followed by a targeted invalidation. A [`Synchronizer`]
//! subscribes to these invalidations and keeps the installed permission sets of all online
//! players current, while [`spawn_sweeper`] periodically removes expired grants and memberships.
//!
//! ```rust,no_run
//! # use perm_core::Context;
//! # async fn run() -> Result<(), perm_engine::EngineError> {
//! let permissions = perm_engine::Permissions::builder()
//!     .database_url("sqlite://permissions.sqlite")
//!     .default_group(Some("default"))
//!     .build()
//!     .await?;
//!
//! permissions.add_member("default", "alice", None).await.ok();
//! let allowed = permissions
//!     .check(&Context::new("world"), "alice", "build")
//!     .await?;
//! # Ok(())
//! # }
//! ```
pub mod admin;
mod builder;
mod config;
pub mod dump;
mod engine;
mod error;
mod sweeper;
mod synchronizer;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use builder::PermissionsBuilder;
pub use config::{Config, ConfigError, ENV_PREFIX};
pub use engine::{Invalidation, Permissions};
pub use error::EngineError;
pub use sweeper::spawn_sweeper;
pub use synchronizer::{CapabilitySink, Synchronizer, SynchronizerError};
