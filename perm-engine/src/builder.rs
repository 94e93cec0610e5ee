// SPDX-License-Identifier: MIT OR Apache-2.0

use perm_store::sqlite::{SqliteStore, SqliteStoreBuilder};
use perm_store::StoreError;

use crate::config::Config;
use crate::engine::Permissions;
use crate::error::EngineError;

#[derive(Debug)]
pub struct PermissionsBuilder {
    config: Config,
    run_migrations: bool,
}

impl Default for PermissionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionsBuilder {
    pub(crate) fn new() -> Self {
        PermissionsBuilder {
            config: Config::default(),
            run_migrations: true,
        }
    }

    /// Replaces all settings made so far.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn database_url(mut self, url: &str) -> Self {
        self.config.database_url = url.to_string();
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    /// Group of players without memberships, `None` disables the fallback.
    pub fn default_group(mut self, group: Option<&str>) -> Self {
        self.config.default_group = group.map(str::to_string);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn default_migrations(mut self, value: bool) -> Self {
        self.run_migrations = value;
        self
    }

    /// Opens the configured SQLite database and migrates it.
    pub async fn build(self) -> Result<Permissions<SqliteStore>, EngineError> {
        let store = SqliteStoreBuilder::new()
            .database_url(&self.config.database_url)
            .max_connections(self.config.max_connections.max(1))
            .run_default_migrations(self.run_migrations)
            .build()
            .await
            .map_err(StoreError::from)?;

        Ok(Permissions::new(store, self.config))
    }
}
