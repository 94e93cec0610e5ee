// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service configuration loaded from a TOML file with `PERMS_*` environment overrides.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of all environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "PERMS_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Connection URL of the SQLite database.
    pub database_url: String,

    pub max_connections: u32,

    /// Group players without any membership belong to. Empty disables the fallback.
    pub default_group: Option<String>,

    /// Maximum number of concurrently recomputed live sessions.
    pub workers: usize,

    /// Seconds between two expiry sweeps, `0` disables sweeping.
    pub sweep_interval: u64,

    /// Directory dumps are written to and read from.
    pub dump_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://permissions.sqlite".into(),
            max_connections: 4,
            default_group: Some("default".into()),
            workers: 4,
            sweep_interval: 60,
            dump_directory: PathBuf::from("dumps"),
        }
    }
}

impl Config {
    /// Loads configuration from an optional file and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&source).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides values with `PERMS_*` variables returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("DATABASE_URL") {
            self.database_url = value;
        }
        if let Some(value) = var("MAX_CONNECTIONS") {
            self.max_connections = parse_env("MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = var("DEFAULT_GROUP") {
            self.default_group = Some(value);
        }
        if let Some(value) = var("WORKERS") {
            self.workers = parse_env("WORKERS", &value)?;
        }
        if let Some(value) = var("SWEEP_INTERVAL") {
            self.sweep_interval = parse_env("SWEEP_INTERVAL", &value)?;
        }
        if let Some(value) = var("DUMP_DIRECTORY") {
            self.dump_directory = PathBuf::from(value);
        }

        Ok(())
    }

    pub fn default_group(&self) -> Option<&str> {
        self.default_group
            .as_deref()
            .filter(|group| !group.is_empty())
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval > 0).then(|| Duration::from_secs(self.sweep_interval))
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidEnvVar {
        name: format!("{ENV_PREFIX}{name}"),
        message: err.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },
}
