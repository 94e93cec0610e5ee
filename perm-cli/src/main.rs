// SPDX-License-Identifier: MIT OR Apache-2.0

//! `permctl`, administrative command line for the permission service.
//!
//! Runs a single command given as arguments, for example `permctl group vip set arena:fly`, or
//! starts an interactive shell when no command is given. Configuration is read from the file
//! passed with `--config` and `PERMS_*` environment variables.
mod shell;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perm_engine::admin::{self, Command};
use perm_engine::dump::{self, dump_path};
use perm_engine::{Config, Permissions};
use perm_store::sqlite::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

#[derive(Parser, Debug)]
#[command(name = "permctl", version, about, long_about = None)]
pub struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database URL, overrides the configuration.
    #[arg(short, long, value_name = "URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write all permissions as a command dump into the dump directory.
    Export { file: String },

    /// Replay a command dump from the dump directory into an empty database.
    Import { file: String },

    /// Interactive shell with simulated online players (default).
    Shell,

    /// Administrative command, e.g. `player alice setgroup vip` or `check build alice`.
    #[command(external_subcommand)]
    Admin(Vec<String>),
}

impl Args {
    /// Loads the configuration, re-read on every shell `reload`.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        Ok(config)
    }
}

pub async fn export_file(engine: &Permissions<SqliteStore>, name: &str) -> Result<String> {
    let directory = engine.config().dump_directory.clone();
    let path = dump_path(&directory, name)?;
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("failed creating {}", directory.display()))?;
    let file =
        File::create(&path).with_context(|| format!("failed creating {}", path.display()))?;

    let written = dump::export(engine, BufWriter::new(file)).await?;
    Ok(format!("exported {written} commands to {}", path.display()))
}

pub async fn import_file(engine: &Permissions<SqliteStore>, name: &str) -> Result<String> {
    let path = dump_path(&engine.config().dump_directory, name)?;
    let file = File::open(&path).with_context(|| format!("failed opening {}", path.display()))?;

    let applied = dump::import(engine, BufReader::new(file)).await?;
    Ok(format!("imported {applied} commands from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let args = Args::parse();
    let config = args.load_config()?;
    info!(database_url = %config.database_url, "opening permission database");

    let engine = Arc::new(
        Permissions::builder()
            .config(config)
            .build()
            .await
            .context("failed opening permission database")?,
    );

    match &args.command {
        None | Some(Commands::Shell) => shell::run(engine, &args).await?,
        Some(Commands::Export { file }) => println!("{}", export_file(&engine, file).await?),
        Some(Commands::Import { file }) => println!("{}", import_file(&engine, file).await?),
        Some(Commands::Admin(words)) => {
            let words: Vec<&str> = words.iter().map(String::as_str).collect();
            let command = Command::parse(&words)?;
            println!("{}", admin::execute(&*engine, command).await?);
        }
    }

    Ok(())
}
