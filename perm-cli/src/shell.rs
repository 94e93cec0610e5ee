// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interactive shell reading administrative commands from stdin.
//!
//! Besides administrative commands the shell simulates a host with online players: `enter`,
//! `move` and `exit` drive the synchronizer, which prints every permission set it installs.
use std::sync::Arc;

use anyhow::Result;
use perm_core::{Context, Resolution};
use perm_engine::admin::{self, Command, CommandError};
use perm_engine::{CapabilitySink, Permissions, Synchronizer, spawn_sweeper};
use perm_store::sqlite::SqliteStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::{Args, export_file, import_file};

const HELP: &str = "\
player <name> get|set|unset|settemp|purge|groups|setgroup|show ...
group <name> create|get|set|unset|settemp|purge|members|setparent|setpriority|add|remove|show ...
list groups|players
check <permission> <player> [--world <world>] [--region <region>]...
cache clear|stats
sweep
export <file> | import <file>
enter <player> <world> [region]... | move <player> <world> [region]... | exit <player> | online
reload | help | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    /// A simulated player comes online.
    Enter { player: String, context: Context },
    /// A simulated player changes world or regions.
    Move { player: String, context: Context },
    Exit(String),
    Online,
    Reload,
    Export(String),
    Import(String),
    Help,
    Quit,
    Admin(Command),
}

impl ShellCommand {
    pub fn parse_line(line: &str) -> Result<Option<Self>, CommandError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((first, rest)) = words.split_first() else {
            return Ok(None);
        };
        if first.starts_with('#') {
            return Ok(None);
        }

        let command = match (*first, rest) {
            ("enter" | "move", [player, world, regions @ ..]) => {
                let player = player.to_string();
                let context = Context::new(world).with_regions(regions);
                if *first == "enter" {
                    ShellCommand::Enter { player, context }
                } else {
                    ShellCommand::Move { player, context }
                }
            }
            ("enter" | "move", [_]) => return Err(CommandError::Missing("world")),
            ("enter" | "move" | "exit", []) => return Err(CommandError::Missing("player name")),
            ("exit", [player]) => ShellCommand::Exit(player.to_string()),
            ("export" | "import", []) => return Err(CommandError::Missing("file name")),
            ("export", [file]) => ShellCommand::Export(file.to_string()),
            ("import", [file]) => ShellCommand::Import(file.to_string()),
            ("online", []) => ShellCommand::Online,
            ("reload", []) => ShellCommand::Reload,
            ("help", []) => ShellCommand::Help,
            ("quit", []) => ShellCommand::Quit,
            ("exit" | "export" | "import" | "online" | "reload" | "help" | "quit", [_, extra, ..])
            | ("online" | "reload" | "help" | "quit", [extra, ..]) => {
                return Err(CommandError::Unexpected(extra.to_string()));
            }
            _ => ShellCommand::Admin(Command::parse(&words)?),
        };

        Ok(Some(command))
    }
}

/// Prints permission sets installed for a simulated player.
#[derive(Debug)]
struct ConsoleSink {
    player: String,
}

impl CapabilitySink for ConsoleSink {
    fn install(&self, resolution: Arc<Resolution>) {
        let permissions: Vec<String> = resolution
            .permissions
            .iter()
            .map(|(permission, value)| format!("{permission}={value}"))
            .collect();
        println!(
            "[{}] groups: {} | {}",
            self.player,
            resolution.assigned.join(", "),
            permissions.join(" ")
        );
    }

    fn detach(&self) {
        println!("[{}] detached", self.player);
    }
}

pub async fn run(engine: Arc<Permissions<SqliteStore>>, args: &Args) -> Result<()> {
    let config = engine.config();
    let synchronizer = Synchronizer::spawn(engine.clone(), config.workers);
    let token = synchronizer.cancellation_token();
    let sweeper = config
        .sweep_interval()
        .map(|period| spawn_sweeper(engine.clone(), period, token.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                let command = match ShellCommand::parse_line(&line) {
                    Ok(Some(ShellCommand::Quit)) => break,
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(err) => {
                        eprintln!("error: {err}");
                        continue;
                    }
                };

                match handle(&engine, &synchronizer, args, command).await {
                    Ok(Some(output)) => println!("{output}"),
                    Ok(None) => (),
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
        }
    }

    debug!("shutting down shell");
    synchronizer.shutdown().await.ok();
    token.cancel();
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }

    Ok(())
}

async fn handle(
    engine: &Arc<Permissions<SqliteStore>>,
    synchronizer: &Synchronizer,
    args: &Args,
    command: ShellCommand,
) -> Result<Option<String>> {
    let output = match command {
        ShellCommand::Enter { player, context } => {
            let sink = Arc::new(ConsoleSink {
                player: player.clone(),
            });
            synchronizer.enter(&player, context, sink)?;
            None
        }
        ShellCommand::Move { player, context } => {
            synchronizer.context_changed(&player, context)?;
            None
        }
        ShellCommand::Exit(player) => {
            synchronizer.exit(&player)?;
            None
        }
        ShellCommand::Online => Some(synchronizer.online().await?.join("\n")),
        ShellCommand::Reload => {
            engine.reload(args.load_config()?);
            Some("configuration reloaded".into())
        }
        ShellCommand::Export(file) => Some(export_file(engine, &file).await?),
        ShellCommand::Import(file) => Some(import_file(engine, &file).await?),
        ShellCommand::Help => Some(HELP.into()),
        ShellCommand::Quit => None,
        ShellCommand::Admin(command) => Some(admin::execute(&**engine, command).await?.to_string()),
    };

    Ok(output)
}
