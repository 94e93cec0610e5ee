// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bulk export and import of the permission model as administrative commands.
//!
//! A dump is a text file with one [`Command`] per line. Importing a dump replays the commands
//! through the regular write path, which keeps all validation in one place.
use std::io::{BufRead, Write};
use std::path::{Component, Path, PathBuf};

use perm_core::{EntityKind, Timestamp};
use perm_store::EntryStore;
use perm_store::memory::MemoryStore;
use thiserror::Error;
use tracing::info;

use crate::admin::{Command, CommandError, EntryAction, GroupAction, PlayerAction, execute};
use crate::config::Config;
use crate::engine::Permissions;
use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("invalid dump file name '{0}'")]
    InvalidName(String),

    #[error("refusing to import into a non-empty database")]
    NotEmpty,

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: CommandError,
    },

    #[error("line {line}: {source}")]
    Apply {
        line: usize,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolves a dump file name inside `directory`.
///
/// Only plain file names are accepted, paths and hidden files are rejected.
pub fn dump_path(directory: &Path, name: &str) -> Result<PathBuf, DumpError> {
    let invalid = || DumpError::InvalidName(name.to_string());

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) if !name.starts_with('.') => {
            Ok(directory.join(file))
        }
        _ => Err(invalid()),
    }
}

/// Commands recreating the current state. Expired items are left out and temporary items get
/// the time remaining at `now`.
pub async fn export_commands<S>(
    engine: &Permissions<S>,
    now: Timestamp,
) -> Result<Vec<Command>, EngineError>
where
    S: EntryStore,
{
    let model = engine.snapshot().await?;
    let mut commands = Vec::new();
    let mut hierarchy = Vec::new();

    // Groups have to exist before other groups can inherit from them.
    for group in model.entities(EntityKind::Group) {
        let name = group.display_name.clone();
        commands.push(Command::Group {
            name: name.clone(),
            action: GroupAction::Create,
        });
        if group.priority != 0 {
            hierarchy.push(Command::Group {
                name: name.clone(),
                action: GroupAction::SetPriority(group.priority),
            });
        }
        if let Some(parent) = &group.parent {
            hierarchy.push(Command::Group {
                name,
                action: GroupAction::SetParent(Some(parent.clone())),
            });
        }
    }
    commands.extend(hierarchy);

    for entry in model.entries() {
        let action = match entry.expires_at {
            None => EntryAction::Set(entry.permission.clone(), entry.value),
            Some(expires_at) => match expires_at.remaining(now) {
                Some(remaining) => {
                    EntryAction::SetTemp(entry.permission.clone(), entry.value, remaining)
                }
                None => continue,
            },
        };

        let name = model
            .entity(&entry.entity)
            .map(|entity| entity.display_name.clone())
            .unwrap_or_else(|| entry.entity.name.clone());

        commands.push(match entry.entity.kind {
            EntityKind::Player => Command::Player {
                name,
                action: PlayerAction::Entry(action),
            },
            EntityKind::Group => Command::Group {
                name,
                action: GroupAction::Entry(action),
            },
        });
    }

    for membership in model.memberships() {
        let duration = match membership.expires_at {
            None => None,
            Some(expires_at) => match expires_at.remaining(now) {
                Some(remaining) => Some(remaining),
                None => continue,
            },
        };

        commands.push(Command::Group {
            name: membership.group.clone(),
            action: GroupAction::Add {
                player: membership.member.clone(),
                duration,
            },
        });
    }

    Ok(commands)
}

/// Writes a dump of the current state, returns the number of written commands.
pub async fn export<S, W>(engine: &Permissions<S>, mut writer: W) -> Result<usize, DumpError>
where
    S: EntryStore,
    W: Write,
{
    let commands = export_commands(engine, Timestamp::now()).await?;

    writeln!(writer, "# permission dump")?;
    for command in &commands {
        writeln!(writer, "{command}")?;
    }
    writer.flush()?;

    info!(commands = commands.len(), "exported permissions");
    Ok(commands.len())
}

/// Replays a dump into an empty database, returns the number of applied commands.
///
/// The whole dump is parsed and applied to an in-memory database before the first command
/// reaches `engine`, so malformed or conflicting dumps leave it untouched. A storage failure
/// while applying can still leave a partial import behind, which has to be purged before
/// importing again.
pub async fn import<S, R>(engine: &Permissions<S>, reader: R) -> Result<usize, DumpError>
where
    S: EntryStore,
    R: BufRead,
{
    if !engine.is_empty().await? {
        return Err(DumpError::NotEmpty);
    }

    let mut commands = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let command =
            Command::parse_line(&line).map_err(|source| DumpError::Parse {
                line: index + 1,
                source,
            })?;
        if let Some(command) = command {
            commands.push((index + 1, command));
        }
    }

    // Rehearse on an empty in-memory copy first. Starting from an empty database, every command
    // rejected there would be rejected at the same point here, and applying the dump for real
    // only leaves a partial import behind if the storage itself fails.
    let rehearsal = Permissions::new(MemoryStore::new(), Config::clone(&engine.config()));
    for (line, command) in &commands {
        execute(&rehearsal, command.clone())
            .await
            .map_err(|source| DumpError::Apply {
                line: *line,
                source,
            })?;
    }

    let applied = commands.len();
    for (line, command) in commands {
        execute(engine, command)
            .await
            .map_err(|source| DumpError::Apply { line, source })?;
    }

    info!(commands = applied, "imported permissions");
    Ok(applied)
}
