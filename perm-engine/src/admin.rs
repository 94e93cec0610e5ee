// SPDX-License-Identifier: MIT OR Apache-2.0

//! Administrative commands independent of any user interface.
//!
//! Commands are parsed from whitespace separated words, for example
//! `group vip set arena:fly true` or `player alice setgroup vip 7d`, and executed against a
//! [`Permissions`] service. The same grammar is used for interactive shells and for dump files.
use std::fmt;
use std::time::Duration;

use perm_core::{
    CacheStats, Context, Entity, EntityKind, EntityRef, Entry, ModelError, QualifiedPermission,
    Timestamp,
};
use perm_store::EntryStore;
use thiserror::Error;

use crate::engine::Permissions;
use crate::error::EngineError;

/// World `check` resolves in if none was given.
pub const DEFAULT_WORLD: &str = "world";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Player { name: String, action: PlayerAction },
    Group { name: String, action: GroupAction },
    List(EntityKind),
    Check {
        permission: String,
        player: String,
        context: Context,
    },
    CacheClear,
    CacheStats,
    Sweep,
}

/// Changes and queries of permission entries, shared by players and groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryAction {
    /// Value set directly on the entity, ignoring inheritance.
    Get(QualifiedPermission),
    Set(QualifiedPermission, bool),
    SetTemp(QualifiedPermission, bool, Duration),
    Unset(QualifiedPermission),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayerAction {
    Entry(EntryAction),
    Purge,
    /// Assigned groups, highest priority first.
    Groups,
    /// Replaces all memberships of the player.
    SetGroup {
        group: String,
        duration: Option<Duration>,
    },
    Show,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupAction {
    Create,
    Entry(EntryAction),
    Purge,
    Members,
    SetParent(Option<String>),
    SetPriority(i32),
    Add {
        player: String,
        duration: Option<Duration>,
    },
    Remove(String),
    Show,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("unexpected argument '{0}'")]
    Unexpected(String),

    #[error("invalid {what} '{value}'")]
    Invalid { what: &'static str, value: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl Command {
    /// Parses one line, returns `None` for blank lines and `#` comments.
    pub fn parse_line(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        Self::parse(&words).map(Some)
    }

    pub fn parse(words: &[&str]) -> Result<Self, CommandError> {
        let mut words = Words::new(words);

        let command = match words.next("command")? {
            "player" => {
                let name = words.next("player name")?.to_string();
                let action = parse_player_action(&mut words)?;
                Command::Player { name, action }
            }
            "group" => {
                let name = words.next("group name")?.to_string();
                let action = parse_group_action(&mut words)?;
                Command::Group { name, action }
            }
            "list" => match words.next("entity kind")? {
                "players" => Command::List(EntityKind::Player),
                "groups" => Command::List(EntityKind::Group),
                other => return Err(CommandError::Unknown(format!("list {other}"))),
            },
            "check" => {
                let permission = words.next("permission")?.to_lowercase();
                let player = words.next("player name")?.to_string();
                let mut world = DEFAULT_WORLD.to_string();
                let mut regions = Vec::new();
                while let Some(flag) = words.optional() {
                    match flag {
                        "--world" => world = words.next("world")?.to_string(),
                        "--region" => regions.push(words.next("region")?.to_string()),
                        other => return Err(CommandError::Unexpected(other.to_string())),
                    }
                }
                Command::Check {
                    permission,
                    player,
                    context: Context::new(&world).with_regions(regions),
                }
            }
            "cache" => match words.next("cache action")? {
                "clear" => Command::CacheClear,
                "stats" => Command::CacheStats,
                other => return Err(CommandError::Unknown(format!("cache {other}"))),
            },
            "sweep" => Command::Sweep,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        words.finish()?;
        Ok(command)
    }
}

impl fmt::Display for Command {
    /// Formats the command in the grammar accepted by [`Command::parse`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Player { name, action } => {
                write!(f, "player {name} ")?;
                match action {
                    PlayerAction::Entry(action) => write!(f, "{action}"),
                    PlayerAction::Purge => f.write_str("purge"),
                    PlayerAction::Groups => f.write_str("groups"),
                    PlayerAction::SetGroup { group, duration } => {
                        write!(f, "setgroup {group}")?;
                        write_duration(f, duration)
                    }
                    PlayerAction::Show => f.write_str("show"),
                }
            }
            Command::Group { name, action } => {
                write!(f, "group {name} ")?;
                match action {
                    GroupAction::Create => f.write_str("create"),
                    GroupAction::Entry(action) => write!(f, "{action}"),
                    GroupAction::Purge => f.write_str("purge"),
                    GroupAction::Members => f.write_str("members"),
                    GroupAction::SetParent(Some(parent)) => write!(f, "setparent {parent}"),
                    GroupAction::SetParent(None) => f.write_str("setparent"),
                    GroupAction::SetPriority(priority) => write!(f, "setpriority {priority}"),
                    GroupAction::Add { player, duration } => {
                        write!(f, "add {player}")?;
                        write_duration(f, duration)
                    }
                    GroupAction::Remove(player) => write!(f, "remove {player}"),
                    GroupAction::Show => f.write_str("show"),
                }
            }
            Command::List(EntityKind::Player) => f.write_str("list players"),
            Command::List(EntityKind::Group) => f.write_str("list groups"),
            Command::Check {
                permission,
                player,
                context,
            } => {
                write!(f, "check {permission} {player} --world {}", context.world())?;
                for region in context.regions() {
                    write!(f, " --region {region}")?;
                }
                Ok(())
            }
            Command::CacheClear => f.write_str("cache clear"),
            Command::CacheStats => f.write_str("cache stats"),
            Command::Sweep => f.write_str("sweep"),
        }
    }
}

impl fmt::Display for EntryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryAction::Get(permission) => write!(f, "get {permission}"),
            EntryAction::Set(permission, value) => write!(f, "set {permission} {value}"),
            EntryAction::SetTemp(permission, value, duration) => write!(
                f,
                "settemp {permission} {} {value}",
                format_duration(*duration)
            ),
            EntryAction::Unset(permission) => write!(f, "unset {permission}"),
        }
    }
}

fn write_duration(f: &mut fmt::Formatter<'_>, duration: &Option<Duration>) -> fmt::Result {
    match duration {
        Some(duration) => write!(f, " {}", format_duration(*duration)),
        None => Ok(()),
    }
}

fn parse_player_action(words: &mut Words<'_, '_>) -> Result<PlayerAction, CommandError> {
    let action = match words.next("player action")? {
        "purge" => PlayerAction::Purge,
        "groups" => PlayerAction::Groups,
        "show" => PlayerAction::Show,
        "setgroup" => PlayerAction::SetGroup {
            group: words.next("group name")?.to_string(),
            duration: words.optional().map(parse_duration).transpose()?,
        },
        other => PlayerAction::Entry(parse_entry_action(other, words)?),
    };
    Ok(action)
}

fn parse_group_action(words: &mut Words<'_, '_>) -> Result<GroupAction, CommandError> {
    let action = match words.next("group action")? {
        "create" => GroupAction::Create,
        "purge" => GroupAction::Purge,
        "members" => GroupAction::Members,
        "show" => GroupAction::Show,
        "setparent" => GroupAction::SetParent(words.optional().map(str::to_string)),
        "setpriority" => {
            let value = words.next("priority")?;
            let priority = value.parse().map_err(|_| CommandError::Invalid {
                what: "priority",
                value: value.to_string(),
            })?;
            GroupAction::SetPriority(priority)
        }
        "add" => GroupAction::Add {
            player: words.next("player name")?.to_string(),
            duration: words.optional().map(parse_duration).transpose()?,
        },
        "remove" => GroupAction::Remove(words.next("player name")?.to_string()),
        other => GroupAction::Entry(parse_entry_action(other, words)?),
    };
    Ok(action)
}

fn parse_entry_action(action: &str, words: &mut Words<'_, '_>) -> Result<EntryAction, CommandError> {
    let action = match action {
        "get" => EntryAction::Get(words.next("permission")?.parse()?),
        "set" => {
            let permission = words.next("permission")?.parse()?;
            let value = words.optional().map(parse_bool).transpose()?;
            EntryAction::Set(permission, value.unwrap_or(true))
        }
        "settemp" => {
            let permission = words.next("permission")?.parse()?;
            let duration = parse_duration(words.next("duration")?)?;
            let value = words.optional().map(parse_bool).transpose()?;
            EntryAction::SetTemp(permission, value.unwrap_or(true), duration)
        }
        "unset" => EntryAction::Unset(words.next("permission")?.parse()?),
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(action)
}

fn parse_bool(value: &str) -> Result<bool, CommandError> {
    match value.to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CommandError::Invalid {
            what: "value",
            value: value.to_string(),
        }),
    }
}

/// Parses durations like `90`, `30m` or `1d12h`. Plain numbers are seconds.
pub fn parse_duration(value: &str) -> Result<Duration, CommandError> {
    let invalid = || CommandError::Invalid {
        what: "duration",
        value: value.to_string(),
    };

    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            'w' => 7 * 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        let amount: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

/// Formats a duration in the largest units [`parse_duration`] understands, e.g. `1d2h`.
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u64, char); 4] = [(24 * 60 * 60, 'd'), (60 * 60, 'h'), (60, 'm'), (1, 's')];

    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0".into();
    }

    let mut formatted = String::new();
    for (unit, suffix) in UNITS {
        if secs >= unit {
            formatted.push_str(&format!("{}{suffix}", secs / unit));
            secs %= unit;
        }
    }
    formatted
}

struct Words<'w, 'a> {
    words: &'w [&'a str],
    position: usize,
}

impl<'w, 'a> Words<'w, 'a> {
    fn new(words: &'w [&'a str]) -> Self {
        Self { words, position: 0 }
    }

    fn next(&mut self, what: &'static str) -> Result<&'a str, CommandError> {
        self.optional().ok_or(CommandError::Missing(what))
    }

    fn optional(&mut self) -> Option<&'a str> {
        let word = self.words.get(self.position).copied()?;
        self.position += 1;
        Some(word)
    }

    fn finish(&self) -> Result<(), CommandError> {
        match self.words.get(self.position) {
            Some(word) => Err(CommandError::Unexpected(word.to_string())),
            None => Ok(()),
        }
    }
}

/// Result of an executed command.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// Confirmation of a write.
    Message(String),

    /// Value of a single permission, `None` if it is not set.
    Value {
        permission: String,
        value: Option<bool>,
    },

    Names(Vec<String>),

    /// Record and live entries of an entity. The record is missing for players only known
    /// through entries or memberships.
    Show {
        entity: EntityRef,
        record: Option<Entity>,
        entries: Vec<Entry>,
    },

    Stats(CacheStats),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Message(message) => f.write_str(message),
            Output::Value { permission, value } => match value {
                Some(value) => write!(f, "{permission} = {value}"),
                None => write!(f, "{permission} is not set"),
            },
            Output::Names(names) => {
                if names.is_empty() {
                    return f.write_str("(none)");
                }
                f.write_str(&names.join("\n"))
            }
            Output::Show {
                entity,
                record,
                entries,
            } => {
                match record {
                    Some(record) => write!(f, "{} {}", record.kind, record.display_name)?,
                    None => write!(f, "{} {}", entity.kind, entity.name)?,
                }
                if let Some(record) = record.as_ref().filter(|record| record.kind == EntityKind::Group)
                {
                    write!(f, " (priority {})", record.priority)?;
                    if let Some(parent) = &record.parent {
                        write!(f, " inherits from {parent}")?;
                    }
                }

                let now = Timestamp::now();
                for entry in entries {
                    write!(f, "\n  {} = {}", entry.permission, entry.value)?;
                    if let Some(remaining) = entry.expires_at.and_then(|at| at.remaining(now)) {
                        write!(f, " (expires in {})", format_duration(remaining))?;
                    }
                }
                Ok(())
            }
            Output::Stats(stats) => write!(
                f,
                "{} cached, {} hits, {} misses, {} invalidations",
                stats.entries, stats.hits, stats.misses, stats.invalidations
            ),
        }
    }
}

/// Runs a command against the permission service.
pub async fn execute<S>(engine: &Permissions<S>, command: Command) -> Result<Output, CommandError>
where
    S: EntryStore,
{
    let output = match command {
        Command::Player { name, action } => match action {
            PlayerAction::Entry(action) => {
                execute_entry(engine, EntityKind::Player, &name, action).await?
            }
            PlayerAction::Purge => {
                engine.purge(&EntityRef::player(&name)).await?;
                Output::Message(format!("purged player {name}"))
            }
            PlayerAction::Groups => Output::Names(engine.player_assigned_groups(&name).await?),
            PlayerAction::SetGroup { group, duration } => {
                engine.set_group(&name, &group, expiry(duration)).await?;
                Output::Message(format!("{name} is now in group {group}"))
            }
            PlayerAction::Show => show(engine, EntityRef::player(&name)).await?,
        },
        Command::Group { name, action } => match action {
            GroupAction::Create => {
                if engine.create_group(&name).await? {
                    Output::Message(format!("created group {name}"))
                } else {
                    Output::Message(format!("group {name} already exists"))
                }
            }
            GroupAction::Entry(action) => {
                execute_entry(engine, EntityKind::Group, &name, action).await?
            }
            GroupAction::Purge => {
                engine.purge(&EntityRef::group(&name)).await?;
                Output::Message(format!("purged group {name}"))
            }
            GroupAction::Members => Output::Names(engine.group_members(&name).await?),
            GroupAction::SetParent(parent) => {
                engine.set_parent(&name, parent.as_deref()).await?;
                match parent {
                    Some(parent) => Output::Message(format!("{name} now inherits from {parent}")),
                    None => Output::Message(format!("{name} no longer inherits")),
                }
            }
            GroupAction::SetPriority(priority) => {
                engine.set_priority(&name, priority).await?;
                Output::Message(format!("priority of {name} set to {priority}"))
            }
            GroupAction::Add { player, duration } => {
                if engine.add_member(&name, &player, expiry(duration)).await? {
                    Output::Message(format!("added {player} to {name}"))
                } else {
                    Output::Message(format!("updated membership of {player} in {name}"))
                }
            }
            GroupAction::Remove(player) => {
                if engine.remove_member(&name, &player).await? {
                    Output::Message(format!("removed {player} from {name}"))
                } else {
                    Output::Message(format!("{player} is not a member of {name}"))
                }
            }
            GroupAction::Show => show(engine, EntityRef::group(&name)).await?,
        },
        Command::List(EntityKind::Player) => {
            Output::Names(engine.all_players().await?.into_iter().collect())
        }
        Command::List(EntityKind::Group) => Output::Names(engine.all_groups().await?),
        Command::Check {
            permission,
            player,
            context,
        } => {
            let value = engine.check(&context, &player, &permission).await?;
            Output::Value { permission, value }
        }
        Command::CacheClear => {
            engine.clear_cache();
            Output::Message("cache cleared".into())
        }
        Command::CacheStats => Output::Stats(engine.cache_stats()),
        Command::Sweep => {
            let removed = engine.sweep_expired().await?;
            Output::Message(format!("removed {removed} expired items"))
        }
    };

    Ok(output)
}

async fn execute_entry<S>(
    engine: &Permissions<S>,
    kind: EntityKind,
    name: &str,
    action: EntryAction,
) -> Result<Output, EngineError>
where
    S: EntryStore,
{
    let entity = EntityRef::new(kind, name);

    let output = match action {
        EntryAction::Get(permission) => {
            let value = engine
                .entries(&entity)
                .await?
                .into_iter()
                .find(|entry| entry.permission == permission)
                .map(|entry| entry.value);
            Output::Value {
                permission: permission.to_string(),
                value,
            }
        }
        EntryAction::Set(permission, value) => {
            let message = format!("set {permission} to {value} on {entity}");
            engine
                .set_permission(kind, name, permission, value, None)
                .await?;
            Output::Message(message)
        }
        EntryAction::SetTemp(permission, value, duration) => {
            let message = format!(
                "set {permission} to {value} on {entity} for {}",
                format_duration(duration)
            );
            engine
                .set_permission(kind, name, permission, value, expiry(Some(duration)))
                .await?;
            Output::Message(message)
        }
        EntryAction::Unset(permission) => {
            if engine.unset_permission(&entity, &permission).await? {
                Output::Message(format!("unset {permission} on {entity}"))
            } else {
                Output::Message(format!("{permission} is not set on {entity}"))
            }
        }
    };

    Ok(output)
}

async fn show<S>(engine: &Permissions<S>, entity: EntityRef) -> Result<Output, EngineError>
where
    S: EntryStore,
{
    let record = engine.entity(&entity).await?;
    let entries = engine.entries(&entity).await?;
    if record.is_none() && entries.is_empty() && entity.kind == EntityKind::Group {
        return Err(EngineError::NotFound(entity));
    }

    Ok(Output::Show {
        entity,
        record,
        entries,
    })
}

fn expiry(duration: Option<Duration>) -> Option<Timestamp> {
    duration.map(|duration| Timestamp::now().after(duration))
}
