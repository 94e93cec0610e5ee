// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entities, memberships and permission entries together with an indexed in-memory [`Model`].
//!
//! Names of entities, permissions, worlds and regions are case-insensitive and are stored
//! lower-cased. Entities additionally remember the display name they were first created with.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ResolveError};
use crate::time::Timestamp;

/// Validates and lower-cases a name.
///
/// Names must not be empty and can't contain whitespace. The `kind` is only used for error
/// reporting.
pub fn normalize_name(kind: &'static str, name: &str) -> Result<String, ModelError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ModelError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(name.to_lowercase())
}

/// Permission, world and region names can't contain the separators of the qualified permission
/// syntax, otherwise they would not survive being written out and parsed again.
fn normalize_scope(kind: &'static str, name: &str) -> Result<String, ModelError> {
    if name.contains([':', '/']) {
        return Err(ModelError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    normalize_name(kind, name)
}

/// Rejects making `parent` the parent of `group` if `group` would become its own ancestor.
///
/// `parent_of` looks up the current parent of a group. The walk stops at groups without a parent
/// and at cycles which are already stored further up and don't involve `group`.
pub fn check_parent<F>(group: &str, parent: &str, mut parent_of: F) -> Result<(), ModelError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut visited = BTreeSet::new();
    let mut current = Some(parent.to_string());

    while let Some(name) = current {
        if name == group {
            return Err(ModelError::Cycle {
                group: group.to_string(),
                parent: parent.to_string(),
            });
        }
        current = parent_of(&name);
        if !visited.insert(name) {
            break;
        }
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Player,
    Group,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Group => "group",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "player" => Ok(EntityKind::Player),
            "group" => Ok(EntityKind::Group),
            _ => Err(ModelError::InvalidName {
                kind: "entity kind",
                name: value.to_string(),
            }),
        }
    }
}

/// Identifies a player or group by its lower-cased name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    /// Reference to an entity. The name is lower-cased but not validated.
    pub fn new(kind: EntityKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_lowercase(),
        }
    }

    pub fn player(name: &str) -> Self {
        Self::new(EntityKind::Player, name)
    }

    pub fn group(name: &str) -> Self {
        Self::new(EntityKind::Group, name)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Player or group record.
///
/// Only groups make use of `parent` and `priority`. A group's parent is the lower-cased name of
/// another group; dangling parents are treated like no parent at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub name: String,
    pub display_name: String,
    pub parent: Option<String>,
    pub priority: i32,
}

impl Entity {
    pub fn new(kind: EntityKind, display_name: &str) -> Result<Self, ModelError> {
        let name = normalize_name(kind.as_str(), display_name)?;
        Ok(Self {
            kind,
            name,
            display_name: display_name.to_string(),
            parent: None,
            priority: 0,
        })
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            name: self.name.clone(),
        }
    }
}

/// Assignment of a player to a group, optionally until a point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub member: String,
    pub group: String,
    pub expires_at: Option<Timestamp>,
}

impl Membership {
    pub fn new(member: &str, group: &str) -> Result<Self, ModelError> {
        Ok(Self {
            member: normalize_name("player", member)?,
            group: normalize_name("group", group)?,
            expires_at: None,
        })
    }

    pub fn with_expiry(mut self, expires_at: Option<Timestamp>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        !self.expires_at.is_some_and(|expires_at| expires_at.is_reached(now))
    }
}

/// Permission name with an optional world and region qualifier.
///
/// The textual form is `[[region/]world:]permission`, for example `build.place`,
/// `nether:build.place` or `spawn/overworld:build.place`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedPermission {
    permission: String,
    world: Option<String>,
    region: Option<String>,
}

impl QualifiedPermission {
    /// Globally applying permission.
    pub fn new(permission: &str) -> Result<Self, ModelError> {
        Self::scoped(permission, None, None)
    }

    pub fn scoped(
        permission: &str,
        world: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self, ModelError> {
        let permission = normalize_scope("permission", permission)?;
        let world = world.map(|world| normalize_scope("world", world)).transpose()?;
        let region = region
            .map(|region| normalize_scope("region", region))
            .transpose()?;

        if let (None, Some(region)) = (&world, &region) {
            return Err(ModelError::RegionWithoutWorld(region.clone()));
        }

        Ok(Self {
            permission,
            world,
            region,
        })
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn world(&self) -> Option<&str> {
        self.world.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl FromStr for QualifiedPermission {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            None => Self::new(value),
            Some((scope, permission)) => match scope.split_once('/') {
                None => Self::scoped(permission, Some(scope), None),
                Some((region, world)) => Self::scoped(permission, Some(world), Some(region)),
            },
        }
    }
}

impl fmt::Display for QualifiedPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.world, &self.region) {
            (Some(world), Some(region)) => write!(f, "{region}/{world}:{}", self.permission),
            (Some(world), None) => write!(f, "{world}:{}", self.permission),
            _ => f.write_str(&self.permission),
        }
    }
}

/// Explicit grant (`true`) or denial (`false`) of a permission for an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entity: EntityRef,
    pub permission: QualifiedPermission,
    pub value: bool,
    pub expires_at: Option<Timestamp>,
}

impl Entry {
    pub fn new(entity: EntityRef, permission: QualifiedPermission, value: bool) -> Self {
        Self {
            entity,
            permission,
            value,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<Timestamp>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        !self.expires_at.is_some_and(|expires_at| expires_at.is_reached(now))
    }
}

/// Items removed by an expiry sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expired {
    pub entries: Vec<Entry>,
    pub memberships: Vec<Membership>,
}

impl Expired {
    pub fn len(&self) -> usize {
        self.entries.len() + self.memberships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.memberships.is_empty()
    }
}

/// Indexed view of all entities, memberships and entries.
///
/// Stores hand out models wrapped in an `Arc` as read snapshots, a shared model is never mutated.
/// Mutating methods are used by stores to stage changes and by tests to build fixtures.
#[derive(Clone, Debug, Default)]
pub struct Model {
    entities: BTreeMap<EntityRef, Entity>,
    /// Parent group name to names of its direct child groups.
    children: BTreeMap<String, BTreeSet<String>>,
    /// Member name to group name to membership.
    memberships: BTreeMap<String, BTreeMap<String, Membership>>,
    /// Group name to names of its members.
    members: BTreeMap<String, BTreeSet<String>>,
    entries: BTreeMap<EntityRef, BTreeMap<QualifiedPermission, Entry>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.memberships.is_empty() && self.entries.is_empty()
    }

    pub fn entity(&self, entity: &EntityRef) -> Option<&Entity> {
        self.entities.get(entity)
    }

    pub fn group(&self, name: &str) -> Option<&Entity> {
        self.entity(&EntityRef::group(name))
    }

    pub fn entities(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities
            .values()
            .filter(move |entity| entity.kind == kind)
    }

    /// Direct child groups of `group`.
    pub fn children(&self, group: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(group)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// All groups inheriting from `group`, directly or transitively, not including itself.
    pub fn descendants(&self, group: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.children(group).collect();

        while let Some(child) = queue.pop_front() {
            if child == group || !found.insert(child.to_string()) {
                continue;
            }
            queue.extend(self.children(child));
        }

        found
    }

    /// Inheritance chain of `group` ordered from the root ancestor down to the group itself.
    ///
    /// Returns an empty chain for unknown groups. A dangling parent reference ends the chain.
    pub fn ancestry(&self, group: &str) -> Result<Vec<&Entity>, ResolveError> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        let mut next = self.group(group);

        while let Some(entity) = next {
            if !visited.insert(entity.name.as_str()) {
                return Err(ResolveError::Cycle(entity.name.clone()));
            }
            chain.push(entity);
            next = entity
                .parent
                .as_deref()
                .and_then(|parent| self.group(parent));
        }

        chain.reverse();
        Ok(chain)
    }

    pub fn memberships(&self) -> impl Iterator<Item = &Membership> {
        self.memberships.values().flat_map(|groups| groups.values())
    }

    pub fn memberships_of(&self, member: &str) -> impl Iterator<Item = &Membership> {
        self.memberships
            .get(member)
            .into_iter()
            .flat_map(|groups| groups.values())
    }

    pub fn members_of(&self, group: &str) -> impl Iterator<Item = &Membership> {
        self.members
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(move |member| {
                self.memberships
                    .get(member)
                    .and_then(|groups| groups.get(group))
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().flat_map(|entries| entries.values())
    }

    pub fn entries_of(&self, entity: &EntityRef) -> impl Iterator<Item = &Entry> {
        self.entries
            .get(entity)
            .into_iter()
            .flat_map(|entries| entries.values())
    }

    pub fn entry(&self, entity: &EntityRef, permission: &QualifiedPermission) -> Option<&Entry> {
        self.entries
            .get(entity)
            .and_then(|entries| entries.get(permission))
    }

    /// Names of all players with a record, an entry or a group membership.
    ///
    /// Player records contribute their display name, players only known through memberships their
    /// lower-cased name.
    pub fn player_names(&self) -> BTreeSet<String> {
        let mut names: BTreeMap<&str, &str> = BTreeMap::new();

        for member in self.memberships.keys() {
            names.insert(member, member);
        }
        for entity in self.entries.keys() {
            if entity.kind == EntityKind::Player {
                names.insert(&entity.name, &entity.name);
            }
        }
        for player in self.entities(EntityKind::Player) {
            names.insert(&player.name, &player.display_name);
        }

        names.into_values().map(str::to_string).collect()
    }

    /// Inserts or replaces an entity and keeps the child index in sync.
    ///
    /// Parent references are not validated here, see [`check_parent`]. Returns true if the entity did not exist before.
    pub fn put_entity(&mut self, entity: Entity) -> bool {
        let entity_ref = entity.entity_ref();

        if let Some(previous) = self
            .entities
            .get(&entity_ref)
            .and_then(|previous| previous.parent.clone())
        {
            self.unlink_child(&previous, &entity.name);
        }

        if entity.kind == EntityKind::Group {
            if let Some(parent) = &entity.parent {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(entity.name.clone());
            }
        }

        self.entities.insert(entity_ref, entity).is_none()
    }

    /// Removes an entity with all its entries. Removing a group also removes all memberships
    /// into it, removing a group with child groups is rejected.
    ///
    /// Returns true if an entity record was removed.
    pub fn remove_entity(&mut self, entity: &EntityRef) -> Result<bool, ModelError> {
        if entity.kind == EntityKind::Group && self.children(&entity.name).next().is_some() {
            return Err(ModelError::HasChildren(entity.name.clone()));
        }

        self.entries.remove(entity);

        if entity.kind == EntityKind::Group {
            for member in self.members.remove(&entity.name).unwrap_or_default() {
                if let Some(groups) = self.memberships.get_mut(&member) {
                    groups.remove(&entity.name);
                    if groups.is_empty() {
                        self.memberships.remove(&member);
                    }
                }
            }
        }

        let Some(removed) = self.entities.remove(entity) else {
            return Ok(false);
        };
        if let Some(parent) = &removed.parent {
            self.unlink_child(parent, &removed.name);
        }

        Ok(true)
    }

    /// Inserts or replaces a membership, returns true if it did not exist before.
    pub fn put_membership(&mut self, membership: Membership) -> bool {
        self.members
            .entry(membership.group.clone())
            .or_default()
            .insert(membership.member.clone());
        self.memberships
            .entry(membership.member.clone())
            .or_default()
            .insert(membership.group.clone(), membership)
            .is_none()
    }

    pub fn remove_membership(&mut self, member: &str, group: &str) -> Option<Membership> {
        let groups = self.memberships.get_mut(member)?;
        let removed = groups.remove(group)?;
        if groups.is_empty() {
            self.memberships.remove(member);
        }

        if let Some(members) = self.members.get_mut(group) {
            members.remove(member);
            if members.is_empty() {
                self.members.remove(group);
            }
        }

        Some(removed)
    }

    /// Inserts or replaces an entry, returns true if it did not exist before.
    pub fn put_entry(&mut self, entry: Entry) -> bool {
        self.entries
            .entry(entry.entity.clone())
            .or_default()
            .insert(entry.permission.clone(), entry)
            .is_none()
    }

    pub fn remove_entry(
        &mut self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> Option<Entry> {
        let entries = self.entries.get_mut(entity)?;
        let removed = entries.remove(permission)?;
        if entries.is_empty() {
            self.entries.remove(entity);
        }
        Some(removed)
    }

    /// Removes all entries and memberships which expired at `now`.
    pub fn remove_expired(&mut self, now: Timestamp) -> Expired {
        let stale_entries: Vec<(EntityRef, QualifiedPermission)> = self
            .entries()
            .filter(|entry| !entry.is_live(now))
            .map(|entry| (entry.entity.clone(), entry.permission.clone()))
            .collect();
        let stale_memberships: Vec<(String, String)> = self
            .memberships()
            .filter(|membership| !membership.is_live(now))
            .map(|membership| (membership.member.clone(), membership.group.clone()))
            .collect();

        let mut expired = Expired::default();
        for (entity, permission) in stale_entries {
            expired.entries.extend(self.remove_entry(&entity, &permission));
        }
        for (member, group) in stale_memberships {
            expired
                .memberships
                .extend(self.remove_membership(&member, &group));
        }
        expired
    }

    fn unlink_child(&mut self, parent: &str, child: &str) {
        if let Some(children) = self.children.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                self.children.remove(parent);
            }
        }
    }
}
