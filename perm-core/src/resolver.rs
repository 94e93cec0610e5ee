// SPDX-License-Identifier: MIT OR Apache-2.0

//! Computes effective permission sets from a [`Model`].
//!
//! A player's groups are applied from lowest to highest priority, every group with its full
//! inheritance chain from the root ancestor down to the group itself. Entries found directly on
//! the player record are applied last. At every visited entity entries are applied with
//! increasing specificity: global entries first, then entries for the current world and finally
//! entries for each active region in the order given by the caller. Every step overwrites values
//! set by earlier steps, so the most specific grant wins.
//!
//! Among groups of equal priority the group whose lower-cased name sorts first wins.
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ResolveError;
use crate::model::{Entity, EntityRef, Entry, Model, QualifiedPermission};
use crate::time::Timestamp;

/// World and ordered set of active regions a subject is currently in.
///
/// Region order matters: on conflicting region-scoped entries the last region wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Context {
    world: String,
    regions: Vec<String>,
}

impl Context {
    pub fn new(world: &str) -> Self {
        Self {
            world: world.to_lowercase(),
            regions: Vec::new(),
        }
    }

    pub fn with_regions<I, R>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: AsRef<str>,
    {
        self.regions = regions
            .into_iter()
            .map(|region| region.as_ref().to_lowercase())
            .collect();
        self
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }
}

/// Effective permission set of a player or group in one context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Lower-cased permission names and their resolved values.
    pub permissions: BTreeMap<String, bool>,

    /// Groups the player is directly assigned to, highest priority first. Always empty when
    /// resolving a group.
    pub assigned: Vec<String>,

    /// Every group which contributed to the result, including inherited ancestors.
    pub groups: BTreeSet<String>,

    /// Earliest expiry among the temporary entries and memberships which contributed. The result
    /// must not be used anymore once this point in time is reached.
    pub expires_at: Option<Timestamp>,
}

impl Resolution {
    pub fn get(&self, permission: &str) -> Option<bool> {
        self.permissions.get(&permission.to_lowercase()).copied()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at.is_reached(now))
    }
}

/// Resolves permissions against one model snapshot at a fixed point in time.
#[derive(Clone, Debug)]
pub struct Resolver<'a> {
    model: &'a Model,
    now: Timestamp,
    default_group: Option<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(model: &'a Model, now: Timestamp) -> Self {
        Self {
            model,
            now,
            default_group: None,
        }
    }

    /// Group players without any live membership implicitly belong to. Ignored if no group with
    /// that name exists.
    pub fn with_default_group(mut self, group: Option<&str>) -> Self {
        self.default_group = group.map(str::to_lowercase);
        self
    }

    /// Groups a player is directly assigned to, highest priority first.
    pub fn membership_chain(&self, player: &str) -> Vec<&'a Entity> {
        let model = self.model;
        let player = player.to_lowercase();

        let mut groups: Vec<&'a Entity> = model
            .memberships_of(&player)
            .filter(|membership| membership.is_live(self.now))
            .filter_map(|membership| model.group(&membership.group))
            .collect();

        if groups.is_empty() {
            if let Some(default) = self
                .default_group
                .as_deref()
                .and_then(|name| model.group(name))
            {
                groups.push(default);
            }
        }

        groups.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        groups
    }

    /// Assigned groups followed by their ancestors, without duplicates.
    pub fn player_groups(&self, player: &str) -> Result<Vec<&'a Entity>, ResolveError> {
        let mut seen = BTreeSet::new();
        let mut groups = Vec::new();

        for group in self.membership_chain(player) {
            for entity in self.model.ancestry(&group.name)?.into_iter().rev() {
                if seen.insert(entity.name.as_str()) {
                    groups.push(entity);
                }
            }
        }

        Ok(groups)
    }

    pub fn resolve_player(
        &self,
        player: &str,
        context: &Context,
    ) -> Result<Resolution, ResolveError> {
        let model = self.model;
        let player = player.to_lowercase();
        let mut acc = Accumulator::new(model, context, self.now);

        for membership in model.memberships_of(&player) {
            if membership.is_live(self.now) && model.group(&membership.group).is_some() {
                acc.observe(membership.expires_at);
            }
        }

        let assigned = self.membership_chain(&player);

        // Lowest priority first, higher priorities overwrite.
        for group in assigned.iter().rev() {
            for entity in model.ancestry(&group.name)? {
                acc.groups.insert(entity.name.clone());
                acc.apply(&entity.entity_ref());
            }
        }
        acc.apply(&EntityRef::player(&player));

        let assigned = assigned.iter().map(|group| group.name.clone()).collect();
        Ok(acc.finish(assigned))
    }

    pub fn resolve_group(
        &self,
        group: &str,
        context: &Context,
    ) -> Result<Resolution, ResolveError> {
        let mut acc = Accumulator::new(self.model, context, self.now);

        for entity in self.model.ancestry(&group.to_lowercase())? {
            acc.groups.insert(entity.name.clone());
            acc.apply(&entity.entity_ref());
        }

        Ok(acc.finish(Vec::new()))
    }
}

struct Accumulator<'a> {
    model: &'a Model,
    context: &'a Context,
    now: Timestamp,
    permissions: BTreeMap<String, bool>,
    groups: BTreeSet<String>,
    expires_at: Option<Timestamp>,
}

impl<'a> Accumulator<'a> {
    fn new(model: &'a Model, context: &'a Context, now: Timestamp) -> Self {
        Self {
            model,
            context,
            now,
            permissions: BTreeMap::new(),
            groups: BTreeSet::new(),
            expires_at: None,
        }
    }

    fn observe(&mut self, expires_at: Option<Timestamp>) {
        if let Some(expires_at) = expires_at {
            self.expires_at = Some(match self.expires_at {
                Some(current) => current.min(expires_at),
                None => expires_at,
            });
        }
    }

    fn apply(&mut self, entity: &EntityRef) {
        let context = self.context;
        let world = context.world();
        let live: Vec<&'a Entry> = self
            .model
            .entries_of(entity)
            .filter(|entry| entry.is_live(self.now))
            .collect();

        self.apply_matching(&live, |permission| permission.world().is_none());
        self.apply_matching(&live, |permission| {
            permission.world() == Some(world) && permission.region().is_none()
        });
        for region in context.regions() {
            self.apply_matching(&live, |permission| {
                permission.world() == Some(world) && permission.region() == Some(region.as_str())
            });
        }
    }

    fn apply_matching<F>(&mut self, entries: &[&Entry], matches: F)
    where
        F: Fn(&QualifiedPermission) -> bool,
    {
        for entry in entries {
            if matches(&entry.permission) {
                self.permissions
                    .insert(entry.permission.permission().to_string(), entry.value);
                self.observe(entry.expires_at);
            }
        }
    }

    fn finish(self, assigned: Vec<String>) -> Resolution {
        Resolution {
            permissions: self.permissions,
            assigned,
            groups: self.groups,
            expires_at: self.expires_at,
        }
    }
}
