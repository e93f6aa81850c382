//! In-memory model of every role in a repository.
//!
//! All mutations go through [`RoleGraph::update_role`], which applies the change
//! to a copy, validates it, and only then commits it and marks the role dirty.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::errors::{RepoError, Result};
use crate::types::{
    compile_pattern, Delegation, FileMeta, RoleName, SignatureEntry, TargetEntry, TopLevelRole,
};

/// Role-kind specific contents.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleData {
    /// Root's key/threshold table is derived from the top-level roles themselves.
    Root { consistent_snapshot: bool },
    Targets { targets: BTreeMap<String, TargetEntry>, delegations: Vec<Delegation> },
    Snapshot { meta: BTreeMap<String, FileMeta> },
    Timestamp { meta: BTreeMap<String, FileMeta> },
}

impl RoleData {
    fn empty_for(name: &RoleName) -> Self {
        match name {
            RoleName::TopLevel(TopLevelRole::Root) => RoleData::Root { consistent_snapshot: false },
            RoleName::TopLevel(TopLevelRole::Snapshot) => RoleData::Snapshot { meta: BTreeMap::new() },
            RoleName::TopLevel(TopLevelRole::Timestamp) => RoleData::Timestamp { meta: BTreeMap::new() },
            RoleName::TopLevel(TopLevelRole::Targets) | RoleName::Delegated(_) => {
                RoleData::Targets { targets: BTreeMap::new(), delegations: Vec::new() }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub name: RoleName,
    /// Verification keys, in insertion order without duplicates.
    pub keyids: Vec<String>,
    pub threshold: u32,
    /// Keys whose private half is loaded and will sign the next write.
    pub signing_keyids: Vec<String>,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub signatures: Vec<SignatureEntry>,
    pub data: RoleData,
    pub(crate) dirty: bool,
    /// A document for the current `version` exists in the staging area.
    pub(crate) persisted: bool,
    pub(crate) file_meta: Option<FileMeta>,
}

impl Role {
    /// A never-written role at version 1 with no keys and threshold 1.
    pub fn new(name: RoleName, expires: DateTime<Utc>) -> Self {
        let data = RoleData::empty_for(&name);
        Role {
            name,
            keyids: Vec::new(),
            threshold: 1,
            signing_keyids: Vec::new(),
            version: 1,
            expires,
            signatures: Vec::new(),
            data,
            dirty: true,
            persisted: false,
            file_meta: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Pointer to the most recently written document of this role.
    pub fn file_meta(&self) -> Option<&FileMeta> {
        self.file_meta.as_ref()
    }

    pub fn add_keyid(&mut self, keyid: &str) {
        if !self.keyids.iter().any(|id| id == keyid) {
            self.keyids.push(keyid.to_string());
        }
    }

    pub fn targets(&self) -> Option<&BTreeMap<String, TargetEntry>> {
        match &self.data {
            RoleData::Targets { targets, .. } => Some(targets),
            _ => None,
        }
    }

    pub fn delegations(&self) -> &[Delegation] {
        match &self.data {
            RoleData::Targets { delegations, .. } => delegations,
            _ => &[],
        }
    }

    pub fn delegation(&self, delegatee: &str) -> Option<&Delegation> {
        self.delegations().iter().find(|d| d.name == delegatee)
    }

    pub(crate) fn targets_mut(&mut self) -> Result<(&mut BTreeMap<String, TargetEntry>, &mut Vec<Delegation>)> {
        match &mut self.data {
            RoleData::Targets { targets, delegations } => Ok((targets, delegations)),
            _ => Err(RepoError::InvalidTargetRole(self.name.to_string())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(RepoError::InvalidThreshold {
                role: self.name.to_string(),
                threshold: self.threshold,
                reason: "threshold must be at least 1",
            });
        }
        for delegation in self.delegations() {
            if delegation.threshold == 0 {
                return Err(RepoError::InvalidThreshold {
                    role: delegation.name.clone(),
                    threshold: 0,
                    reason: "threshold must be at least 1",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    roles: BTreeMap<RoleName, Role>,
}

impl RoleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph holding the four top-level roles, each expiring at `expires(role)`.
    pub fn with_top_level(expires: impl Fn(TopLevelRole) -> Result<DateTime<Utc>>) -> Result<Self> {
        let roles = TopLevelRole::ALL
            .into_iter()
            .map(|top| Ok((RoleName::from(top), Role::new(top.into(), expires(top)?))))
            .collect::<Result<_>>()?;
        Ok(RoleGraph { roles })
    }

    pub fn get_role(&self, name: &RoleName) -> Result<&Role> {
        self.roles.get(name).ok_or_else(|| RepoError::RoleNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &RoleName) -> bool {
        self.roles.contains_key(name)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn add_role(&mut self, mut role: Role) -> Result<()> {
        if self.roles.contains_key(&role.name) {
            return Err(RepoError::RoleAlreadyExists(role.name.to_string()));
        }
        role.validate()?;
        role.dirty = true;
        debug!(role = %role.name, "role added");
        self.roles.insert(role.name.clone(), role);
        Ok(())
    }

    /// Apply `mutate` to the named role and mark it dirty.
    ///
    /// The mutation runs against a copy; nothing is committed if it or the
    /// subsequent validation fails.
    pub fn update_role<T>(&mut self, name: &RoleName, mutate: impl FnOnce(&mut Role) -> Result<T>) -> Result<T> {
        let current = self.get_role(name)?;
        let mut updated = current.clone();
        let out = mutate(&mut updated)?;
        updated.validate()?;
        updated.dirty = true;
        self.roles.insert(name.clone(), updated);
        Ok(out)
    }

    pub fn mark_clean(&mut self, name: &RoleName) -> Result<()> {
        self.role_mut(name)?.dirty = false;
        Ok(())
    }

    pub fn mark_all_clean(&mut self) {
        for role in self.roles.values_mut() {
            role.dirty = false;
        }
    }

    pub fn dirty_roles(&self) -> Vec<RoleName> {
        self.roles.values().filter(|r| r.dirty).map(|r| r.name.clone()).collect()
    }

    /// Mutable access that leaves the dirty flag alone; used for signing bookkeeping.
    pub(crate) fn role_mut(&mut self, name: &RoleName) -> Result<&mut Role> {
        self.roles.get_mut(name).ok_or_else(|| RepoError::RoleNotFound(name.to_string()))
    }

    pub(crate) fn remove_role(&mut self, name: &RoleName) -> Result<Role> {
        self.roles.remove(name).ok_or_else(|| RepoError::RoleNotFound(name.to_string()))
    }

    pub(crate) fn insert_loaded(&mut self, role: Role) {
        self.roles.insert(role.name.clone(), role);
    }

    /// `targets` followed by every delegated role reachable from it, breadth first
    /// in delegation-table order.
    pub fn reachable_from_targets(&self) -> Vec<RoleName> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([RoleName::TARGETS]);
        while let Some(name) = queue.pop_front() {
            let Some(role) = self.roles.get(&name) else { continue };
            if !seen.insert(name.clone()) {
                continue;
            }
            for delegation in role.delegations() {
                queue.push_back(RoleName::Delegated(delegation.name.clone()));
            }
            order.push(name);
        }
        order
    }

    /// Delegation entries, across all roles, that point at `delegatee`.
    pub fn incoming_delegations(&self, delegatee: &str) -> Vec<(&RoleName, &Delegation)> {
        self.roles
            .values()
            .flat_map(|role| role.delegations().iter().map(move |d| (&role.name, d)))
            .filter(|(_, d)| d.name == delegatee)
            .collect()
    }

    /// Whether `ancestor` can reach `name` through delegations.
    pub fn delegates_to(&self, ancestor: &RoleName, name: &RoleName) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([ancestor.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == name {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(role) = self.roles.get(&current) {
                queue.extend(role.delegations().iter().map(|d| RoleName::Delegated(d.name.clone())));
            }
        }
        false
    }

    pub(crate) fn check_claim(&self, role: &RoleName, path: &str) -> Result<()> {
        if !role.is_targets_like() {
            return Err(RepoError::InvalidTargetRole(role.to_string()));
        }
        self.get_role(role)?;
        if let RoleName::Delegated(name) = role {
            let covered = self.incoming_delegations(name).iter().any(|(_, d)| d.paths.covers(path));
            if !covered {
                return Err(RepoError::PathNotDelegated { role: name.clone(), path: path.to_string() });
            }
        }
        Ok(())
    }

    /// Claim `path` for `role` with the given custom metadata, replacing any earlier claim.
    pub fn set_target_path(&mut self, role: &RoleName, path: &str, custom: Value) -> Result<()> {
        self.set_target_entry(role, path, TargetEntry::with_custom(custom))
    }

    pub fn set_target_entry(&mut self, role: &RoleName, path: &str, entry: TargetEntry) -> Result<()> {
        self.check_claim(role, path)?;
        self.update_role(role, |r| {
            let (targets, _) = r.targets_mut()?;
            let replaced = targets.insert(path.to_string(), entry).is_some();
            debug!(role = %r.name, path, replaced, "target claimed");
            Ok(())
        })
    }

    /// Drop every claimed path of `role` matching the shell glob `pattern`.
    ///
    /// The role is marked dirty even when nothing matches. Returns the number
    /// of paths removed.
    pub fn remove_target_paths(&mut self, role: &RoleName, pattern: &str) -> Result<usize> {
        if !role.is_targets_like() {
            return Err(RepoError::InvalidTargetRole(role.to_string()));
        }
        let pattern = compile_pattern(pattern)?;
        self.update_role(role, |r| {
            let (targets, _) = r.targets_mut()?;
            let before = targets.len();
            targets.retain(|path, _| !pattern.matches(path));
            let removed = before - targets.len();
            debug!(role = %r.name, pattern = pattern.as_str(), removed, "target paths removed");
            Ok(removed)
        })
    }
}
