//! Adding and revoking delegations.
//!
//! A delegated role has at most one parent at a time. Revoking it removes the
//! role, its keys' listing and its claims; roles it delegated to stay in the
//! graph unreachable (see [`RoleGraph::orphaned_roles`]) until re-delegated.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{RepoError, Result};
use crate::graph::{Role, RoleGraph};
use crate::keys::Key;
use crate::keystore::KeyStore;
use crate::types::{Delegation, PathConstraint, RoleName};

/// Parameters of a single `delegate` call.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub delegatee: String,
    pub keys: Vec<Key>,
    pub paths: PathConstraint,
    pub threshold: u32,
    pub terminating: bool,
}

impl DelegationRequest {
    /// Delegate the glob `patterns` to `delegatee`, threshold 1, non-terminating.
    pub fn new(delegatee: impl Into<String>, keys: Vec<Key>, patterns: Vec<String>) -> Self {
        DelegationRequest {
            delegatee: delegatee.into(),
            keys,
            paths: PathConstraint::Patterns(patterns),
            threshold: 1,
            terminating: false,
        }
    }

    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn terminating(mut self, terminating: bool) -> Self {
        self.terminating = terminating;
        self
    }

    pub fn paths(mut self, paths: PathConstraint) -> Self {
        self.paths = paths;
        self
    }
}

pub struct DelegationEngine<'a> {
    graph: &'a mut RoleGraph,
    keys: &'a mut KeyStore,
}

impl<'a> DelegationEngine<'a> {
    pub fn new(graph: &'a mut RoleGraph, keys: &'a mut KeyStore) -> Self {
        DelegationEngine { graph, keys }
    }

    /// Delegate part of `parent`'s path space to a (possibly new) child role,
    /// created with expiry `expires`.
    ///
    /// All checks run before anything is changed.
    pub fn delegate(&mut self, parent: &RoleName, req: DelegationRequest, expires: DateTime<Utc>) -> Result<()> {
        let child = RoleName::delegated(&req.delegatee)?;
        if req.keys.is_empty() {
            return Err(RepoError::MissingKeys(req.delegatee));
        }
        let parent_role = self.graph.get_role(parent)?;
        if !parent.is_targets_like() {
            return Err(RepoError::InvalidTargetRole(parent.to_string()));
        }

        let mut keyids: Vec<String> = Vec::new();
        for key in &req.keys {
            if !keyids.iter().any(|id| id == key.keyid()) {
                keyids.push(key.keyid().to_string());
            }
        }
        check_threshold(&req.delegatee, req.threshold, keyids.len())?;
        req.paths.validate()?;
        self.check_path_space(parent, &req)?;

        if parent_role.delegation(&req.delegatee).is_some() {
            return Err(RepoError::RoleAlreadyExists(req.delegatee));
        }
        if let Some((other, _)) = self.graph.incoming_delegations(&req.delegatee).first() {
            debug!(role = %req.delegatee, parent = %other, "role is already delegated elsewhere");
            return Err(RepoError::RoleAlreadyExists(req.delegatee));
        }
        if &child == parent || self.graph.delegates_to(&child, parent) {
            return Err(RepoError::InvalidRoleName {
                name: req.delegatee,
                reason: "delegation would create a cycle",
            });
        }

        let mut keys = self.keys.clone();
        for key in &req.keys {
            keys.add(key.public_only())?;
        }

        // Validated; from here on every step succeeds.
        *self.keys = keys;
        if self.graph.contains(&child) {
            self.graph.update_role(&child, |r| {
                r.keyids = keyids.clone();
                r.threshold = req.threshold;
                Ok(())
            })?;
        } else {
            let mut role = Role::new(child.clone(), expires);
            role.keyids = keyids.clone();
            role.threshold = req.threshold;
            self.graph.add_role(role)?;
        }
        let entry = Delegation {
            name: req.delegatee.clone(),
            keyids,
            threshold: req.threshold,
            terminating: req.terminating,
            paths: req.paths,
        };
        self.graph.update_role(parent, |r| {
            r.targets_mut()?.1.push(entry);
            Ok(())
        })?;
        debug!(%parent, delegatee = %child, threshold = req.threshold, "delegated");
        Ok(())
    }

    /// Remove `delegatee` from `parent`'s delegations table and drop the role.
    pub fn revoke(&mut self, parent: &RoleName, delegatee: &str) -> Result<()> {
        let parent_role = self.graph.get_role(parent)?;
        if parent_role.delegation(delegatee).is_none() {
            return Err(RepoError::DelegationNotFound {
                parent: parent.to_string(),
                delegatee: delegatee.to_string(),
            });
        }
        self.graph.update_role(parent, |r| {
            r.targets_mut()?.1.retain(|d| d.name != delegatee);
            Ok(())
        })?;
        let child = RoleName::Delegated(delegatee.to_string());
        if self.graph.incoming_delegations(delegatee).is_empty() && self.graph.contains(&child) {
            let removed = self.graph.remove_role(&child)?;
            let orphans: Vec<_> = removed.delegations().iter().map(|d| d.name.as_str()).collect();
            debug!(%parent, delegatee, ?orphans, "revoked");
        }
        Ok(())
    }

    /// A child of a delegated role may only claim paths its parent was given.
    fn check_path_space(&self, parent: &RoleName, req: &DelegationRequest) -> Result<()> {
        let RoleName::Delegated(parent_name) = parent else { return Ok(()) };
        let allowed = self
            .graph
            .incoming_delegations(parent_name)
            .iter()
            .any(|(_, d)| d.paths.contains(&req.paths));
        if allowed {
            return Ok(());
        }
        Err(RepoError::PathNotDelegated {
            role: parent_name.clone(),
            path: req.paths.entries().join(", "),
        })
    }
}

fn check_threshold(role: &str, threshold: u32, keys: usize) -> Result<()> {
    let reason = if threshold == 0 {
        "threshold must be at least 1"
    } else if threshold as usize > keys {
        "threshold exceeds the number of keys"
    } else {
        return Ok(());
    };
    Err(RepoError::InvalidThreshold { role: role.to_string(), threshold, reason })
}

impl RoleGraph {
    /// Delegated roles no longer reachable from `targets`.
    pub fn orphaned_roles(&self) -> Vec<RoleName> {
        let reachable = self.reachable_from_targets();
        self.roles()
            .map(|r| r.name.clone())
            .filter(|name| matches!(name, RoleName::Delegated(_)) && !reachable.contains(name))
            .collect()
    }
}
