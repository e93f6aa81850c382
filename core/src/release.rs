//! Ordering a release: root, targets tree, snapshot, timestamp; then publish.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ExpirationConfig;
use crate::errors::{RepoError, Result};
use crate::graph::{RoleData, RoleGraph};
use crate::keystore::KeyStore;
use crate::signing::{consistent_snapshot, SigningCoordinator};
use crate::traits::MetadataStore;
use crate::types::RoleName;

/// Where the repository stands relative to its live metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// In-memory changes not yet staged.
    Mutated,
    /// Staging area holds a complete release.
    Staged,
    /// Staging area has been promoted to live.
    Published,
}

pub struct ReleaseCoordinator<'a> {
    graph: &'a mut RoleGraph,
    keys: &'a mut KeyStore,
    store: &'a dyn MetadataStore,
    expiration: &'a ExpirationConfig,
    now: DateTime<Utc>,
}

impl<'a> ReleaseCoordinator<'a> {
    pub fn new(
        graph: &'a mut RoleGraph,
        keys: &'a mut KeyStore,
        store: &'a dyn MetadataStore,
        expiration: &'a ExpirationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        ReleaseCoordinator { graph, keys, store, expiration, now }
    }

    /// Stage every dirty role, then a fresh snapshot and timestamp.
    ///
    /// Returns the roles written, in write order. On failure the in-memory
    /// graph is restored; the staging area may hold a partial release but the
    /// live tree is never touched.
    pub fn write_all(&mut self, consistent: bool) -> Result<Vec<RoleName>> {
        let saved = self.graph.clone();
        let written = self.write_all_inner(consistent);
        if written.is_err() {
            *self.graph = saved;
        }
        written
    }

    fn write_all_inner(&mut self, consistent: bool) -> Result<Vec<RoleName>> {
        if consistent_snapshot(&*self.graph)? != consistent {
            self.graph.update_role(&RoleName::ROOT, |r| {
                r.data = RoleData::Root { consistent_snapshot: consistent };
                Ok(())
            })?;
        }
        let tree = self.graph.reachable_from_targets();
        let store = self.store;
        let mut signer = SigningCoordinator::new(&mut *self.graph, &mut *self.keys, self.expiration, self.now);
        let mut written = Vec::new();

        for name in std::iter::once(&RoleName::ROOT).chain(tree.iter()) {
            let (dirty, bump) = write_flags(&signer, name)?;
            if dirty {
                signer.write(name, bump, store)?;
                written.push(name.clone());
            }
        }
        drop(signer);

        let mut manifest = BTreeMap::new();
        for name in std::iter::once(&RoleName::ROOT).chain(tree.iter()) {
            match self.graph.get_role(name)?.file_meta() {
                Some(meta) => {
                    manifest.insert(name.file_name(), meta.clone());
                }
                None => warn!(role = %name, "role has never been written; left out of snapshot"),
            }
        }
        self.graph.update_role(&RoleName::SNAPSHOT, |r| {
            r.data = RoleData::Snapshot { meta: manifest };
            Ok(())
        })?;
        let mut signer = SigningCoordinator::new(&mut *self.graph, &mut *self.keys, self.expiration, self.now);
        let (_, bump) = write_flags(&signer, &RoleName::SNAPSHOT)?;
        let snapshot = signer.write(&RoleName::SNAPSHOT, bump, store)?;
        written.push(RoleName::SNAPSHOT);
        drop(signer);

        self.graph.update_role(&RoleName::TIMESTAMP, |r| {
            r.data = RoleData::Timestamp { meta: BTreeMap::from([(RoleName::SNAPSHOT.file_name(), snapshot)]) };
            Ok(())
        })?;
        let mut signer = SigningCoordinator::new(&mut *self.graph, &mut *self.keys, self.expiration, self.now);
        let (_, bump) = write_flags(&signer, &RoleName::TIMESTAMP)?;
        signer.write(&RoleName::TIMESTAMP, bump, store)?;
        written.push(RoleName::TIMESTAMP);
        drop(signer);

        self.prune_staged(&tree)?;
        debug!(roles = written.len(), consistent, "release staged");
        Ok(written)
    }

    /// Remove staged documents of roles that are no longer part of the release.
    fn prune_staged(&self, tree: &[RoleName]) -> Result<()> {
        let keep: BTreeSet<String> = [RoleName::ROOT, RoleName::SNAPSHOT, RoleName::TIMESTAMP]
            .iter()
            .chain(tree)
            .map(RoleName::file_name)
            .collect();
        for file in self.store.list_staged()? {
            if file.ends_with(".json") && !is_release_file(&file, &keep) {
                debug!(%file, "pruning stale staged document");
                self.store.remove_staged(&file)?;
            }
        }
        Ok(())
    }

    /// Promote the staging area to live and mark every role clean.
    ///
    /// `state` must be [`ReleaseState::Staged`]: anything else means the
    /// staging area may hold a partial release.
    pub fn publish(&mut self, state: ReleaseState) -> Result<()> {
        if state != ReleaseState::Staged {
            return Err(RepoError::NotStaged(state));
        }
        self.store.publish()?;
        self.graph.mark_all_clean();
        info!("release published");
        Ok(())
    }
}

/// Whether the role needs writing, and whether that write bumps its version:
/// a role already on disk at its current version gets a new one.
fn write_flags(signer: &SigningCoordinator<'_>, name: &RoleName) -> Result<(bool, bool)> {
    signer.role(name).map(|r| (r.is_dirty(), r.persisted))
}

/// Whether `file` is `<role>.json` or `<version>.<role>.json` for one of the
/// `keep` file names. Names are matched whole, so a role called `2024.q1`
/// keeps `2024.q1.json`.
fn is_release_file(file: &str, keep: &BTreeSet<String>) -> bool {
    if keep.contains(file) {
        return true;
    }
    match file.split_once('.') {
        Some((version, rest)) => {
            !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit()) && keep.contains(rest)
        }
        None => false,
    }
}
