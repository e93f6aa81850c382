//! The repository context: one role graph, one key store, one metadata store.
//!
//! Every operation goes through a [`Repository`] value; nothing is shared
//! between repositories. A repository directory assumes a single writer at a
//! time. Callers must serialize access themselves (one CI job, an external
//! lock); two processes mutating the same directory can corrupt it.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::config::{RepoConfig, RepoLayout};
use crate::delegation::{DelegationEngine, DelegationRequest};
use crate::errors::{RepoError, Result};
use crate::graph::{Role, RoleData, RoleGraph};
use crate::keys::Key;
use crate::keystore::KeyStore;
use crate::release::{ReleaseCoordinator, ReleaseState};
use crate::signing::{consistent_snapshot, is_verifiable, SigningCoordinator};
use crate::store::{copy_dir, remove_dir_if_exists, FsMetadataStore};
use crate::traits::{Clock, MetadataStore, SystemClock};
use crate::types::{parse_expiry, Delegation, FileMeta, Payload, RoleName, SignedDocument, TargetEntry, TopLevelRole};

pub struct Repository {
    layout: RepoLayout,
    config: RepoConfig,
    graph: RoleGraph,
    keys: KeyStore,
    store: Box<dyn MetadataStore>,
    clock: Box<dyn Clock>,
    state: ReleaseState,
}

impl Repository {
    /// Create the directory layout and a repository holding the four
    /// top-level roles with no keys.
    pub fn create(layout: RepoLayout, config: RepoConfig) -> Result<Self> {
        for dir in [layout.keystore_dir(), layout.targets_dir()] {
            fs::create_dir_all(&dir).map_err(|e| RepoError::io(&dir, e))?;
        }
        let store = FsMetadataStore::open(layout.staged_dir(), layout.live_dir())?;
        Self::create_with(layout, config, Box::new(store), Box::new(SystemClock))
    }

    pub fn create_with(
        layout: RepoLayout,
        config: RepoConfig,
        store: Box<dyn MetadataStore>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        config.expiration.validate()?;
        let now = clock.now();
        let mut graph = RoleGraph::with_top_level(|top| config.expiration.expires_at(&top.into(), now))?;
        let consistent = config.consistent_snapshot;
        graph.update_role(&RoleName::ROOT, |r| {
            r.data = RoleData::Root { consistent_snapshot: consistent };
            Ok(())
        })?;
        info!(root = %layout.root().display(), consistent, "repository created");
        Ok(Repository { layout, config, graph, keys: KeyStore::new(), store, clock, state: ReleaseState::Mutated })
    }

    /// Rebuild a repository from its staged metadata, or its live metadata
    /// when nothing is staged.
    pub fn load(layout: RepoLayout, config: RepoConfig) -> Result<Self> {
        let store = FsMetadataStore::open(layout.staged_dir(), layout.live_dir())?;
        Self::load_with(layout, config, Box::new(store), Box::new(SystemClock))
    }

    pub fn load_with(
        layout: RepoLayout,
        config: RepoConfig,
        store: Box<dyn MetadataStore>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        config.expiration.validate()?;
        let mut repo = Repository {
            layout,
            config,
            graph: RoleGraph::new(),
            keys: KeyStore::new(),
            store,
            clock,
            state: ReleaseState::Published,
        };
        let from_live = repo.store.read_staged(&RoleName::ROOT.file_name())?.is_none();
        repo.load_metadata(from_live)?;

        let timestamp = RoleName::TIMESTAMP.file_name();
        if !from_live && repo.store.read_staged(&timestamp)? != repo.store.read_live(&timestamp)? {
            repo.state = ReleaseState::Staged;
        }
        info!(roles = repo.graph.roles().count(), from_live, "repository loaded");
        Ok(repo)
    }

    fn read_document(&self, from_live: bool, file: &str) -> Result<Option<(SignedDocument, Vec<u8>)>> {
        let raw = if from_live { self.store.read_live(file)? } else { self.store.read_staged(file)? };
        let Some(raw) = raw else { return Ok(None) };
        let doc = serde_json::from_slice(&raw).map_err(|e| RepoError::malformed(file, e))?;
        Ok(Some((doc, raw)))
    }

    fn load_metadata(&mut self, from_live: bool) -> Result<()> {
        let root_file = RoleName::ROOT.file_name();
        let (doc, raw) = self
            .read_document(from_live, &root_file)?
            .ok_or_else(|| RepoError::malformed(&root_file, "no root metadata found"))?;
        let Payload::Root(root) = doc.signed.clone() else {
            return Err(RepoError::malformed(&root_file, "not a root document"));
        };
        for (keyid, meta) in &root.keys {
            self.keys.add(Key::from_metadata(meta)?.with_keyid(keyid.clone()))?;
        }

        for top in TopLevelRole::ALL {
            let name = RoleName::from(top);
            let assigned = root
                .roles
                .get(top.as_str())
                .ok_or_else(|| RepoError::malformed(&root_file, format!("no key assignment for {top}")))?;
            let mut role = match top {
                TopLevelRole::Root => {
                    loaded_role(name, &root_file, doc.clone(), &raw, RoleData::Root {
                        consistent_snapshot: root.consistent_snapshot,
                    })?
                }
                _ => self.load_role(from_live, name)?,
            };
            role.keyids = assigned.keyids.clone();
            role.threshold = assigned.threshold;
            self.graph.insert_loaded(role);
        }

        let mut queue: VecDeque<Delegation> = self.graph.get_role(&RoleName::TARGETS)?.delegations().to_vec().into();
        while let Some(delegation) = queue.pop_front() {
            let name = RoleName::delegated(&delegation.name)?;
            if self.graph.contains(&name) {
                continue;
            }
            let mut role = self.load_role(from_live, name)?;
            role.keyids = delegation.keyids.clone();
            role.threshold = delegation.threshold;
            queue.extend(role.delegations().iter().cloned());
            self.graph.insert_loaded(role);
        }
        Ok(())
    }

    /// Load one non-root role. A role with no document yet starts fresh and dirty.
    fn load_role(&mut self, from_live: bool, name: RoleName) -> Result<Role> {
        let file = name.file_name();
        let Some((doc, raw)) = self.read_document(from_live, &file)? else {
            debug!(role = %name, "no document on disk; starting a fresh role");
            let expires = self.config.expiration.expires_at(&name, self.clock.now())?;
            return Ok(Role::new(name, expires));
        };
        let data = match (&name, doc.signed.clone()) {
            (RoleName::TopLevel(TopLevelRole::Snapshot), Payload::Snapshot(p)) => RoleData::Snapshot { meta: p.meta },
            (RoleName::TopLevel(TopLevelRole::Timestamp), Payload::Timestamp(p)) => RoleData::Timestamp { meta: p.meta },
            (name, Payload::Targets(p)) if name.is_targets_like() => {
                let mut delegations = Vec::new();
                if let Some(table) = p.delegations {
                    for (keyid, meta) in &table.keys {
                        self.keys.add(Key::from_metadata(meta)?.with_keyid(keyid.clone()))?;
                    }
                    for entry in table.roles {
                        delegations.push(Delegation::try_from(entry)?);
                    }
                }
                RoleData::Targets { targets: p.targets, delegations }
            }
            _ => return Err(RepoError::malformed(&file, format!("document type does not match role {name}"))),
        };
        loaded_role(name, &file, doc, &raw, data)
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn graph(&self) -> &RoleGraph {
        &self.graph
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn release_state(&self) -> ReleaseState {
        self.state
    }

    pub fn get_role(&self, name: &RoleName) -> Result<&Role> {
        self.graph.get_role(name)
    }

    pub fn consistent_snapshot(&self) -> Result<bool> {
        consistent_snapshot(&self.graph)
    }

    fn touch_root(&mut self) -> Result<()> {
        self.graph.update_role(&RoleName::ROOT, |_| Ok(()))?;
        self.state = ReleaseState::Mutated;
        Ok(())
    }

    /// Trust `key` for a top-level role. Root is re-signed on the next release.
    pub fn add_verification_key(&mut self, role: TopLevelRole, key: &Key) -> Result<()> {
        self.keys.add(key.public_only())?;
        self.graph.update_role(&role.into(), |r| {
            r.add_keyid(key.keyid());
            Ok(())
        })?;
        debug!(%role, keyid = key.keyid(), "verification key added");
        self.touch_root()
    }

    pub fn remove_verification_key(&mut self, role: TopLevelRole, keyid: &str) -> Result<()> {
        self.graph.update_role(&role.into(), |r| {
            if !r.keyids.iter().any(|id| id == keyid) {
                return Err(RepoError::KeyNotFound(keyid.to_string()));
            }
            r.keyids.retain(|id| id != keyid);
            r.signing_keyids.retain(|id| id != keyid);
            Ok(())
        })?;
        self.touch_root()
    }

    pub fn set_threshold(&mut self, role: TopLevelRole, threshold: u32) -> Result<()> {
        self.graph.update_role(&role.into(), |r| {
            r.threshold = threshold;
            Ok(())
        })?;
        self.touch_root()
    }

    pub fn delegate(&mut self, parent: &RoleName, req: DelegationRequest) -> Result<()> {
        let expires = self
            .config
            .expiration
            .expires_at(&RoleName::Delegated(req.delegatee.clone()), self.clock.now())?;
        DelegationEngine::new(&mut self.graph, &mut self.keys).delegate(parent, req, expires)?;
        self.state = ReleaseState::Mutated;
        Ok(())
    }

    pub fn revoke(&mut self, parent: &RoleName, delegatee: &str) -> Result<()> {
        DelegationEngine::new(&mut self.graph, &mut self.keys).revoke(parent, delegatee)?;
        self.state = ReleaseState::Mutated;
        Ok(())
    }

    pub fn set_target_path(&mut self, role: &RoleName, path: &str, custom: Value) -> Result<()> {
        self.graph.set_target_path(role, path, custom)?;
        self.state = ReleaseState::Mutated;
        Ok(())
    }

    pub fn remove_target_paths(&mut self, role: &RoleName, pattern: &str) -> Result<usize> {
        let removed = self.graph.remove_target_paths(role, pattern)?;
        self.state = ReleaseState::Mutated;
        Ok(removed)
    }

    /// Copy `source` into the targets directory as `target_path` and claim it
    /// for `role` with its length and digests. Returns `false`, changing
    /// nothing, when `source` is not a file.
    pub fn add_target_file(&mut self, role: &RoleName, source: &Path, target_path: &str, custom: Value) -> Result<bool> {
        if !source.is_file() {
            debug!(path = %source.display(), "skipping missing target file");
            return Ok(false);
        }
        self.graph.check_claim(role, target_path)?;
        let contents = fs::read(source).map_err(|e| RepoError::io(source, e))?;
        let dest = self.layout.targets_dir().join(target_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::io(parent, e))?;
        }
        if source.canonicalize().ok() != dest.canonicalize().ok() {
            fs::write(&dest, &contents).map_err(|e| RepoError::io(&dest, e))?;
        }
        self.graph.set_target_entry(role, target_path, TargetEntry::for_contents(&contents, custom))?;
        self.state = ReleaseState::Mutated;
        Ok(true)
    }

    fn signer(&mut self) -> SigningCoordinator<'_> {
        let now = self.clock.now();
        SigningCoordinator::new(&mut self.graph, &mut self.keys, &self.config.expiration, now)
    }

    pub fn load_signing_key(&mut self, role: &RoleName, key: Key) -> Result<()> {
        self.signer().load_signing_key(role, key)
    }

    /// Decode a private key file and load it for signing `role`.
    pub fn import_signing_key(&mut self, role: &RoleName, raw: &[u8], password: Option<&str>) -> Result<Key> {
        self.graph.get_role(role)?;
        let key = self.keys.import(raw, password)?;
        self.load_signing_key(role, key.clone())?;
        Ok(key)
    }

    pub fn sign(&mut self, role: &RoleName) -> Result<()> {
        self.signer().sign(role)
    }

    pub fn is_verifiable(&self, role: &RoleName) -> Result<bool> {
        is_verifiable(&self.graph, &self.keys, role)
    }

    /// Write one role to the staging area. `bump_version` must be chosen
    /// explicitly: without it the same version is written again.
    pub fn write(&mut self, role: &RoleName, bump_version: bool) -> Result<FileMeta> {
        let now = self.clock.now();
        let meta = SigningCoordinator::new(&mut self.graph, &mut self.keys, &self.config.expiration, now).write(
            role,
            bump_version,
            self.store.as_ref(),
        )?;
        self.state = ReleaseState::Mutated;
        Ok(meta)
    }

    /// Stage a complete release. A failure leaves the staging area unfit to
    /// publish until the next successful `write_all`.
    pub fn write_all(&mut self, consistent_snapshot: bool) -> Result<Vec<RoleName>> {
        let written = self.release().write_all(consistent_snapshot);
        self.state = if written.is_ok() { ReleaseState::Staged } else { ReleaseState::Mutated };
        written
    }

    /// Promote the staged release to live. Fails with [`RepoError::NotStaged`]
    /// unless the last `write_all` succeeded and nothing changed since.
    pub fn publish(&mut self) -> Result<()> {
        let state = self.state;
        self.release().publish(state)?;
        self.state = ReleaseState::Published;
        Ok(())
    }

    fn release(&mut self) -> ReleaseCoordinator<'_> {
        let now = self.clock.now();
        ReleaseCoordinator::new(&mut self.graph, &mut self.keys, self.store.as_ref(), &self.config.expiration, now)
    }

    pub fn orphaned_roles(&self) -> Vec<RoleName> {
        self.graph.orphaned_roles()
    }

    /// Seed a client with the live metadata as both its current and previous copy.
    pub fn create_client_directory(&self) -> Result<PathBuf> {
        let metadata = self.layout.client_dir().join("metadata");
        remove_dir_if_exists(&metadata)?;
        for copy in ["current", "previous"] {
            copy_dir(&self.layout.live_dir(), &metadata.join(copy))?;
        }
        info!(path = %metadata.display(), "client metadata created");
        Ok(metadata)
    }

    /// Delete every directory a repository at `root` may have created.
    pub fn clean(root: &Path) -> Result<()> {
        let layout = RepoLayout::new(root);
        for dir in [layout.repo_dir(), layout.root().join("tufclient"), layout.keystore_dir()] {
            remove_dir_if_exists(&dir)?;
        }
        Ok(())
    }
}

fn loaded_role(name: RoleName, file: &str, doc: SignedDocument, raw: &[u8], data: RoleData) -> Result<Role> {
    let version = doc.signed.version();
    let mut role = Role::new(name, parse_expiry(file, doc.signed.expires())?);
    role.version = version;
    role.signatures = doc.signatures;
    role.data = data;
    role.dirty = false;
    role.persisted = true;
    role.file_meta = Some(FileMeta::for_document(version, raw));
    Ok(role)
}
