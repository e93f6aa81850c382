//! Building signed documents: payload construction, signing, threshold checks
//! and writing a single role to the staging area.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ExpirationConfig;
use crate::errors::{RepoError, Result};
use crate::graph::{Role, RoleData, RoleGraph};
use crate::keys::Key;
use crate::keystore::KeyStore;
use crate::traits::MetadataStore;
use crate::types::{
    canonical_bytes, format_expiry, DelegatedRoleEntry, DelegationsPayload, FileMeta, KeyMetadata, MetaPayload,
    Payload, RoleKeys, RoleName, RootPayload, SignatureEntry, SignedDocument, TargetsPayload, TopLevelRole,
    SPEC_VERSION,
};

pub struct SigningCoordinator<'a> {
    graph: &'a mut RoleGraph,
    keys: &'a mut KeyStore,
    expiration: &'a ExpirationConfig,
    now: DateTime<Utc>,
}

impl<'a> SigningCoordinator<'a> {
    pub fn new(
        graph: &'a mut RoleGraph,
        keys: &'a mut KeyStore,
        expiration: &'a ExpirationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        SigningCoordinator { graph, keys, expiration, now }
    }

    /// Attach a private key to `role`'s signing set. The role's content is
    /// unchanged, so it is not marked dirty.
    pub fn load_signing_key(&mut self, role: &RoleName, key: Key) -> Result<()> {
        self.graph.get_role(role)?;
        if key.private_key().is_none() {
            return Err(RepoError::Signing {
                keyid: key.keyid().to_string(),
                reason: "no private key loaded".into(),
            });
        }
        let keyid = key.keyid().to_string();
        self.keys.add(key)?;
        let role = self.graph.role_mut(role)?;
        if !role.signing_keyids.contains(&keyid) {
            role.signing_keyids.push(keyid.clone());
        }
        debug!(role = %role.name, %keyid, "signing key loaded");
        Ok(())
    }

    pub fn role(&self, name: &RoleName) -> Result<&Role> {
        self.graph.get_role(name)
    }

    /// The `signed` payload of `role` as it currently stands.
    pub fn payload(&self, role: &RoleName) -> Result<Payload> {
        build_payload(&*self.graph, &*self.keys, role)
    }

    /// Sign the current payload with every loaded key, replacing earlier
    /// signatures by the same keys.
    pub fn sign(&mut self, role: &RoleName) -> Result<()> {
        let bytes = canonical_bytes(&self.payload(role)?)?;
        let signing_keyids = self.graph.get_role(role)?.signing_keyids.clone();
        let mut fresh = Vec::with_capacity(signing_keyids.len());
        for keyid in &signing_keyids {
            let key = self.keys.get(keyid)?;
            fresh.push(SignatureEntry { keyid: key.keyid().to_string(), sig: hex::encode(key.sign(&bytes)?) });
        }
        let role = self.graph.role_mut(role)?;
        role.signatures.retain(|old| !fresh.iter().any(|new| new.keyid == old.keyid));
        role.signatures.extend(fresh);
        debug!(role = %role.name, signatures = role.signatures.len(), "signed");
        Ok(())
    }

    pub fn is_verifiable(&self, role: &RoleName) -> Result<bool> {
        is_verifiable(&*self.graph, &*self.keys, role)
    }

    /// Write `role` to the staging area, re-signed with the loaded keys.
    ///
    /// The version is incremented only when `bump_version` is set. The role is
    /// left exactly as it was if any step fails.
    pub fn write(&mut self, role: &RoleName, bump_version: bool, store: &dyn MetadataStore) -> Result<FileMeta> {
        let saved = self.graph.get_role(role)?.clone();
        let written = self.write_inner(role, bump_version, store);
        if written.is_err() {
            *self.graph.role_mut(role)? = saved;
        }
        written
    }

    fn write_inner(&mut self, name: &RoleName, bump_version: bool, store: &dyn MetadataStore) -> Result<FileMeta> {
        let expires = self.expiration.expires_at(name, self.now)?;
        {
            let role = self.graph.role_mut(name)?;
            if bump_version {
                role.version += 1;
            }
            role.expires = expires;
            role.signatures.clear();
        }
        self.sign(name)?;

        let role = self.graph.get_role(name)?;
        let version = role.version;
        let document = SignedDocument { signatures: role.signatures.clone(), signed: self.payload(name)? };
        let bytes = serde_json::to_vec_pretty(&document)?;
        store.write_staged(&name.file_name(), &bytes)?;
        if *name == RoleName::ROOT || (consistent_snapshot(&*self.graph)? && *name != RoleName::TIMESTAMP) {
            store.write_staged(&name.versioned_file_name(version), &bytes)?;
        }

        let meta = FileMeta::for_document(version, &bytes);
        let role = self.graph.role_mut(name)?;
        role.persisted = true;
        role.file_meta = Some(meta.clone());
        if role.signatures.is_empty() {
            debug!(role = %name, version, "written without signatures");
        } else {
            debug!(role = %name, version, "written");
        }
        Ok(meta)
    }
}

pub(crate) fn consistent_snapshot(graph: &RoleGraph) -> Result<bool> {
    match graph.get_role(&RoleName::ROOT)?.data {
        RoleData::Root { consistent_snapshot } => Ok(consistent_snapshot),
        _ => Ok(false),
    }
}

/// Whether `role` carries at least `threshold` distinct valid signatures from
/// its own verification keys over its current payload.
pub fn is_verifiable(graph: &RoleGraph, keys: &KeyStore, name: &RoleName) -> Result<bool> {
    let role = graph.get_role(name)?;
    let bytes = canonical_bytes(&build_payload(graph, keys, name)?)?;
    let mut valid = BTreeSet::new();
    for signature in &role.signatures {
        let Ok(key) = keys.get(&signature.keyid) else { continue };
        if !role.keyids.iter().any(|id| key.keyids().contains(id)) {
            continue;
        }
        let Ok(sig) = hex::decode(&signature.sig) else { continue };
        if key.verify(&bytes, &sig) {
            valid.insert(key.keyid().to_string());
        }
    }
    Ok(valid.len() >= role.threshold as usize)
}

fn key_table<'k>(keys: &KeyStore, ids: impl Iterator<Item = &'k String>) -> Result<BTreeMap<String, KeyMetadata>> {
    ids.map(|id| Ok((id.clone(), keys.get(id)?.metadata()))).collect()
}

pub(crate) fn build_payload(graph: &RoleGraph, keys: &KeyStore, name: &RoleName) -> Result<Payload> {
    let role = graph.get_role(name)?;
    let expires = format_expiry(role.expires);
    let payload = match &role.data {
        RoleData::Root { consistent_snapshot } => {
            let mut roles = BTreeMap::new();
            let mut keyids = Vec::new();
            for top in TopLevelRole::ALL {
                let r = graph.get_role(&top.into())?;
                keyids.extend(r.keyids.iter());
                roles.insert(top.as_str().to_string(), RoleKeys { keyids: r.keyids.clone(), threshold: r.threshold });
            }
            Payload::Root(RootPayload {
                spec_version: SPEC_VERSION.to_string(),
                consistent_snapshot: *consistent_snapshot,
                version: role.version,
                expires,
                keys: key_table(keys, keyids.into_iter())?,
                roles,
            })
        }
        RoleData::Targets { targets, delegations } => {
            let delegations = if delegations.is_empty() {
                None
            } else {
                Some(DelegationsPayload {
                    keys: key_table(keys, delegations.iter().flat_map(|d| d.keyids.iter()))?,
                    roles: delegations.iter().map(DelegatedRoleEntry::from).collect(),
                })
            };
            Payload::Targets(TargetsPayload {
                spec_version: SPEC_VERSION.to_string(),
                version: role.version,
                expires,
                targets: targets.clone(),
                delegations,
            })
        }
        RoleData::Snapshot { meta } | RoleData::Timestamp { meta } => {
            let body = MetaPayload {
                spec_version: SPEC_VERSION.to_string(),
                version: role.version,
                expires,
                meta: meta.clone(),
            };
            if matches!(role.data, RoleData::Snapshot { .. }) {
                Payload::Snapshot(body)
            } else {
                Payload::Timestamp(body)
            }
        }
    };
    Ok(payload)
}
