use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::errors::{RepoError, Result};

/// Metadata format version written into every `signed` payload.
pub const SPEC_VERSION: &str = "1.0.0";

/// The four roles every repository has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopLevelRole {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl TopLevelRole {
    pub const ALL: [TopLevelRole; 4] =
        [TopLevelRole::Root, TopLevelRole::Targets, TopLevelRole::Snapshot, TopLevelRole::Timestamp];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopLevelRole::Root => "root",
            TopLevelRole::Targets => "targets",
            TopLevelRole::Snapshot => "snapshot",
            TopLevelRole::Timestamp => "timestamp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        TopLevelRole::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

impl fmt::Display for TopLevelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform reference to any role in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleName {
    TopLevel(TopLevelRole),
    Delegated(String),
}

impl RoleName {
    pub const ROOT: RoleName = RoleName::TopLevel(TopLevelRole::Root);
    pub const TARGETS: RoleName = RoleName::TopLevel(TopLevelRole::Targets);
    pub const SNAPSHOT: RoleName = RoleName::TopLevel(TopLevelRole::Snapshot);
    pub const TIMESTAMP: RoleName = RoleName::TopLevel(TopLevelRole::Timestamp);

    /// Resolve a role name as given on the command line or in metadata.
    pub fn parse(name: &str) -> Result<Self> {
        match TopLevelRole::from_name(name) {
            Some(top) => Ok(RoleName::TopLevel(top)),
            None => {
                validate_delegated_name(name)?;
                Ok(RoleName::Delegated(name.to_string()))
            }
        }
    }

    /// Name of a delegation target. Top-level names are rejected.
    pub fn delegated(name: &str) -> Result<Self> {
        if TopLevelRole::from_name(name).is_some() {
            return Err(RepoError::TopLevelDelegation(name.to_string()));
        }
        validate_delegated_name(name)?;
        Ok(RoleName::Delegated(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            RoleName::TopLevel(top) => top.as_str(),
            RoleName::Delegated(name) => name,
        }
    }

    pub fn top_level(&self) -> Option<TopLevelRole> {
        match self {
            RoleName::TopLevel(top) => Some(*top),
            RoleName::Delegated(_) => None,
        }
    }

    /// Whether the role may hold target claims and delegations.
    pub fn is_targets_like(&self) -> bool {
        matches!(self, RoleName::TopLevel(TopLevelRole::Targets) | RoleName::Delegated(_))
    }

    /// File name of the role's document inside a metadata directory.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    /// Version-prefixed file name used for consistent snapshots.
    pub fn versioned_file_name(&self, version: u64) -> String {
        format!("{}.{}.json", version, self.as_str())
    }
}

impl From<TopLevelRole> for RoleName {
    fn from(top: TopLevelRole) -> Self {
        RoleName::TopLevel(top)
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn validate_delegated_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name.contains('/') || name.contains('\\') {
        Some("name contains a path separator")
    } else if name.starts_with('.') {
        Some("name starts with a dot")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(RepoError::InvalidRoleName { name: name.to_string(), reason }),
        None => Ok(()),
    }
}

/// Which target paths a delegated role may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathConstraint {
    /// Shell-glob patterns (`*`, `?`, `[...]`).
    Patterns(Vec<String>),
    /// Hex prefixes of the SHA-256 digest of the target path.
    HashPrefixes(Vec<String>),
}

impl PathConstraint {
    /// Reject patterns that cannot be compiled.
    pub fn validate(&self) -> Result<()> {
        match self {
            PathConstraint::Patterns(patterns) => {
                for pattern in patterns {
                    compile_pattern(pattern)?;
                }
            }
            PathConstraint::HashPrefixes(prefixes) => {
                if let Some(bad) = prefixes.iter().find(|p| !p.chars().all(|c| c.is_ascii_hexdigit())) {
                    return Err(RepoError::InvalidPattern {
                        pattern: bad.clone(),
                        reason: "hash prefix must be hexadecimal".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether `path` lies inside this constraint.
    pub fn covers(&self, path: &str) -> bool {
        match self {
            PathConstraint::Patterns(patterns) => patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .any(|p| p.matches(path)),
            PathConstraint::HashPrefixes(prefixes) => {
                let digest = sha256_hex(path.as_bytes());
                prefixes.iter().any(|prefix| digest.starts_with(&prefix.to_ascii_lowercase()))
            }
        }
    }

    /// Whether every path `child` can cover is also covered by `self`.
    ///
    /// Child glob patterns are checked as literal strings against the parent's
    /// patterns, which is exact for literal paths and conservative for globs.
    pub fn contains(&self, child: &PathConstraint) -> bool {
        match (self, child) {
            (PathConstraint::Patterns(_), PathConstraint::Patterns(children)) => {
                children.iter().all(|c| self.covers(c))
            }
            (PathConstraint::HashPrefixes(parents), PathConstraint::HashPrefixes(children)) => {
                children.iter().all(|c| {
                    let c = c.to_ascii_lowercase();
                    parents.iter().any(|p| c.starts_with(&p.to_ascii_lowercase()))
                })
            }
            _ => false,
        }
    }

    pub fn entries(&self) -> &[String] {
        match self {
            PathConstraint::Patterns(entries) | PathConstraint::HashPrefixes(entries) => entries,
        }
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| RepoError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

/// One row of a targets role's delegations table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: u32,
    pub terminating: bool,
    pub paths: PathConstraint,
}

/// A claimed target path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
    #[serde(default = "empty_object")]
    pub custom: Value,
}

impl TargetEntry {
    pub fn with_custom(custom: Value) -> Self {
        TargetEntry { length: None, hashes: BTreeMap::new(), custom }
    }

    /// Entry describing a payload file, with its length and digests.
    pub fn for_contents(contents: &[u8], custom: Value) -> Self {
        TargetEntry { length: Some(contents.len() as u64), hashes: digests(contents), custom }
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Pointer to a specific version of a metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
}

impl FileMeta {
    pub fn for_document(version: u64, bytes: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256_hex(bytes));
        FileMeta { version, length: Some(bytes.len() as u64), hashes }
    }
}

/// A signature over the canonical `signed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub keyid: String,
    pub sig: String,
}

/// Public key as it appears in root and delegation key tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub keytype: String,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyid_hash_algorithms: Vec<String>,
    pub keyval: KeyVal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    pub public: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootPayload {
    pub spec_version: String,
    pub consistent_snapshot: bool,
    pub version: u64,
    pub expires: String,
    pub keys: BTreeMap<String, KeyMetadata>,
    pub roles: BTreeMap<String, RoleKeys>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsPayload {
    pub spec_version: String,
    pub version: u64,
    pub expires: String,
    pub targets: BTreeMap<String, TargetEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegations: Option<DelegationsPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationsPayload {
    pub keys: BTreeMap<String, KeyMetadata>,
    pub roles: Vec<DelegatedRoleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedRoleEntry {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: u32,
    #[serde(default)]
    pub terminating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_hash_prefixes: Option<Vec<String>>,
}

impl From<&Delegation> for DelegatedRoleEntry {
    fn from(d: &Delegation) -> Self {
        let (paths, path_hash_prefixes) = match &d.paths {
            PathConstraint::Patterns(p) => (Some(p.clone()), None),
            PathConstraint::HashPrefixes(p) => (None, Some(p.clone())),
        };
        DelegatedRoleEntry {
            name: d.name.clone(),
            keyids: d.keyids.clone(),
            threshold: d.threshold,
            terminating: d.terminating,
            paths,
            path_hash_prefixes,
        }
    }
}

impl TryFrom<DelegatedRoleEntry> for Delegation {
    type Error = RepoError;

    fn try_from(entry: DelegatedRoleEntry) -> Result<Self> {
        let paths = match (entry.paths, entry.path_hash_prefixes) {
            (Some(paths), None) => PathConstraint::Patterns(paths),
            (None, Some(prefixes)) => PathConstraint::HashPrefixes(prefixes),
            _ => {
                return Err(RepoError::malformed(
                    &entry.name,
                    "delegation needs exactly one of paths or path_hash_prefixes",
                ))
            }
        };
        Ok(Delegation {
            name: entry.name,
            keyids: entry.keyids,
            threshold: entry.threshold,
            terminating: entry.terminating,
            paths,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaPayload {
    pub spec_version: String,
    pub version: u64,
    pub expires: String,
    pub meta: BTreeMap<String, FileMeta>,
}

/// The `signed` portion of a metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Payload {
    Root(RootPayload),
    Targets(TargetsPayload),
    Snapshot(MetaPayload),
    Timestamp(MetaPayload),
}

impl Payload {
    pub fn version(&self) -> u64 {
        match self {
            Payload::Root(p) => p.version,
            Payload::Targets(p) => p.version,
            Payload::Snapshot(p) | Payload::Timestamp(p) => p.version,
        }
    }

    pub fn expires(&self) -> &str {
        match self {
            Payload::Root(p) => &p.expires,
            Payload::Targets(p) => &p.expires,
            Payload::Snapshot(p) | Payload::Timestamp(p) => &p.expires,
        }
    }
}

/// A metadata document as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedDocument {
    pub signatures: Vec<SignatureEntry>,
    pub signed: Payload,
}

/// Canonical encoding used for signing and key ids: sorted keys, no whitespace.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha512_hex(bytes: &[u8]) -> String {
    hex::encode(Sha512::digest(bytes))
}

/// SHA-256 and SHA-512 digests keyed by algorithm name.
pub fn digests(bytes: &[u8]) -> BTreeMap<String, String> {
    let mut hashes = BTreeMap::new();
    hashes.insert("sha256".to_string(), sha256_hex(bytes));
    hashes.insert("sha512".to_string(), sha512_hex(bytes));
    hashes
}

pub fn format_expiry(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_expiry(file: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| RepoError::malformed(file, format!("bad expires {value:?}: {e}")))
}
