use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::release::ReleaseState;

/// Parse attempts made by [`crate::keys::import_private_key`], in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAttempt {
    /// Password-encrypted key envelope.
    EncryptedEnvelope,
    /// Unencrypted PKCS#8 PEM private key.
    Pkcs8Pem,
}

impl fmt::Display for ImportAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportAttempt::EncryptedEnvelope => f.write_str("encrypted key envelope"),
            ImportAttempt::Pkcs8Pem => f.write_str("PKCS#8 PEM"),
        }
    }
}

/// One failed parse attempt and why it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: ImportAttempt,
    pub detail: String,
}

/// Every failed attempt of a private key import, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailures(pub Vec<AttemptFailure>);

impl ImportFailures {
    /// The failure reported to callers: the last attempt made.
    pub fn last(&self) -> Option<&AttemptFailure> {
        self.0.last()
    }
}

impl fmt::Display for ImportFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{} ({} attempts, last: {})", last.detail, self.0.len(), last.attempt),
            None => f.write_str("no import attempt was made"),
        }
    }
}

/// Errors produced by repository operations.
///
/// Operations validate before mutating, so an error never leaves the role graph
/// or key store half-updated.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("role not found: {0}")]
    RoleNotFound(String),
    #[error("role already exists: {0}")]
    RoleAlreadyExists(String),
    #[error("role {parent} has no delegation to {delegatee}")]
    DelegationNotFound { parent: String, delegatee: String },
    #[error("cannot delegate to the top-level role: {0}")]
    TopLevelDelegation(String),
    #[error("at least one public key is required to delegate to {0}")]
    MissingKeys(String),
    #[error("key id {keyid} already refers to a different key")]
    DuplicateKeyType { keyid: String },
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key cannot be imported, possibly because the password is incorrect: {0}")]
    KeyImport(ImportFailures),
    #[error("unsupported key type: {0} (supported: ed25519, ecdsa-sha2-nistp256, rsa)")]
    UnsupportedKeyType(String),
    #[error("signing with key {keyid} failed: {reason}")]
    Signing { keyid: String, reason: String },
    #[error("invalid threshold {threshold} for role {role}: {reason}")]
    InvalidThreshold { role: String, threshold: u32, reason: &'static str },
    #[error("invalid role name {name:?}: {reason}")]
    InvalidRoleName { name: String, reason: &'static str },
    #[error("role {0} cannot hold target claims; use targets or a delegated role")]
    InvalidTargetRole(String),
    #[error("path {path:?} is outside the path space delegated to {role}")]
    PathNotDelegated { role: String, path: String },
    #[error("invalid glob pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("malformed metadata {file}: {reason}")]
    MalformedMetadata { file: String, reason: String },
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid configuration value {field}: {reason}")]
    ConfigValue { field: &'static str, reason: String },
    #[error("no complete release is staged (release state: {0:?})")]
    NotStaged(ReleaseState),
}

impl RepoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RepoError::Io { path: path.into(), source }
    }

    pub(crate) fn malformed(file: impl Into<String>, reason: impl fmt::Display) -> Self {
        RepoError::MalformedMetadata { file: file.into(), reason: reason.to_string() }
    }
}

pub type Result<T, E = RepoError> = std::result::Result<T, E>;
