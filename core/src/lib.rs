//! tufrepo core library: the trust-metadata state machine of a TUF repository.
//!
//! - Key store with content-derived key ids and ordered private key import
//! - Role graph of top-level and delegated roles, with target claims
//! - Delegation and revocation with path-space and threshold checks
//! - Signing, threshold verification and per-role writes to a staging area
//! - Ordered release (root, targets tree, snapshot, timestamp) and an
//!   all-or-nothing staged-to-live publish
//!
//! [`Repository`] ties these together around one repository directory.

pub mod config;
pub mod delegation;
pub mod errors;
pub mod graph;
pub mod keys;
pub mod keystore;
pub mod release;
pub mod repository;
pub mod signing;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{ExpirationConfig, RepoConfig, RepoLayout};
pub use delegation::{DelegationEngine, DelegationRequest};
pub use errors::{RepoError, Result};
pub use graph::{Role, RoleData, RoleGraph};
pub use keys::{encrypt_private_key, import_private_key, KdfParams, Key, KeyType, PrivateKey};
pub use keystore::KeyStore;
pub use release::{ReleaseCoordinator, ReleaseState};
pub use repository::Repository;
pub use signing::SigningCoordinator;
pub use store::FsMetadataStore;
pub use traits::{Clock, FileLister, FixedClock, GeneratedKey, KeyGenerator, MetadataStore, PasswordPrompt, SystemClock};
pub use types::{PathConstraint, RoleName, TopLevelRole};

/// Library version string.
pub fn version() -> &'static str { "tufrepo-core 0.1.0" }

#[cfg(test)]
mod tests;
