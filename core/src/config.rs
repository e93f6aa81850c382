use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{RepoError, Result};
use crate::keys::KdfParams;
use crate::types::{RoleName, TopLevelRole};

/// Repository settings, read from TOML. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub consistent_snapshot: bool,
    pub expiration: ExpirationConfig,
    pub kdf: KdfParams,
}

impl RepoConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: RepoConfig = toml::from_str(raw)?;
        config.expiration.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| RepoError::io(path, e))?;
        Self::from_toml(&raw)
    }
}

/// Validity windows applied each time a role is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    pub root_days: i64,
    pub targets_days: i64,
    pub snapshot_days: i64,
    pub timestamp_days: i64,
    pub delegated_seconds: i64,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        ExpirationConfig {
            root_days: 365,
            targets_days: 90,
            snapshot_days: 7,
            timestamp_days: 1,
            delegated_seconds: 7_889_230,
        }
    }
}

impl ExpirationConfig {
    /// Longest validity window accepted for any role.
    pub const MAX_DAYS: i64 = 100 * 366;

    /// Every window must be positive and at most [`Self::MAX_DAYS`].
    pub fn validate(&self) -> Result<()> {
        const MAX_SECONDS: i64 = ExpirationConfig::MAX_DAYS * 86_400;
        let fields = [
            ("expiration.root_days", self.root_days, Self::MAX_DAYS),
            ("expiration.targets_days", self.targets_days, Self::MAX_DAYS),
            ("expiration.snapshot_days", self.snapshot_days, Self::MAX_DAYS),
            ("expiration.timestamp_days", self.timestamp_days, Self::MAX_DAYS),
            ("expiration.delegated_seconds", self.delegated_seconds, MAX_SECONDS),
        ];
        for (field, value, max) in fields {
            if !(1..=max).contains(&value) {
                return Err(RepoError::ConfigValue { field, reason: format!("{value} is outside 1..={max}") });
            }
        }
        Ok(())
    }

    pub fn window(&self, role: &RoleName) -> Result<Duration> {
        let (field, window) = match role {
            RoleName::TopLevel(TopLevelRole::Root) => ("expiration.root_days", Duration::try_days(self.root_days)),
            RoleName::TopLevel(TopLevelRole::Targets) => {
                ("expiration.targets_days", Duration::try_days(self.targets_days))
            }
            RoleName::TopLevel(TopLevelRole::Snapshot) => {
                ("expiration.snapshot_days", Duration::try_days(self.snapshot_days))
            }
            RoleName::TopLevel(TopLevelRole::Timestamp) => {
                ("expiration.timestamp_days", Duration::try_days(self.timestamp_days))
            }
            RoleName::Delegated(_) => ("expiration.delegated_seconds", Duration::try_seconds(self.delegated_seconds)),
        };
        window.ok_or_else(|| RepoError::ConfigValue { field, reason: "window out of range".into() })
    }

    /// Expiry of `role` if written at `now`, truncated to whole seconds.
    pub fn expires_at(&self, role: &RoleName, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(self.window(role)?)
            .map(|at| at.trunc_subsecs(0))
            .ok_or_else(|| RepoError::ConfigValue {
                field: "expiration",
                reason: format!("expiry of {role} overflows the calendar"),
            })
    }
}

/// Fixed directory names under a repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RepoLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.root.join("tufkeystore")
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("tufrepo")
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.repo_dir().join("metadata.staged")
    }

    pub fn live_dir(&self) -> PathBuf {
        self.repo_dir().join("metadata")
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.repo_dir().join("targets")
    }

    pub fn client_dir(&self) -> PathBuf {
        self.root.join("tufclient").join("tufrepo")
    }

    /// File stem of a top-level role's key pair (`<stem>` private, `<stem>.pub` public).
    pub fn key_path(&self, role: TopLevelRole) -> PathBuf {
        self.keystore_dir().join(format!("{}_key", role.as_str()))
    }
}
