//! Seams between the repository core and its environment.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::keys::{Key, KeyType};

/// Staging area plus live metadata directory.
pub trait MetadataStore: Send + Sync {
    /// Write (or replace) a document in the staging area.
    fn write_staged(&self, file: &str, bytes: &[u8]) -> Result<()>;
    /// Read a staged document, `None` if it does not exist.
    fn read_staged(&self, file: &str) -> Result<Option<Vec<u8>>>;
    /// Read a live document, `None` if it does not exist.
    fn read_live(&self, file: &str) -> Result<Option<Vec<u8>>>;
    /// Remove a staged document. Missing files are not an error.
    fn remove_staged(&self, file: &str) -> Result<()>;
    /// Names of every staged document.
    fn list_staged(&self) -> Result<Vec<String>>;
    /// Promote the whole staging area to live. Either every staged file
    /// becomes live or the previous live tree is left as it was.
    fn publish(&self) -> Result<()>;
}

/// Source of "now" for expiration windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A freshly generated key pair and the files it was written to.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Public half only.
    pub public: Key,
    /// Same key with private material attached.
    pub private: Key,
    pub written: Vec<PathBuf>,
}

/// Creates key pairs and stores them under a file stem.
pub trait KeyGenerator {
    fn generate(&self, key_type: KeyType, password: &str, stem: &Path) -> Result<GeneratedKey>;
}

/// Enumerates target files on disk.
pub trait FileLister {
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>>;
}

/// Collects passwords from the operator.
pub trait PasswordPrompt {
    fn get_password(&self, prompt: &str, confirm: bool) -> Result<String>;
}
