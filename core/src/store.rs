//! Filesystem staging area and the copy-then-rename publish.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{RepoError, Result};
use crate::traits::MetadataStore;

const PUBLISHING_SUFFIX: &str = "publishing";
const PREVIOUS_SUFFIX: &str = "previous";

/// Metadata kept in two sibling directories: `staged` and `live`.
#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    staged: PathBuf,
    live: PathBuf,
}

impl FsMetadataStore {
    /// Open the store, creating the staging directory and repairing a publish
    /// that was interrupted between its two renames.
    pub fn open(staged: impl Into<PathBuf>, live: impl Into<PathBuf>) -> Result<Self> {
        let store = FsMetadataStore { staged: staged.into(), live: live.into() };
        fs::create_dir_all(&store.staged).map_err(|e| RepoError::io(&store.staged, e))?;
        store.recover()?;
        Ok(store)
    }

    pub fn staged_dir(&self) -> &Path {
        &self.staged
    }

    pub fn live_dir(&self) -> &Path {
        &self.live
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.live.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".");
        name.push(suffix);
        self.live.with_file_name(name)
    }

    fn recover(&self) -> Result<()> {
        let backup = self.sibling(PREVIOUS_SUFFIX);
        if backup.exists() {
            if self.live.exists() {
                warn!(path = %backup.display(), "removing stale publish backup");
                remove_dir_if_exists(&backup)?;
            } else {
                warn!(path = %backup.display(), "restoring live metadata from interrupted publish");
                fs::rename(&backup, &self.live).map_err(|e| RepoError::io(&backup, e))?;
            }
        }
        let pending = self.sibling(PUBLISHING_SUFFIX);
        if pending.exists() {
            warn!(path = %pending.display(), "discarding incomplete publish");
            remove_dir_if_exists(&pending)?;
        }
        Ok(())
    }
}

impl MetadataStore for FsMetadataStore {
    fn write_staged(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let path = self.staged.join(file);
        fs::write(&path, bytes).map_err(|e| RepoError::io(&path, e))?;
        debug!(file, len = bytes.len(), "staged");
        Ok(())
    }

    fn read_staged(&self, file: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.staged.join(file))
    }

    fn read_live(&self, file: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.live.join(file))
    }

    fn remove_staged(&self, file: &str) -> Result<()> {
        let path = self.staged.join(file);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(file, "removed from staging");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::io(path, e)),
        }
    }

    fn list_staged(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.staged).map_err(|e| RepoError::io(&self.staged, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RepoError::io(&self.staged, e))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn publish(&self) -> Result<()> {
        let pending = self.sibling(PUBLISHING_SUFFIX);
        let backup = self.sibling(PREVIOUS_SUFFIX);
        remove_dir_if_exists(&pending)?;

        if let Err(e) = copy_dir(&self.staged, &pending) {
            let _ = fs::remove_dir_all(&pending);
            return Err(e);
        }
        let had_live = self.live.exists();
        if had_live {
            if let Err(e) = fs::rename(&self.live, &backup) {
                let _ = fs::remove_dir_all(&pending);
                return Err(RepoError::io(&self.live, e));
            }
        }
        if let Err(e) = fs::rename(&pending, &self.live) {
            if had_live {
                if let Err(restore) = fs::rename(&backup, &self.live) {
                    warn!(error = %restore, "could not restore live metadata; it will be restored on next open");
                }
            }
            return Err(RepoError::io(&self.live, e));
        }
        if had_live {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(path = %backup.display(), error = %e, "could not delete publish backup");
            }
        }
        info!(live = %self.live.display(), "staged metadata published");
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RepoError::io(path, e)),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepoError::io(path, e)),
    }
}

/// Recursively copy `src` into `dst`, creating `dst`.
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            RepoError::io(path, io::Error::from(e))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RepoError::io(entry.path(), io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let to = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&to).map_err(|e| RepoError::io(&to, e))?;
        } else {
            fs::copy(entry.path(), &to).map_err(|e| RepoError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> FsMetadataStore {
        FsMetadataStore::open(dir.join("metadata.staged"), dir.join("metadata")).unwrap()
    }

    #[test]
    fn publish_replaces_live_with_staged_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.write_staged("root.json", b"v1").unwrap();
        store.publish().unwrap();
        assert_eq!(store.read_live("root.json").unwrap().unwrap(), b"v1");

        store.remove_staged("root.json").unwrap();
        store.write_staged("targets.json", b"t").unwrap();
        store.publish().unwrap();
        assert!(store.read_live("root.json").unwrap().is_none());
        assert_eq!(store.read_live("targets.json").unwrap().unwrap(), b"t");
        assert!(!tmp.path().join("metadata.previous").exists());
        assert!(!tmp.path().join("metadata.publishing").exists());
    }

    #[test]
    fn failed_copy_leaves_live_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.write_staged("root.json", b"v1").unwrap();
        store.publish().unwrap();

        fs::remove_dir_all(store.staged_dir()).unwrap();
        assert!(matches!(store.publish(), Err(RepoError::Io { .. })));
        assert_eq!(store.read_live("root.json").unwrap().unwrap(), b"v1");
        assert!(!tmp.path().join("metadata.publishing").exists());
    }

    #[test]
    fn open_restores_an_interrupted_swap() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("metadata.previous")).unwrap();
        fs::write(tmp.path().join("metadata.previous/root.json"), b"old").unwrap();
        fs::create_dir_all(tmp.path().join("metadata.publishing")).unwrap();

        let store = open(tmp.path());
        assert_eq!(store.read_live("root.json").unwrap().unwrap(), b"old");
        assert!(!tmp.path().join("metadata.publishing").exists());
    }

    #[test]
    fn removing_a_missing_file_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.remove_staged("nope.json").unwrap();
        assert!(store.list_staged().unwrap().is_empty());
    }

    #[test]
    fn copy_dir_copies_nested_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();
        fs::write(src.join("top.json"), b"1").unwrap();
        fs::write(src.join("a/b/deep.json"), b"2").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("top.json")).unwrap(), b"1");
        assert_eq!(fs::read(dst.join("a/b/deep.json")).unwrap(), b"2");
        assert!(dst.join("empty").is_dir());
    }
}
