use std::path::{Path, PathBuf};

use tufrepo_core::errors::{RepoError, Result};
use tufrepo_core::FileLister;
use walkdir::WalkDir;

/// Lists regular files with `walkdir`, sorted by path.
pub struct WalkDirLister;

impl FileLister for WalkDirLister {
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let depth = if recursive { usize::MAX } else { 1 };
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(depth).sort_by_file_name() {
            let entry = entry.map_err(|e| RepoError::Io {
                path: e.path().unwrap_or(dir).to_path_buf(),
                source: e.into(),
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}
