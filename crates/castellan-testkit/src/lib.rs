//! Shared test fixtures: disposable project workspaces under the system
//! temp directory.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A throwaway project directory, removed on drop.
pub struct TempWorkspace {
    root: PathBuf,
}

impl TempWorkspace {
    pub fn new(tag: &str) -> Result<Self> {
        let root = std::env::temp_dir().join(format!("castellan-{tag}-{}", Uuid::now_v7()));
        fs::create_dir_all(&root)?;
        // Canonicalize so descendants compare cleanly against sandbox roots
        // on platforms where temp_dir itself is a symlink.
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write_file(&self, rel: &str, content: &str) -> Result<PathBuf> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn mkdir(&self, rel: &str) -> Result<PathBuf> {
        let path = self.root.join(rel);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
