use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tracing as log;

pub const MARKER_NAME: &str = ".proxsave-owned";

/// A private temporary directory with an ownership marker. Every recursive
/// cleanup in the engine goes through `remove_validated`, which refuses any
/// directory that does not carry a marker written by this process family —
/// a typo'd path can therefore never be wiped.
pub struct OwnedTempDir {
    path: PathBuf,
    keep: bool,
}

impl OwnedTempDir {
    pub fn create(parent: &Path, purpose: &str) -> Result<Self> {
        let name = format!(
            "proxsave-{purpose}-{}-{}",
            std::process::id(),
            crate::utils::time::current_epoch()
        );
        let path = parent.join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("create staging dir {}", path.display()))?;

        let marker = format!(
            "PID={}\nCREATED={}\nPURPOSE={purpose}\n",
            std::process::id(),
            crate::utils::time::current_epoch()
        );
        fs::write(path.join(MARKER_NAME), marker)
            .with_context(|| format!("write marker in {}", path.display()))?;

        Ok(Self { path, keep: false })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk (restore safety backups outlive the run).
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for OwnedTempDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = remove_validated(&self.path) {
            log::warn!("staging cleanup skipped: {e:#}");
        }
    }
}

pub fn has_valid_marker(dir: &Path) -> bool {
    let marker = dir.join(MARKER_NAME);
    let Ok(content) = fs::read_to_string(&marker) else {
        return false;
    };
    content.lines().any(|l| l.starts_with("PID="))
        && content.lines().any(|l| l.starts_with("CREATED="))
}

/// Recursively delete a directory, but only when it carries a valid marker.
pub fn remove_validated(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if !has_valid_marker(dir) {
        bail!(
            "refusing to remove {}: no valid ownership marker",
            dir.display()
        );
    }
    fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))
}
