//! Sync debris
//!
//! Locally-deleted and conflict-loser files are never unlinked outright:
//! they move into a hidden per-sync folder at the sync root,
//! `<root>/.debris/YYYY-MM-DD/<originalRelativePath>`, so the user can
//! recover them. A transient `tmp/lock` file inside the debris folder is
//! held during downloads to keep a second sync client off the same root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info};

use skysync_core::ports::IFileSystem;

/// Name of the hidden debris folder under the sync root
pub const DEBRIS_DIR: &str = ".debris";

/// Relative path of the download lock inside the debris folder
const LOCK_REL: &str = "tmp/lock";

/// True when `path` lies inside the debris folder of `root`.
///
/// Used by the watcher so engine-produced debris churn never re-enters
/// the sync pipeline.
#[must_use]
pub fn is_debris_path(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| rel.starts_with(DEBRIS_DIR))
        .unwrap_or(false)
}

/// Today's debris day-folder name (`YYYY-MM-DD`, local date)
#[must_use]
pub fn today_folder_name() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

// ============================================================================
// DebrisFolder
// ============================================================================

/// Handle on one sync's debris folder
#[derive(Clone)]
pub struct DebrisFolder {
    root: PathBuf,
    fs: Arc<dyn IFileSystem>,
}

impl DebrisFolder {
    /// Creates a handle for the sync rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf, fs: Arc<dyn IFileSystem>) -> Self {
        Self { root, fs }
    }

    /// Absolute path of today's day folder
    #[must_use]
    pub fn day_folder(&self) -> PathBuf {
        self.root.join(DEBRIS_DIR).join(today_folder_name())
    }

    /// Moves the entry at `rel_path` (relative to the sync root) into
    /// today's debris folder, preserving its relative layout. Returns the
    /// destination path.
    ///
    /// # Errors
    /// Propagates filesystem errors; a missing source is an error the
    /// caller decides how to treat.
    pub async fn stash(&self, rel_path: &Path) -> Result<PathBuf> {
        let source = self.root.join(rel_path);
        let dest = self.day_folder().join(rel_path);

        if let Some(parent) = dest.parent() {
            self.fs
                .create_dir_all(parent)
                .await
                .context("Failed to create debris day folder")?;
        }

        self.fs
            .rename(&source, &dest)
            .await
            .with_context(|| format!("Failed to move {} to debris", source.display()))?;

        info!(
            from = %source.display(),
            to = %dest.display(),
            "Entry moved to sync debris"
        );
        Ok(dest)
    }

    /// Creates the transient download lock (`.debris/tmp/lock`).
    ///
    /// # Errors
    /// Propagates filesystem errors.
    pub async fn acquire_download_lock(&self) -> Result<()> {
        let lock = self.root.join(DEBRIS_DIR).join(LOCK_REL);
        self.fs
            .write_file(&lock, b"")
            .await
            .context("Failed to create download lock")?;
        debug!(lock = %lock.display(), "Download lock created");
        Ok(())
    }

    /// Removes the transient download lock. A missing lock is not an
    /// error: crash recovery may already have cleaned it up.
    pub async fn release_download_lock(&self) {
        let lock = self.root.join(DEBRIS_DIR).join(LOCK_REL);
        if let Err(err) = self.fs.remove_file(&lock).await {
            debug!(error = %err, "Download lock already gone");
        } else {
            debug!(lock = %lock.display(), "Download lock removed");
        }
    }

    /// True while the download lock exists on disk.
    pub async fn download_lock_held(&self) -> bool {
        let lock = self.root.join(DEBRIS_DIR).join(LOCK_REL);
        matches!(self.fs.entry(&lock).await, Ok(Some(_)))
    }
}

// ============================================================================
// Unit tests
// ============================================================================
