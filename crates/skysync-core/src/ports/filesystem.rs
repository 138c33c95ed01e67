//! Local filesystem port (driven/secondary port)
//!
//! The engine never touches `std::fs` directly: every filesystem access
//! goes through this trait so tests can substitute fixtures and so the
//! engine can treat access failures uniformly (lock-retry, `FsAccessLost`).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::fingerprint::Fingerprint;
use crate::domain::shadow::NodeKind;

/// Metadata of one directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Entry name as spelled on disk
    pub name: String,
    /// File or folder
    pub kind: NodeKind,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Last-modified time
    pub mtime: DateTime<Utc>,
    /// True for symbolic links, which the engine ignores and flags
    pub is_symlink: bool,
}

/// Port trait for local filesystem access
#[async_trait::async_trait]
pub trait IFileSystem: Send + Sync {
    /// Metadata of the entry at `path`, or `None` if nothing is there
    async fn entry(&self, path: &Path) -> anyhow::Result<Option<EntryInfo>>;

    /// Entries of the directory at `path`
    async fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<EntryInfo>>;

    /// Content fingerprint of the file at `path`
    async fn fingerprint(&self, path: &Path) -> anyhow::Result<Fingerprint>;

    /// Creates a directory and any missing parents
    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()>;

    /// Renames/moves an entry; both paths are on the same volume
    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()>;

    /// Removes a file
    async fn remove_file(&self, path: &Path) -> anyhow::Result<()>;

    /// Removes an empty directory
    async fn remove_dir(&self, path: &Path) -> anyhow::Result<()>;

    /// Writes a small file whole (used for lock and marker files)
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<()>;

    /// Reads a small file whole (used for marker files)
    async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>>;
}
