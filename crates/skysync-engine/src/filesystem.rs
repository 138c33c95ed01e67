//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`IFileSystem`] using `tokio::fs`.
//!
//! ## Design Decisions
//!
//! - **Atomic small writes**: lock and marker files are written to a
//!   temp name and renamed into place, so a crash never leaves a partial
//!   file behind.
//! - **Fingerprints off the runtime**: the sparse-sample read happens in
//!   `spawn_blocking` because it seeks, and seeky I/O on the async
//!   runtime worker threads stalls unrelated syncs.
//! - **Symlinks surfaced, not followed**: `entry`/`read_dir` report
//!   `is_symlink` from the symlink metadata itself.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use skysync_core::domain::{Fingerprint, NodeKind};
use skysync_core::ports::{EntryInfo, IFileSystem};

/// Adapter bridging the [`IFileSystem`] port to the real filesystem.
///
/// Zero-sized: all context comes from the path arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Create a new adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn entry_info(name: String, meta: &std::fs::Metadata, is_symlink: bool) -> EntryInfo {
    let mtime: DateTime<Utc> = meta
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    EntryInfo {
        name,
        kind: if meta.is_dir() {
            NodeKind::Folder
        } else {
            NodeKind::File
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime,
        is_symlink,
    }
}

#[async_trait::async_trait]
impl IFileSystem for TokioFileSystem {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn entry(&self, path: &Path) -> anyhow::Result<Option<EntryInfo>> {
        let sym_meta = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let is_symlink = sym_meta.file_type().is_symlink();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(entry_info(name, &sym_meta, is_symlink)))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<EntryInfo>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let sym_meta = entry.path().symlink_metadata()?;
            let is_symlink = sym_meta.file_type().is_symlink();
            out.push(entry_info(
                entry.file_name().to_string_lossy().into_owned(),
                &sym_meta,
                is_symlink,
            ));
        }
        debug!(count = out.len(), "directory listed");
        Ok(out)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn fingerprint(&self, path: &Path) -> anyhow::Result<Fingerprint> {
        let owned = path.to_path_buf();
        let fp = tokio::task::spawn_blocking(move || Fingerprint::from_file(&owned)).await??;
        Ok(fp)
    }

    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(from = %from.display(), to = %to.display()))]
    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::remove_dir(path).await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(path = %path.display(), bytes = data.len()))]
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Temp-and-rename keeps the write atomic on the same filesystem
        let tmp_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("hello.txt");

        fs.write_file(&path, b"hello skysync").await.unwrap();
        assert_eq!(fs.read_file(&path).await.unwrap(), b"hello skysync");
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("a/b/c/nested.txt");

        fs.write_file(&path, b"nested").await.unwrap();
        assert_eq!(fs.read_file(&path).await.unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_entry_missing_and_present() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("f.txt");

        assert!(fs.entry(&path).await.unwrap().is_none());

        fs.write_file(&path, b"1234").await.unwrap();
        let info = fs.entry(&path).await.unwrap().unwrap();
        assert_eq!(info.name, "f.txt");
        assert_eq!(info.kind, NodeKind::File);
        assert_eq!(info.size, 4);
        assert!(!info.is_symlink);
    }

    #[tokio::test]
    async fn test_read_dir_lists_kinds() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();

        fs.write_file(&dir.path().join("f.txt"), b"x").await.unwrap();
        fs.create_dir_all(&dir.path().join("sub")).await.unwrap();

        let mut entries = fs.read_dir(dir.path()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, NodeKind::File);
        assert_eq!(entries[1].kind, NodeKind::Folder);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_reported_not_followed() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let target = dir.path().join("target.txt");
        let link = dir.path().join("link.txt");

        fs.write_file(&target, b"real").await.unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let info = fs.entry(&link).await.unwrap().unwrap();
        assert!(info.is_symlink);
    }

    #[tokio::test]
    async fn test_rename_creates_destination_dirs() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let from = dir.path().join("src.txt");
        let to = dir.path().join("moved/here/dst.txt");

        fs.write_file(&from, b"move me").await.unwrap();
        fs.rename(&from, &to).await.unwrap();

        assert!(fs.entry(&from).await.unwrap().is_none());
        assert_eq!(fs.read_file(&to).await.unwrap(), b"move me");
    }

    #[tokio::test]
    async fn test_fingerprint_matches_direct_computation() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("fp.bin");
        let data = vec![7u8; 5000];

        fs.write_file(&path, &data).await.unwrap();
        let fp = fs.fingerprint(&path).await.unwrap();
        assert_eq!(fp, Fingerprint::from_file(&path).unwrap());
        assert_eq!(fp.size, 5000);
    }
}
