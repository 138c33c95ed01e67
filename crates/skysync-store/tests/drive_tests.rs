//! Drive-ID binding integration tests
//!
//! Exercises the drive-id file lifecycle and external-backup
//! resurrection against a real temp directory through a std-backed
//! filesystem adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use skysync_core::domain::{
    BackupState, Fingerprint, LocalPath, NodeHandle, NodeKind, RemotePath, SyncConfig,
};
use skysync_core::ports::{EntryInfo, IFileSystem};
use skysync_store::{
    ensure_drive_id, read_drive_id, write_drive_id, MemoryConfigDb, SyncConfigStore,
    DRIVE_ID_REL_PATH,
};

/// Minimal std-backed filesystem for the store tests
struct StdFileSystem;

#[async_trait::async_trait]
impl IFileSystem for StdFileSystem {
    async fn entry(&self, path: &Path) -> anyhow::Result<Option<EntryInfo>> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(EntryInfo {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                kind: if meta.is_dir() {
                    NodeKind::Folder
                } else {
                    NodeKind::File
                },
                size: meta.len(),
                mtime: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                is_symlink: meta.file_type().is_symlink(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir(&self, _path: &Path) -> anyhow::Result<Vec<EntryInfo>> {
        unimplemented!("not needed by drive tests")
    }

    async fn fingerprint(&self, _path: &Path) -> anyhow::Result<Fingerprint> {
        unimplemented!("not needed by drive tests")
    }

    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::remove_dir(path)?;
        Ok(())
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }
}

fn fs() -> Arc<dyn IFileSystem> {
    Arc::new(StdFileSystem)
}

#[tokio::test]
async fn test_fresh_drive_gets_an_id_once() {
    let drive = TempDir::new().unwrap();
    let fs = fs();

    assert!(read_drive_id(&fs, drive.path()).await.unwrap().is_none());

    let first = ensure_drive_id(&fs, drive.path()).await.unwrap();
    let second = ensure_drive_id(&fs, drive.path()).await.unwrap();
    assert_eq!(first, second, "id must be stable across attaches");

    // The file is 8 bytes little-endian at the well-known path
    let raw = std::fs::read(drive.path().join(DRIVE_ID_REL_PATH)).unwrap();
    assert_eq!(raw.len(), 8);
    assert_eq!(u64::from_le_bytes(raw.try_into().unwrap()), first.as_u64());
}

#[tokio::test]
async fn test_malformed_drive_id_file_errors() {
    let drive = TempDir::new().unwrap();
    let fs = fs();

    let path = drive.path().join(DRIVE_ID_REL_PATH);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"short").unwrap();

    assert!(read_drive_id(&fs, drive.path()).await.is_err());
}

#[tokio::test]
async fn test_open_drive_resurrects_bound_backups_into_mirroring() {
    let drive = TempDir::new().unwrap();
    let fs = fs();
    let store = SyncConfigStore::load(Arc::new(MemoryConfigDb::new()))
        .await
        .unwrap();

    // Bind an external backup to the drive, then simulate detach:
    // disabled, and persisted in monitoring state
    let drive_id = ensure_drive_id(&fs, drive.path()).await.unwrap();
    let mut config = SyncConfig::backup(
        LocalPath::new(PathBuf::from(drive.path().join("photos"))).unwrap(),
        NodeHandle::from_raw(9),
        RemotePath::new("/backups/photos".to_string()).unwrap(),
    )
    .on_drive(drive.path().to_path_buf(), drive_id);
    config.backup_state = BackupState::Monitoring;
    config.disable(skysync_core::domain::SyncError::FsAccessLost);
    let id = store.add(config).await.unwrap();

    // An unrelated sync stays untouched
    let other = store
        .add(SyncConfig::two_way(
            LocalPath::new(PathBuf::from("/home/u/sync")).unwrap(),
            NodeHandle::from_raw(10),
            RemotePath::new("/cloud".to_string()).unwrap(),
        ))
        .await
        .unwrap();

    let (opened_id, resurrected) = store.open_drive(&fs, drive.path()).await.unwrap();
    assert_eq!(opened_id, drive_id);
    assert_eq!(resurrected.len(), 1);
    assert_eq!(resurrected[0].backup_id, id);

    let config = store.by_backup_id(id).unwrap();
    assert!(config.enabled);
    // Resumption always re-verifies: never straight back to monitoring
    assert_eq!(config.backup_state, BackupState::Mirroring);

    let untouched = store.by_backup_id(other).unwrap();
    assert!(untouched.enabled);
}

#[tokio::test]
async fn test_open_drive_with_no_bound_backups() {
    let drive = TempDir::new().unwrap();
    let fs = fs();
    let store = SyncConfigStore::load(Arc::new(MemoryConfigDb::new()))
        .await
        .unwrap();

    let (_, resurrected) = store.open_drive(&fs, drive.path()).await.unwrap();
    assert!(resurrected.is_empty());
}
