//! The sync configuration store
//!
//! Holds the persistent set of [`SyncConfig`]s over the `IConfigDb` blob
//! port. The store is the authority on sync lifecycle flags: add/remove,
//! enable/disable with a recorded reason, backup-state changes, portable
//! export/import, and drive-bound resurrection of external backups.
//!
//! Every mutation re-persists the affected config through the port; the
//! in-memory map is a cache over the blobs, never a second source of
//! truth.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use skysync_core::domain::sync_config::CONFIG_WIRE_VERSION;
use skysync_core::domain::{BackupId, BackupState, DomainError, DriveId, SyncConfig, SyncError};
use skysync_core::ports::{IConfigDb, IFileSystem};

use crate::drive;
use crate::error::StoreError;

// ============================================================================
// SyncConfigStore
// ============================================================================

/// Persistent set of sync configurations
pub struct SyncConfigStore {
    db: Arc<dyn IConfigDb>,
    configs: RwLock<HashMap<BackupId, SyncConfig>>,
}

impl SyncConfigStore {
    /// Loads all persisted configs from the blob store.
    ///
    /// Blobs that fail to decode are skipped with a warning rather than
    /// poisoning the whole set.
    ///
    /// # Errors
    /// Fails only when the blob store itself cannot be listed.
    pub async fn load(db: Arc<dyn IConfigDb>) -> Result<Self, StoreError> {
        let mut configs = HashMap::new();
        for (id, blob) in db.list().await? {
            match SyncConfig::decode(&blob) {
                Ok(config) => {
                    configs.insert(config.backup_id, config);
                }
                Err(err) => {
                    warn!(backup_id = %id, error = %err, "Skipping undecodable sync config");
                }
            }
        }
        info!(count = configs.len(), "Sync configs loaded");
        Ok(Self {
            db,
            configs: RwLock::new(configs),
        })
    }

    async fn persist(&self, config: &SyncConfig) -> Result<(), StoreError> {
        self.db.put(config.backup_id, config.encode()).await?;
        Ok(())
    }

    /// Registers a new sync.
    ///
    /// # Errors
    /// `StoreError::PathOverlap` when the local path is already covered
    /// by (or covers) another sync's local path.
    pub async fn add(&self, config: SyncConfig) -> Result<BackupId, StoreError> {
        {
            let configs = self.configs.read().expect("config lock");
            if let Some(existing) = configs
                .values()
                .find(|c| c.local_path.overlaps(&config.local_path))
            {
                return Err(StoreError::PathOverlap {
                    existing: existing.local_path.clone(),
                });
            }
        }

        let id = config.backup_id;
        self.persist(&config).await?;
        self.configs
            .write()
            .expect("config lock")
            .insert(id, config);
        info!(backup_id = %id, "Sync config added");
        Ok(id)
    }

    /// Removes a sync configuration.
    ///
    /// `keep_cache` is a hint for the caller-owned shadow-tree cache;
    /// the persisted config blob is always removed, so nothing on disk
    /// references the backup id afterwards.
    ///
    /// # Errors
    /// `StoreError::UnknownBackupId` if no such config exists.
    pub async fn remove(&self, id: BackupId, keep_cache: bool) -> Result<SyncConfig, StoreError> {
        let removed = self
            .configs
            .write()
            .expect("config lock")
            .remove(&id)
            .ok_or_else(|| StoreError::UnknownBackupId(id.to_string()))?;
        self.db.remove(id).await?;
        info!(backup_id = %id, keep_cache, "Sync config removed");
        Ok(removed)
    }

    /// Re-enables a sync. Backup syncs always re-enter mirroring.
    ///
    /// # Errors
    /// `StoreError::UnknownBackupId` if no such config exists.
    pub async fn enable(&self, id: BackupId) -> Result<SyncConfig, StoreError> {
        let updated = {
            let mut configs = self.configs.write().expect("config lock");
            let config = configs
                .get_mut(&id)
                .ok_or_else(|| StoreError::UnknownBackupId(id.to_string()))?;
            config.enable();
            config.clone()
        };
        self.persist(&updated).await?;
        info!(backup_id = %id, "Sync enabled");
        Ok(updated)
    }

    /// Disables a sync, recording the reason.
    ///
    /// # Errors
    /// `StoreError::UnknownBackupId` if no such config exists.
    pub async fn disable(
        &self,
        id: BackupId,
        reason: SyncError,
    ) -> Result<SyncConfig, StoreError> {
        let updated = {
            let mut configs = self.configs.write().expect("config lock");
            let config = configs
                .get_mut(&id)
                .ok_or_else(|| StoreError::UnknownBackupId(id.to_string()))?;
            config.disable(reason);
            config.clone()
        };
        self.persist(&updated).await?;
        info!(backup_id = %id, %reason, "Sync disabled");
        Ok(updated)
    }

    /// Records a backup-state transition (mirroring ↔ monitoring).
    ///
    /// # Errors
    /// `StoreError::UnknownBackupId` if no such config exists.
    pub async fn set_backup_state(
        &self,
        id: BackupId,
        state: BackupState,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut configs = self.configs.write().expect("config lock");
            let config = configs
                .get_mut(&id)
                .ok_or_else(|| StoreError::UnknownBackupId(id.to_string()))?;
            config.backup_state = state;
            config.clone()
        };
        self.persist(&updated).await?;
        Ok(())
    }

    /// Looks up a config by backup id
    #[must_use]
    pub fn by_backup_id(&self, id: BackupId) -> Option<SyncConfig> {
        self.configs.read().expect("config lock").get(&id).cloned()
    }

    /// Looks up a config by its exact local root
    #[must_use]
    pub fn by_local_path(&self, path: &Path) -> Option<SyncConfig> {
        self.configs
            .read()
            .expect("config lock")
            .values()
            .find(|c| c.local_path.as_path() == path)
            .cloned()
    }

    /// Visits every config in unspecified order
    pub fn for_each(&self, mut f: impl FnMut(&SyncConfig)) {
        for config in self.configs.read().expect("config lock").values() {
            f(config);
        }
    }

    /// Number of stored configs
    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.read().expect("config lock").len()
    }

    /// True when no configs are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    /// Serializes every config into one portable blob:
    /// `u32 version | u32 count | count x (u32 len | config bytes)`.
    #[must_use]
    pub fn export_all(&self) -> Vec<u8> {
        let configs = self.configs.read().expect("config lock");
        let mut out = Vec::new();
        out.extend_from_slice(&CONFIG_WIRE_VERSION.to_le_bytes());
        out.extend_from_slice(&(configs.len() as u32).to_le_bytes());
        for config in configs.values() {
            let blob = config.encode();
            out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
            out.extend_from_slice(&blob);
        }
        out
    }

    /// Imports a blob produced by [`Self::export_all`] on another client.
    ///
    /// Imported configs always arrive disabled; the user re-enables each
    /// sync deliberately on the new device. Existing ids are replaced.
    ///
    /// # Errors
    /// `StoreError::Codec` on any structural problem;
    /// `StoreError::PathOverlap` when an imported path collides with a
    /// different existing sync.
    pub async fn import_all(&self, blob: &[u8]) -> Result<Vec<BackupId>, StoreError> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], StoreError> {
            let end = pos
                .checked_add(n)
                .filter(|&e| e <= blob.len())
                .ok_or_else(|| {
                    StoreError::Codec(DomainError::MalformedBlob(
                        "Truncated export blob".to_string(),
                    ))
                })?;
            let slice = &blob[*pos..end];
            *pos = end;
            Ok(slice)
        };

        let version = u32::from_le_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes"));
        if version != CONFIG_WIRE_VERSION {
            return Err(StoreError::Codec(DomainError::MalformedBlob(format!(
                "Unsupported export version: {version}"
            ))));
        }
        let count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes"));

        let mut incoming = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes")) as usize;
            let mut config = SyncConfig::decode(take(&mut pos, len)?)?;
            config.enabled = false;
            incoming.push(config);
        }
        if pos != blob.len() {
            return Err(StoreError::Codec(DomainError::MalformedBlob(
                "Trailing bytes in export blob".to_string(),
            )));
        }

        // Reject overlaps against configs we are not about to replace
        {
            let configs = self.configs.read().expect("config lock");
            for config in &incoming {
                if let Some(existing) = configs.values().find(|c| {
                    c.backup_id != config.backup_id && c.local_path.overlaps(&config.local_path)
                }) {
                    return Err(StoreError::PathOverlap {
                        existing: existing.local_path.clone(),
                    });
                }
            }
        }

        let mut ids = Vec::with_capacity(incoming.len());
        for config in incoming {
            let id = config.backup_id;
            self.persist(&config).await?;
            self.configs
                .write()
                .expect("config lock")
                .insert(id, config);
            ids.push(id);
        }
        info!(count = ids.len(), "Sync configs imported (disabled)");
        Ok(ids)
    }

    // ========================================================================
    // External drives
    // ========================================================================

    /// Opens a newly attached drive: reads (or mints) its drive id and
    /// re-enables every external backup bound to it. Resumed backups
    /// always re-enter mirroring.
    ///
    /// # Errors
    /// Propagates filesystem and persistence errors.
    pub async fn open_drive(
        &self,
        fs: &Arc<dyn IFileSystem>,
        drive_root: &Path,
    ) -> Result<(DriveId, Vec<SyncConfig>), StoreError> {
        let id = drive::ensure_drive_id(fs, drive_root).await?;

        let bound: Vec<BackupId> = self
            .configs
            .read()
            .expect("config lock")
            .values()
            .filter(|c| c.drive_id == Some(id))
            .map(|c| c.backup_id)
            .collect();

        let mut resurrected = Vec::with_capacity(bound.len());
        for backup_id in bound {
            let updated = {
                let mut configs = self.configs.write().expect("config lock");
                let config = configs
                    .get_mut(&backup_id)
                    .ok_or_else(|| StoreError::UnknownBackupId(backup_id.to_string()))?;
                config.enable();
                // Remount point may differ from the persisted one
                config.drive_path = Some(drive_root.to_path_buf());
                config.clone()
            };
            self.persist(&updated).await?;
            resurrected.push(updated);
        }

        info!(
            drive = %drive_root.display(),
            id = %id,
            count = resurrected.len(),
            "Drive opened"
        );
        Ok((id, resurrected))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfigDb;
    use skysync_core::domain::{LocalPath, NodeHandle, RemotePath, SyncType};
    use std::path::PathBuf;

    fn config(path: &str) -> SyncConfig {
        SyncConfig::two_way(
            LocalPath::new(PathBuf::from(path)).unwrap(),
            NodeHandle::from_raw(1),
            RemotePath::new("/cloud".to_string()).unwrap(),
        )
    }

    async fn store() -> SyncConfigStore {
        SyncConfigStore::load(Arc::new(MemoryConfigDb::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let store = store().await;
        let id = store.add(config("/home/u/sync")).await.unwrap();

        let found = store.by_backup_id(id).unwrap();
        assert_eq!(found.backup_id, id);
        assert_eq!(
            store
                .by_local_path(Path::new("/home/u/sync"))
                .unwrap()
                .backup_id,
            id
        );
        assert!(store.by_local_path(Path::new("/elsewhere")).is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_overlap() {
        let store = store().await;
        store.add(config("/home/u/sync")).await.unwrap();

        // Nested under an existing root
        assert!(matches!(
            store.add(config("/home/u/sync/sub")).await,
            Err(StoreError::PathOverlap { .. })
        ));
        // Containing an existing root
        assert!(matches!(
            store.add(config("/home/u")).await,
            Err(StoreError::PathOverlap { .. })
        ));
        // Disjoint is fine
        assert!(store.add(config("/home/u/other")).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_leaves_no_state() {
        let db = Arc::new(MemoryConfigDb::new());
        let store = SyncConfigStore::load(Arc::clone(&db) as Arc<dyn IConfigDb>)
            .await
            .unwrap();
        let id = store.add(config("/home/u/sync")).await.unwrap();

        store.remove(id, false).await.unwrap();
        assert!(store.by_backup_id(id).is_none());
        assert!(db.is_empty());
        assert!(matches!(
            store.remove(id, false).await,
            Err(StoreError::UnknownBackupId(_))
        ));
    }

    #[tokio::test]
    async fn test_enable_disable_cycle() {
        let store = store().await;
        let id = store.add(config("/home/u/sync")).await.unwrap();

        let disabled = store.disable(id, SyncError::FsAccessLost).await.unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.last_error, SyncError::FsAccessLost);

        let enabled = store.enable(id).await.unwrap();
        assert!(enabled.enabled);
        assert_eq!(enabled.last_error, SyncError::None);
    }

    #[tokio::test]
    async fn test_enable_resets_backup_to_mirroring() {
        let store = store().await;
        let mut backup = SyncConfig::backup(
            LocalPath::new(PathBuf::from("/home/u/backup")).unwrap(),
            NodeHandle::from_raw(2),
            RemotePath::new("/backups/u".to_string()).unwrap(),
        );
        backup.backup_state = BackupState::Monitoring;
        let id = store.add(backup).await.unwrap();

        store.disable(id, SyncError::BackupModified).await.unwrap();
        let enabled = store.enable(id).await.unwrap();
        assert_eq!(enabled.backup_state, BackupState::Mirroring);
    }

    #[tokio::test]
    async fn test_persistence_across_load() {
        let db = Arc::new(MemoryConfigDb::new());
        let id = {
            let store = SyncConfigStore::load(Arc::clone(&db) as Arc<dyn IConfigDb>)
                .await
                .unwrap();
            store.add(config("/home/u/sync")).await.unwrap()
        };

        let reloaded = SyncConfigStore::load(Arc::clone(&db) as Arc<dyn IConfigDb>)
            .await
            .unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.by_backup_id(id).is_some());
    }

    #[tokio::test]
    async fn test_export_import_roundtrip_disabled() {
        let source = store().await;
        source.add(config("/home/u/a")).await.unwrap();
        source.add(config("/home/u/b")).await.unwrap();
        let blob = source.export_all();

        let target = store().await;
        let ids = target.import_all(&blob).await.unwrap();
        assert_eq!(ids.len(), 2);
        for id in ids {
            let imported = target.by_backup_id(id).unwrap();
            assert!(!imported.enabled, "imports must arrive disabled");
        }
    }

    #[tokio::test]
    async fn test_import_rejects_garbage() {
        let store = store().await;
        assert!(store.import_all(&[1, 2, 3]).await.is_err());

        let mut blob = {
            let src = SyncConfigStore::load(Arc::new(MemoryConfigDb::new()))
                .await
                .unwrap();
            src.add(config("/home/u/a")).await.unwrap();
            src.export_all()
        };
        blob.push(0);
        assert!(store.import_all(&blob).await.is_err());
    }

    #[tokio::test]
    async fn test_for_each_and_len() {
        let store = store().await;
        store.add(config("/home/u/a")).await.unwrap();
        store.add(config("/home/u/b")).await.unwrap();

        let mut seen = 0;
        store.for_each(|c| {
            assert_eq!(c.sync_type, SyncType::TwoWay);
            seen += 1;
        });
        assert_eq!(seen, 2);
        assert_eq!(store.len(), 2);
    }
}
