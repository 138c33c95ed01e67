//! In-memory config database
//!
//! An `IConfigDb` adapter backed by a map. Ships for tests and tooling;
//! production deployments plug in the client's encrypted settings store
//! behind the same port.

use dashmap::DashMap;

use skysync_core::domain::BackupId;
use skysync_core::ports::IConfigDb;

/// Map-backed blob store
#[derive(Debug, Default)]
pub struct MemoryConfigDb {
    blobs: DashMap<BackupId, Vec<u8>>,
}

impl MemoryConfigDb {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True when nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait::async_trait]
impl IConfigDb for MemoryConfigDb {
    async fn get(&self, id: BackupId) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&id).map(|b| b.clone()))
    }

    async fn put(&self, id: BackupId, blob: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.insert(id, blob);
        Ok(())
    }

    async fn remove(&self, id: BackupId) -> anyhow::Result<()> {
        self.blobs.remove(&id);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<(BackupId, Vec<u8>)>> {
        Ok(self
            .blobs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}
