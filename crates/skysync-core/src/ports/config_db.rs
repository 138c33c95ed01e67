//! Config database port (driven/secondary port)
//!
//! The persistent home of sync configurations: an opaque key-value blob
//! store keyed by backup id. The concrete store (its file format,
//! encryption, location) is an external collaborator; the engine only
//! reads and writes blobs in the sync-config wire format.

use crate::domain::newtypes::BackupId;

/// Port trait for the sync-config blob store
#[async_trait::async_trait]
pub trait IConfigDb: Send + Sync {
    /// Reads the blob for `id`, or `None` if absent
    async fn get(&self, id: BackupId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Writes (or replaces) the blob for `id`
    async fn put(&self, id: BackupId, blob: Vec<u8>) -> anyhow::Result<()>;

    /// Removes the blob for `id`; absent ids are not an error
    async fn remove(&self, id: BackupId) -> anyhow::Result<()>;

    /// Lists all stored `(id, blob)` pairs
    async fn list(&self) -> anyhow::Result<Vec<(BackupId, Vec<u8>)>>;
}
