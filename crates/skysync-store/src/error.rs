//! Store error types

use skysync_core::domain::{DomainError, LocalPath};
use thiserror::Error;

/// Errors from sync-config store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The new sync's local path nests inside (or contains) an existing
    /// sync's local path
    #[error("Local path overlaps existing sync at {existing}")]
    PathOverlap {
        /// The conflicting existing sync root
        existing: LocalPath,
    },

    /// No config with the given backup id
    #[error("Unknown backup id: {0}")]
    UnknownBackupId(String),

    /// A persisted or imported blob did not decode
    #[error(transparent)]
    Codec(#[from] DomainError),

    /// The underlying blob store failed
    #[error("Config database error: {0}")]
    Db(#[from] anyhow::Error),
}
