//! Domain error types
//!
//! Defines validation and invariant errors for the domain layer, plus the
//! persisted per-sync disable reasons (`SyncError`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid remote (cloud) path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid node or config name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Referenced shadow-tree node does not exist
    #[error("No such node: {0}")]
    NodeNotFound(String),

    /// A sibling with the same (canonical) name already exists
    #[error("Duplicate sibling name: {0}")]
    DuplicateName(String),

    /// Shadow-tree invariant observed broken; fatal for the owning sync
    #[error("Shadow tree inconsistency: {0}")]
    Inconsistency(String),

    /// Malformed persisted blob (sync config wire format)
    #[error("Malformed config blob: {0}")]
    MalformedBlob(String),
}

// ============================================================================
// SyncError - persisted disable reasons
// ============================================================================

/// Reason a sync was last disabled automatically.
///
/// Persisted as a `u16` in the sync config wire format, so the numeric
/// codes are stable and must never be reassigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncError {
    /// No error; the sync has never been auto-disabled
    #[default]
    None,
    /// A backup sync in monitoring state observed a foreign remote change
    BackupModified,
    /// The local filesystem (or external drive) became inaccessible
    FsAccessLost,
    /// The cloud subtree root disappeared
    RemotePathGone,
    /// The local sync root disappeared
    LocalPathGone,
    /// Cloud storage quota exhausted
    QuotaExceeded,
    /// A shadow-tree invariant was observed broken
    InternalInconsistency,
}

impl SyncError {
    /// Wire code for the persisted config format.
    pub fn as_u16(self) -> u16 {
        match self {
            SyncError::None => 0,
            SyncError::BackupModified => 1,
            SyncError::FsAccessLost => 2,
            SyncError::RemotePathGone => 3,
            SyncError::LocalPathGone => 4,
            SyncError::QuotaExceeded => 5,
            SyncError::InternalInconsistency => 6,
        }
    }

    /// Decodes a wire code.
    ///
    /// # Errors
    /// Returns `DomainError::MalformedBlob` for unknown codes.
    pub fn from_u16(code: u16) -> Result<Self, DomainError> {
        match code {
            0 => Ok(SyncError::None),
            1 => Ok(SyncError::BackupModified),
            2 => Ok(SyncError::FsAccessLost),
            3 => Ok(SyncError::RemotePathGone),
            4 => Ok(SyncError::LocalPathGone),
            5 => Ok(SyncError::QuotaExceeded),
            6 => Ok(SyncError::InternalInconsistency),
            other => Err(DomainError::MalformedBlob(format!(
                "Unknown sync error code: {other}"
            ))),
        }
    }

    /// True when the reason requires an explicit user re-enable.
    pub fn requires_user_action(self) -> bool {
        !matches!(self, SyncError::None)
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncError::None => "no error",
            SyncError::BackupModified => "backup modified externally",
            SyncError::FsAccessLost => "filesystem access lost",
            SyncError::RemotePathGone => "remote path gone",
            SyncError::LocalPathGone => "local path gone",
            SyncError::QuotaExceeded => "quota exceeded",
            SyncError::InternalInconsistency => "internal inconsistency",
        };
        write!(f, "{s}")
    }
}
