//! Sync observer port (driving/primary port, outbound events)
//!
//! A narrow observer covering only the events the core emits: sync state
//! changes, transfer lifecycle, retry scheduling, filename anomalies, and
//! name clashes. Callbacks are synchronous and fire-and-forget; an
//! implementation that needs to do real work should hand the event off to
//! its own executor.

use std::path::Path;
use std::time::Duration;

use crate::domain::canonical::{FilenameAnomaly, NameClash};
use crate::domain::errors::SyncError;
use crate::domain::newtypes::BackupId;

/// Direction of a content transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Local → cloud
    Upload,
    /// Cloud → local
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// Lifecycle phase of a transfer, as surfaced to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Accepted into a queue
    Queued,
    /// Handed to the transfer pipeline
    Started,
    /// Finished successfully
    Completed,
    /// Failed (may be retried)
    Failed,
    /// Abandoned by cancellation
    Cancelled,
}

/// Port trait for the application-facing event stream.
///
/// Every method has an empty default body so implementations subscribe
/// only to what they care about.
pub trait ISyncObserver: Send + Sync {
    /// A sync was enabled or disabled; `last_error` carries the reason
    /// for automatic disables
    fn on_sync_state(&self, _backup_id: BackupId, _enabled: bool, _last_error: SyncError) {}

    /// A transfer changed phase
    fn on_transfer(
        &self,
        _backup_id: BackupId,
        _direction: TransferDirection,
        _phase: TransferPhase,
        _local_path: &Path,
    ) {
    }

    /// A failed operation was scheduled for retry
    fn on_retry(&self, _backup_id: BackupId, _attempt: u32, _delay: Duration) {}

    /// A cloud name was realized locally (or vice versa) with the given
    /// classification
    fn on_filename_anomaly(&self, _local_path: &Path, _remote_path: &str, _kind: FilenameAnomaly) {
    }

    /// A sibling name clash appeared or was re-confirmed
    fn on_name_clash(&self, _backup_id: BackupId, _clash: &NameClash) {}
}

/// Observer that ignores every event; the default when the application
/// has not installed one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ISyncObserver for NullObserver {}
