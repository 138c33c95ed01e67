//! SkySync Engine - Bidirectional sync reconciliation
//!
//! Provides:
//! - Filesystem watching with event coalescing and loss recovery
//! - Remote delta consumption into the cloud mirror
//! - The per-sync reconciler (decision table, move detection, conflict
//!   and clash handling, sync debris)
//! - Fingerprint-deduplicated transfer orchestration
//! - The backup mirror/monitor state machine
//! - [`service::SyncService`], the embeddable programmatic surface

pub mod backup;
pub mod debris;
pub mod filesystem;
pub mod reconciler;
pub mod remote;
pub mod service;
pub mod transfers;
pub mod watcher;

pub use backup::{BackupController, BackupVerdict};
pub use filesystem::TokioFileSystem;
pub use reconciler::{decide, decide_backup, Action, PassSummary, Reconciler, SideChange};
pub use service::{AddSyncParams, SyncService};
pub use transfers::{TransferEvent, TransferOrchestrator, TransferOutcome, TransferRequest};
pub use watcher::{CoalescingQueue, PathEvent, PathEventKind, RootWatcher, WatcherSignal};
