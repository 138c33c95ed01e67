//! Domain model
//!
//! The types the whole engine reasons in: validated identifiers and
//! paths, content fingerprints, the filename canonicalization layer, the
//! LocalNode shadow tree, the mirrored cloud tree, and the persistent
//! sync configuration.

pub mod canonical;
pub mod cloud;
pub mod errors;
pub mod fingerprint;
pub mod newtypes;
pub mod shadow;
pub mod sync_config;

pub use canonical::{ClashSide, FilenameAnomaly, NameClash, NamePolicy};
pub use cloud::{CloudNode, CloudTree};
pub use errors::{DomainError, SyncError};
pub use fingerprint::{Fingerprint, MediaClass};
pub use newtypes::{BackupId, DriveId, LocalPath, NodeHandle, RemotePath};
pub use shadow::{LocalNode, NodeId, NodeKind, ShadowTree};
pub use sync_config::{BackupState, SyncConfig, SyncType};
