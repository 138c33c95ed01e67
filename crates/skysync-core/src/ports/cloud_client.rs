//! Cloud RPC client port (driven/secondary port)
//!
//! The interface the engine uses to mutate the remote tree. The concrete
//! client (HTTP transport, session handling, retries below this boundary)
//! lives outside the core; the engine only sees these verbs plus the
//! pushed delta stream.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are
//!   adapter-specific; the reconciler classifies them with
//!   [`RpcFailure`] hints carried in the error chain where available.
//! - All verbs are awaited by spawned tasks, never by the reconciler
//!   itself, so a slow round-trip cannot stall a sync pass.
//! - Deltas are pushed: the adapter feeds [`DeltaBatch`]es into an mpsc
//!   channel handed to each sync at startup. A batch is applied atomically
//!   with respect to the reconciler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::cloud::CloudNode;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::newtypes::NodeHandle;
use crate::domain::shadow::NodeKind;

// ============================================================================
// DTOs
// ============================================================================

/// A node to be created by [`ICloudClient::put_nodes`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    /// File or folder
    pub kind: NodeKind,
    /// Cloud-canonical name
    pub name: String,
    /// Content identity for files
    pub fingerprint: Option<Fingerprint>,
    /// Initial attributes
    pub attrs: BTreeMap<String, String>,
    /// Existing content to link instead of fresh content (server-side copy)
    pub content_from: Option<NodeHandle>,
}

impl NewNode {
    /// A new folder
    #[must_use]
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Folder,
            name: name.into(),
            fingerprint: None,
            attrs: BTreeMap::new(),
            content_from: None,
        }
    }

    /// A file node referencing already-uploaded or existing content
    #[must_use]
    pub fn file_from(
        name: impl Into<String>,
        fingerprint: Fingerprint,
        content_from: NodeHandle,
    ) -> Self {
        Self {
            kind: NodeKind::File,
            name: name.into(),
            fingerprint: Some(fingerprint),
            attrs: BTreeMap::new(),
            content_from: Some(content_from),
        }
    }
}

/// One server-pushed tree mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteDelta {
    /// A node appeared (or its content was replaced, carrying the same handle)
    Added(CloudNode),
    /// A node (and its subtree) disappeared
    Removed(NodeHandle),
    /// A node was reparented and/or renamed
    Moved {
        /// The node that moved
        handle: NodeHandle,
        /// Its new containing folder
        new_parent: NodeHandle,
        /// Its new name
        new_name: String,
    },
    /// Node attributes changed
    AttrsChanged {
        /// The node whose attributes changed
        handle: NodeHandle,
        /// The updated attributes (merged over existing ones)
        attrs: BTreeMap<String, String>,
    },
}

/// An atomic batch of deltas in server-assigned order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaBatch {
    /// Server-assigned sequence number; batches apply in this order
    pub seq: u64,
    /// The mutations, in order
    pub deltas: Vec<RemoteDelta>,
    /// True when the batch was caused by another client (not this one).
    ///
    /// Backup syncs use this to tell mirror echoes from foreign
    /// divergence.
    pub foreign: bool,
}

/// Classification hint an adapter can attach to RPC failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFailure {
    /// Worth retrying with backoff
    Transient,
    /// Storage quota exhausted; stall, do not disable
    OverQuota,
    /// The session is gone; the sync must be disabled
    SessionLost,
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RpcFailure::Transient => "transient failure",
            RpcFailure::OverQuota => "over quota",
            RpcFailure::SessionLost => "session lost",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for RpcFailure {}

// ============================================================================
// ICloudClient
// ============================================================================

/// Port trait for cloud tree mutations
#[async_trait::async_trait]
pub trait ICloudClient: Send + Sync {
    /// Creates nodes under `parent`, returning their handles in order
    ///
    /// # Arguments
    /// * `parent` - The containing folder
    /// * `nodes` - The nodes to create
    async fn put_nodes(
        &self,
        parent: NodeHandle,
        nodes: Vec<NewNode>,
    ) -> anyhow::Result<Vec<NodeHandle>>;

    /// Permanently removes a node and its subtree
    async fn unlink(&self, node: NodeHandle) -> anyhow::Result<()>;

    /// Reparents and/or renames a node
    async fn rename(
        &self,
        node: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
    ) -> anyhow::Result<()>;

    /// Merges attribute updates into a node
    async fn set_attr(
        &self,
        node: NodeHandle,
        attrs: BTreeMap<String, String>,
    ) -> anyhow::Result<()>;

    /// Fetches the full remote tree (initial load or post-inconsistency rescan)
    async fn fetch_nodes(&self) -> anyhow::Result<Vec<CloudNode>>;

    /// Blocks until all deltas caused by this client's own actions have
    /// been delivered, so a pass can observe its own effects
    async fn catchup(&self) -> anyhow::Result<()>;

    /// The account's rubbish-bin folder, destination of remote soft deletes
    fn rubbish_handle(&self) -> NodeHandle;

    /// Opens a fresh subscription to the pushed delta stream.
    ///
    /// Each sync runner holds its own receiver; the adapter fans batches
    /// out to every subscriber in server order.
    fn subscribe_deltas(&self) -> tokio::sync::mpsc::Receiver<DeltaBatch>;
}
