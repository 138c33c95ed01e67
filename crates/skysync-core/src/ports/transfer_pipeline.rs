//! Transfer pipeline port (driven/secondary port)
//!
//! The chunked, encrypted up/download machinery is external; the engine
//! only starts transfers and observes their completion. Cancellation is
//! cooperative via a [`CancellationToken`] so a disabled sync can abandon
//! in-flight work without tearing down unrelated transfers.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::domain::newtypes::NodeHandle;

/// Port trait for content transfers
#[async_trait::async_trait]
pub trait ITransferPipeline: Send + Sync {
    /// Uploads a local file as a child of `parent`, returning the handle
    /// of the created cloud node
    ///
    /// # Arguments
    /// * `local_path` - The file to read
    /// * `parent` - The cloud folder to create the node under
    /// * `name` - The cloud-canonical name of the new node
    /// * `cancel` - Cooperative cancellation for this transfer
    async fn upload(
        &self,
        local_path: &Path,
        parent: NodeHandle,
        name: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<NodeHandle>;

    /// Downloads a cloud node's content to `local_path`
    ///
    /// Implementations write to a temporary location and rename into
    /// place, so a cancelled download never leaves a partial file at the
    /// destination.
    async fn download(
        &self,
        node: NodeHandle,
        local_path: &Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}
