//! Transfer orchestrator
//!
//! Feeds the external transfer pipeline from per-sync upload and download
//! queues. Concurrent requests for identical content (same fingerprint,
//! same direction) are deduplicated: the first request runs, later ones
//! wait and complete as dedup hits the reconciler resolves cheaply (a
//! server-side node copy for uploads, a local file copy for downloads).
//!
//! Completions come back to the reconciler as [`TransferEvent`]s on an
//! mpsc channel; the reconciler is the only component that mutates the
//! shadow tree in response. A cancelled or failed transfer returns the
//! node to its pre-transfer state so the next pass retries or supersedes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skysync_core::domain::{BackupId, Fingerprint, NodeHandle, NodeId};
use skysync_core::ports::cloud_client::RpcFailure;
use skysync_core::ports::{ISyncObserver, ITransferPipeline, TransferDirection, TransferPhase};

use crate::debris::DebrisFolder;

// ============================================================================
// Request / event types
// ============================================================================

/// A transfer the reconciler wants performed
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Shadow-tree node the transfer belongs to
    pub node: NodeId,
    /// Upload or download
    pub direction: TransferDirection,
    /// Content identity, the dedup key
    pub fingerprint: Fingerprint,
    /// Local file path (source for uploads, destination for downloads)
    pub local_path: PathBuf,
    /// Cloud parent for uploads
    pub parent: Option<NodeHandle>,
    /// Cloud-canonical name for uploads
    pub name: String,
    /// Cloud node for downloads
    pub handle: Option<NodeHandle>,
}

/// How a transfer ended, as classified for the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// Worth retrying with backoff
    Transient,
    /// Quota exhausted: stall the node, keep the sync enabled
    OverQuota,
    /// Session gone: the sync must be disabled
    SessionLost,
}

/// Terminal state of one transfer request
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    /// The transfer ran and succeeded; uploads carry the new node handle
    Completed {
        /// Handle of the created cloud node (uploads only)
        new_handle: Option<NodeHandle>,
    },
    /// Identical content was uploaded by a twin request; make a node
    /// referencing that content instead of re-uploading
    DedupUpload {
        /// Content to reference via a server-side copy
        content: NodeHandle,
    },
    /// Identical content was downloaded by a twin request; copy it from
    /// there instead of re-downloading
    DedupDownload {
        /// Local path that now holds the content
        source: PathBuf,
    },
    /// The transfer failed
    Failed {
        /// Retry / stall / disable classification
        failure: TransferFailure,
        /// Human-readable cause
        message: String,
    },
    /// The transfer was cancelled (sync disable or user action)
    Cancelled,
}

/// Completion notification delivered to the reconciler
#[derive(Debug, Clone)]
pub struct TransferEvent {
    /// Node the originating request named
    pub node: NodeId,
    /// Direction of the originating request
    pub direction: TransferDirection,
    /// How it ended
    pub outcome: TransferOutcome,
}

pub(crate) fn classify_error(err: &anyhow::Error) -> TransferFailure {
    match err.downcast_ref::<RpcFailure>() {
        Some(RpcFailure::OverQuota) => TransferFailure::OverQuota,
        Some(RpcFailure::SessionLost) => TransferFailure::SessionLost,
        _ => TransferFailure::Transient,
    }
}

// ============================================================================
// TransferOrchestrator
// ============================================================================

type DedupKey = (TransferDirection, Fingerprint);

/// Per-sync transfer queues and dedup index
pub struct TransferOrchestrator {
    backup_id: BackupId,
    pipeline: Arc<dyn ITransferPipeline>,
    observer: Arc<dyn ISyncObserver>,
    debris: DebrisFolder,
    events_tx: mpsc::Sender<TransferEvent>,
    uploads: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    /// In-flight transfers keyed by (direction, fingerprint); values are
    /// the waiters that arrived while the primary was running
    inflight: Arc<DashMap<DedupKey, Vec<NodeId>>>,
    /// Requests accepted but not yet reported back
    pending: Arc<AtomicUsize>,
    /// Downloads currently holding the debris lock
    active_downloads: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl TransferOrchestrator {
    /// Creates an orchestrator for one sync.
    ///
    /// `events_tx` is the reconciler's completion channel; `cancel` is the
    /// sync's root token, so disabling the sync abandons all transfers.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backup_id: BackupId,
        pipeline: Arc<dyn ITransferPipeline>,
        observer: Arc<dyn ISyncObserver>,
        debris: DebrisFolder,
        events_tx: mpsc::Sender<TransferEvent>,
        upload_concurrent: usize,
        download_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backup_id,
            pipeline,
            observer,
            debris,
            events_tx,
            uploads: Arc::new(Semaphore::new(upload_concurrent.max(1))),
            downloads: Arc::new(Semaphore::new(download_concurrent.max(1))),
            inflight: Arc::new(DashMap::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            active_downloads: Arc::new(AtomicUsize::new(0)),
            cancel: cancel.clone(),
        }
    }

    /// Number of requests accepted but not yet completed.
    ///
    /// The backup controller treats zero as one of its convergence
    /// conditions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Accepts a transfer request.
    ///
    /// Returns immediately; the outcome arrives on the event channel.
    /// Identical-content requests already in flight are joined rather
    /// than duplicated.
    pub fn enqueue(&self, req: TransferRequest) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.observer.on_transfer(
            self.backup_id,
            req.direction,
            TransferPhase::Queued,
            &req.local_path,
        );

        let key: DedupKey = (req.direction, req.fingerprint);
        {
            let mut joined = false;
            if let Some(mut waiters) = self.inflight.get_mut(&key) {
                waiters.push(req.node);
                joined = true;
            }
            if joined {
                debug!(
                    node = %req.node,
                    direction = %req.direction,
                    "Joined in-flight transfer for identical content"
                );
                return;
            }
        }
        self.inflight.insert(key, Vec::new());

        self.spawn_primary(key, req);
    }

    fn spawn_primary(&self, key: DedupKey, req: TransferRequest) {
        let pipeline = Arc::clone(&self.pipeline);
        let observer = Arc::clone(&self.observer);
        let debris = self.debris.clone();
        let events_tx = self.events_tx.clone();
        let inflight = Arc::clone(&self.inflight);
        let pending = Arc::clone(&self.pending);
        let active_downloads = Arc::clone(&self.active_downloads);
        let semaphore = match req.direction {
            TransferDirection::Upload => Arc::clone(&self.uploads),
            TransferDirection::Download => Arc::clone(&self.downloads),
        };
        let backup_id = self.backup_id;
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            observer.on_transfer(
                backup_id,
                req.direction,
                TransferPhase::Started,
                &req.local_path,
            );

            // The debris lock guards concurrent syncs off in-flight
            // downloads; held while any download is active.
            if req.direction == TransferDirection::Download
                && active_downloads.fetch_add(1, Ordering::AcqRel) == 0
            {
                if let Err(err) = debris.acquire_download_lock().await {
                    warn!(error = %err, "Could not create download lock");
                }
            }

            let outcome = if cancel.is_cancelled() {
                TransferOutcome::Cancelled
            } else {
                let run = async {
                    match req.direction {
                        TransferDirection::Upload => {
                            let parent = req
                                .parent
                                .ok_or_else(|| anyhow::anyhow!("Upload without parent"))?;
                            let handle = pipeline
                                .upload(&req.local_path, parent, &req.name, cancel.clone())
                                .await?;
                            Ok::<_, anyhow::Error>(TransferOutcome::Completed {
                                new_handle: Some(handle),
                            })
                        }
                        TransferDirection::Download => {
                            let handle = req
                                .handle
                                .ok_or_else(|| anyhow::anyhow!("Download without handle"))?;
                            pipeline
                                .download(handle, &req.local_path, cancel.clone())
                                .await?;
                            Ok(TransferOutcome::Completed { new_handle: None })
                        }
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => TransferOutcome::Cancelled,
                    result = run => match result {
                        Ok(outcome) => outcome,
                        Err(err) => TransferOutcome::Failed {
                            failure: classify_error(&err),
                            message: format!("{err:#}"),
                        },
                    },
                }
            };

            if req.direction == TransferDirection::Download
                && active_downloads.fetch_sub(1, Ordering::AcqRel) == 1
            {
                debris.release_download_lock().await;
            }

            let phase = match &outcome {
                TransferOutcome::Completed { .. } => TransferPhase::Completed,
                TransferOutcome::Cancelled => TransferPhase::Cancelled,
                _ => TransferPhase::Failed,
            };
            observer.on_transfer(backup_id, req.direction, phase, &req.local_path);

            // Resolve the waiters that joined while we ran
            let waiters = inflight.remove(&key).map(|(_, w)| w).unwrap_or_default();
            let waiter_outcome = match &outcome {
                TransferOutcome::Completed { new_handle } => match req.direction {
                    TransferDirection::Upload => new_handle
                        .map(|content| TransferOutcome::DedupUpload { content })
                        .unwrap_or_else(|| TransferOutcome::Completed { new_handle: None }),
                    TransferDirection::Download => TransferOutcome::DedupDownload {
                        source: req.local_path.clone(),
                    },
                },
                other => other.clone(),
            };

            info!(
                node = %req.node,
                direction = %req.direction,
                waiters = waiters.len(),
                "Transfer finished"
            );

            let mut events = Vec::with_capacity(1 + waiters.len());
            events.push(TransferEvent {
                node: req.node,
                direction: req.direction,
                outcome,
            });
            for waiter in waiters {
                events.push(TransferEvent {
                    node: waiter,
                    direction: req.direction,
                    outcome: waiter_outcome.clone(),
                });
            }

            for event in events {
                pending.fetch_sub(1, Ordering::AcqRel);
                if events_tx.send(event).await.is_err() {
                    // Reconciler gone; the sync is shutting down
                    break;
                }
            }
        });
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::TokioFileSystem;
    use chrono::Utc;
    use skysync_core::ports::NullObserver;
    use std::path::Path;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Pipeline that counts calls and can be told to fail
    struct CountingPipeline {
        uploads: AtomicU64,
        downloads: AtomicU64,
        fail_with: Option<RpcFailure>,
        delay: Duration,
    }

    impl CountingPipeline {
        fn ok() -> Self {
            Self {
                uploads: AtomicU64::new(0),
                downloads: AtomicU64::new(0),
                fail_with: None,
                delay: Duration::from_millis(20),
            }
        }

        fn failing(failure: RpcFailure) -> Self {
            Self {
                fail_with: Some(failure),
                ..Self::ok()
            }
        }
    }

    #[async_trait::async_trait]
    impl ITransferPipeline for CountingPipeline {
        async fn upload(
            &self,
            _local_path: &Path,
            _parent: NodeHandle,
            _name: &str,
            _cancel: CancellationToken,
        ) -> anyhow::Result<NodeHandle> {
            tokio::time::sleep(self.delay).await;
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = self.fail_with {
                return Err(anyhow::Error::new(failure));
            }
            Ok(NodeHandle::from_raw(0xbeef))
        }

        async fn download(
            &self,
            _node: NodeHandle,
            local_path: &Path,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = self.fail_with {
                return Err(anyhow::Error::new(failure));
            }
            tokio::fs::write(local_path, b"downloaded").await?;
            Ok(())
        }
    }

    fn fp(tag: u8) -> Fingerprint {
        Fingerprint::from_bytes(&[tag; 32], Utc::now())
    }

    /// Mints distinct NodeIds the way the engine does: out of a tree
    fn node_ids(count: usize) -> Vec<NodeId> {
        use skysync_core::domain::{NodeKind, ShadowTree};
        let mut tree = ShadowTree::new(NodeHandle::from_raw(1));
        (0..count)
            .map(|i| {
                tree.add_child(tree.root(), NodeKind::File, format!("n{i}"), format!("n{i}"))
                    .unwrap()
            })
            .collect()
    }

    fn upload_req(node: NodeId, tag: u8, dir: &Path) -> TransferRequest {
        TransferRequest {
            node,
            direction: TransferDirection::Upload,
            fingerprint: fp(tag),
            local_path: dir.join(format!("f{tag}")),
            parent: Some(NodeHandle::from_raw(1)),
            name: format!("f{tag}"),
            handle: None,
        }
    }

    fn orchestrator(
        pipeline: Arc<dyn ITransferPipeline>,
        root: &Path,
    ) -> (TransferOrchestrator, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let debris = DebrisFolder::new(root.to_path_buf(), Arc::new(TokioFileSystem::new()));
        let orch = TransferOrchestrator::new(
            BackupId::from_raw(1),
            pipeline,
            Arc::new(NullObserver),
            debris,
            tx,
            2,
            2,
            CancellationToken::new(),
        );
        (orch, rx)
    }

    #[tokio::test]
    async fn test_upload_completes_with_handle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline::ok());
        let (orch, mut rx) = orchestrator(pipeline.clone(), dir.path());

        let ids = node_ids(1);
        orch.enqueue(upload_req(ids[0], 1, dir.path()));
        assert_eq!(orch.pending(), 1);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.outcome,
            TransferOutcome::Completed { new_handle: Some(h) } if h == NodeHandle::from_raw(0xbeef)
        ));
        assert_eq!(orch.pending(), 0);
    }

    #[tokio::test]
    async fn test_identical_uploads_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline::ok());
        let (orch, mut rx) = orchestrator(pipeline.clone(), dir.path());

        // Same fingerprint, two nodes
        let ids = node_ids(2);
        orch.enqueue(upload_req(ids[0], 7, dir.path()));
        orch.enqueue(upload_req(ids[1], 7, dir.path()));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();

        // One ran, one got a dedup hit
        assert_eq!(pipeline.uploads.load(Ordering::SeqCst), 1);
        let dedups = [&a, &b]
            .iter()
            .filter(|e| matches!(e.outcome, TransferOutcome::DedupUpload { .. }))
            .count();
        assert_eq!(dedups, 1);
    }

    #[tokio::test]
    async fn test_different_content_not_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline::ok());
        let (orch, mut rx) = orchestrator(pipeline.clone(), dir.path());

        let ids = node_ids(2);
        orch.enqueue(upload_req(ids[0], 1, dir.path()));
        orch.enqueue(upload_req(ids[1], 2, dir.path()));

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(pipeline.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quota_failure_classified() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline::failing(RpcFailure::OverQuota));
        let (orch, mut rx) = orchestrator(pipeline, dir.path());

        let ids = node_ids(1);
        orch.enqueue(upload_req(ids[0], 1, dir.path()));
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.outcome,
            TransferOutcome::Failed {
                failure: TransferFailure::OverQuota,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline {
            delay: Duration::from_secs(30),
            ..CountingPipeline::ok()
        });

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let debris = DebrisFolder::new(
            dir.path().to_path_buf(),
            Arc::new(TokioFileSystem::new()),
        );
        let orch = TransferOrchestrator::new(
            BackupId::from_raw(1),
            pipeline,
            Arc::new(NullObserver),
            debris,
            tx,
            2,
            2,
            cancel.clone(),
        );

        let ids = node_ids(1);
        orch.enqueue(upload_req(ids[0], 1, dir.path()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.outcome, TransferOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_download_holds_debris_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline {
            delay: Duration::from_millis(200),
            ..CountingPipeline::ok()
        });
        let (orch, mut rx) = orchestrator(pipeline, dir.path());

        let node = node_ids(1)[0];
        orch.enqueue(TransferRequest {
            node,
            direction: TransferDirection::Download,
            fingerprint: fp(9),
            local_path: dir.path().join("dl.txt"),
            parent: None,
            name: String::new(),
            handle: Some(NodeHandle::from_raw(5)),
        });

        // Lock appears while the download runs
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dir.path().join(".debris/tmp/lock").exists());

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dir.path().join(".debris/tmp/lock").exists());
    }
}
