//! The reconciler: per-sync decision engine
//!
//! Each pass has three phases over a depth-first walk of the shadow tree:
//!
//! 1. **Scan-up**: incorporate settled watcher events (or a full rescan),
//!    fingerprint newly appeared files, and detect local moves by unique
//!    fingerprint match against nodes whose file has vanished.
//! 2. **Scan-down**: fold the queued remote delta batches into per-node
//!    remote change marks (batches were already applied atomically to the
//!    cloud mirror by [`Reconciler::note_delta_batch`]).
//! 3. **Act**: for each actionable node emit at most one action chosen by
//!    the decision table, then handle unmatched new entries on both sides.
//!
//! All shadow-tree mutation happens on the sync's own task; cloud RPCs
//! and transfers are spawned and report back through channels, so a pass
//! never blocks on a network round-trip. The reconciler is the single
//! point that decides between retry, stall, and disable.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use skysync_core::config::RetryConfig;
use skysync_core::domain::canonical::{self, ClashSide, FilenameAnomaly, NameClash, NamePolicy};
use skysync_core::domain::cloud::RESTORE_ATTR;
use skysync_core::domain::{
    BackupId, CloudNode, CloudTree, Fingerprint, NodeHandle, NodeId, NodeKind, ShadowTree,
    SyncError,
};
use skysync_core::ports::cloud_client::NewNode;
use skysync_core::ports::{
    DeltaBatch, EntryInfo, ICloudClient, IFileSystem, ISyncObserver, TransferDirection,
};

use crate::backup::{BackupController, BackupVerdict};
use crate::debris::{self, DebrisFolder};
use crate::remote::DeltaConsumer;
use crate::transfers::{
    classify_error, TransferEvent, TransferFailure, TransferOrchestrator, TransferOutcome,
    TransferRequest,
};
use crate::watcher::{CoalescingQueue, PathEvent, PathEventKind, WatcherSignal};

// ============================================================================
// Decision table
// ============================================================================

/// Per-side change observed since the last pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideChange {
    /// Nothing happened on this side
    Unchanged,
    /// Content changed in place
    Modified,
    /// The entry moved or was renamed
    Moved,
    /// The entry disappeared
    Deleted,
}

/// What the reconciler does about one node this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do
    None,
    /// Pull remote content over the local entry
    Download,
    /// Replay the remote move on the local filesystem
    ApplyRemoteMoveLocally,
    /// Move the local entry to sync debris (remote side deleted it)
    DeleteLocal,
    /// Push local content to the remote node
    Upload,
    /// Both sides diverged on content; resolve by mtime/CRC
    Conflict,
    /// Follow the remote move locally, then upload the local content
    UploadAndFollowRemoteMove,
    /// The remote node is gone but local changes survive; re-create it
    RecreateRemote,
    /// Replay the local move on the remote tree
    MoveRemote,
    /// Replay the local move remotely, then pull the new remote content
    MoveRemoteThenDownload,
    /// Both sides moved the node; the lexicographically smaller parent
    /// path wins (a side that deleted has no path left to win)
    PickPathWinner,
    /// The local entry is gone but remote changes survive; re-create it
    RecreateLocal,
    /// Move the remote node to the cloud rubbish (local side deleted it)
    DeleteRemote,
}

/// The two-way decision table: rows are the local change, columns the
/// remote change.
#[must_use]
pub fn decide(local: SideChange, remote: SideChange) -> Action {
    use SideChange::{Deleted, Modified, Moved, Unchanged};
    match (local, remote) {
        (Unchanged, Unchanged) => Action::None,
        (Unchanged, Modified) => Action::Download,
        (Unchanged, Moved) => Action::ApplyRemoteMoveLocally,
        (Unchanged, Deleted) => Action::DeleteLocal,

        (Modified, Unchanged) => Action::Upload,
        (Modified, Modified) => Action::Conflict,
        (Modified, Moved) => Action::UploadAndFollowRemoteMove,
        (Modified, Deleted) => Action::RecreateRemote,

        (Moved, Unchanged) => Action::MoveRemote,
        (Moved, Modified) => Action::MoveRemoteThenDownload,
        (Moved, Moved) => Action::PickPathWinner,
        (Moved, Deleted) => Action::RecreateRemote,

        (Deleted, Unchanged) => Action::DeleteRemote,
        (Deleted, Modified) => Action::RecreateLocal,
        (Deleted, Moved) => Action::PickPathWinner,
        (Deleted, Deleted) => Action::None,
    }
}

/// Backup variant of the table: the local side always wins, so every
/// remote deviation is converged back instead of propagated.
#[must_use]
pub fn decide_backup(local: SideChange, remote: SideChange) -> Action {
    use SideChange::{Deleted, Modified, Moved, Unchanged};
    match (local, remote) {
        (Unchanged, Unchanged) => Action::None,
        // Remote drifted: restore it from the local side
        (Unchanged, Modified) => Action::Upload,
        (Unchanged, Moved) => Action::MoveRemote,
        (Unchanged, Deleted) => Action::RecreateRemote,
        // Local changes propagate as usual
        (Modified, _) => Action::Upload,
        (Moved, Deleted) => Action::RecreateRemote,
        (Moved, _) => Action::MoveRemote,
        (Deleted, Deleted) => Action::None,
        (Deleted, _) => Action::DeleteRemote,
    }
}

// ============================================================================
// Internal plumbing types
// ============================================================================

/// Context an in-flight cloud RPC carries back to the reconciler
#[derive(Debug, Clone)]
pub enum RpcKind {
    /// put_nodes of a folder; success pairs the node with handles[0]
    CreateFolder,
    /// put_nodes referencing deduplicated content; success pairs the node
    CreateFromContent,
    /// rename into rubbish (plus `rr` stamp); success unpairs the node
    RubbishNode {
        /// Whether the shadow node was deleted locally too and can be
        /// reaped on success
        tombstone: bool,
    },
    /// rename within the tree; success updates the cloud mirror
    MoveRemote {
        /// Destination folder handle
        new_parent: NodeHandle,
        /// Destination name
        new_name: String,
    },
}

/// Completion of a spawned cloud RPC
#[derive(Debug)]
pub struct RpcDone {
    node: NodeId,
    kind: RpcKind,
    handle: Option<NodeHandle>,
    result: Result<Vec<NodeHandle>, (TransferFailure, String)>,
}

/// A new local entry seen by scan-up with no shadow node yet
#[derive(Debug, Clone)]
struct NewLocalEntry {
    parent: NodeId,
    info: EntryInfo,
    fingerprint: Option<Fingerprint>,
}

/// Summary of one reconciler pass
#[derive(Debug, Default)]
pub struct PassSummary {
    /// Actions emitted this pass
    pub actions: usize,
    /// Work still outstanding (transfers, RPCs)
    pub pending: usize,
    /// The sync must be disabled with this reason
    pub fatal: Option<SyncError>,
    /// A backup sync entered monitoring this pass
    pub entered_monitoring: bool,
}

// ============================================================================
// Reconciler
// ============================================================================

/// Per-sync reconciliation engine. One instance per enabled sync, owned
/// by that sync's runner task.
pub struct Reconciler {
    backup_id: BackupId,
    root: PathBuf,
    policy: NamePolicy,
    shadow: ShadowTree,
    cloud: CloudTree,
    consumer: DeltaConsumer,
    fs: Arc<dyn IFileSystem>,
    cloud_client: Arc<dyn ICloudClient>,
    transfers: TransferOrchestrator,
    observer: Arc<dyn ISyncObserver>,
    debris: DebrisFolder,
    backup: Option<BackupController>,
    retry: RetryConfig,

    // Pass state
    local_changes: HashMap<NodeId, SideChange>,
    move_targets: HashMap<NodeId, (NodeId, String)>,
    remote_changes: HashMap<NodeId, SideChange>,
    new_local: Vec<NewLocalEntry>,
    new_remote: HashSet<NodeHandle>,
    touched_handles: HashSet<NodeHandle>,
    removed_handles: HashSet<NodeHandle>,

    // Node bookkeeping
    busy: HashSet<NodeId>,
    stalled: HashSet<NodeId>,
    clashed: HashSet<NodeId>,
    retries: HashMap<NodeId, u32>,
    not_before: HashMap<NodeId, Instant>,

    clashes: Arc<RwLock<Vec<NameClash>>>,
    rpc_tx: mpsc::Sender<RpcDone>,
    diverged_this_pass: bool,
    rescan_needed: bool,
    fatal: Option<SyncError>,
}

impl Reconciler {
    /// Creates a reconciler over a fresh or restored shadow tree.
    ///
    /// Pass the persisted shadow tree for session resume (`keep_cache`);
    /// a fresh tree forces the first pass to pair everything from
    /// scratch. Drain the returned receiver in the runner loop and feed
    /// each value to [`Reconciler::note_rpc_done`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backup_id: BackupId,
        root: PathBuf,
        policy: NamePolicy,
        shadow: ShadowTree,
        fs: Arc<dyn IFileSystem>,
        cloud_client: Arc<dyn ICloudClient>,
        transfers: TransferOrchestrator,
        observer: Arc<dyn ISyncObserver>,
        debris: DebrisFolder,
        backup: Option<BackupController>,
        retry: RetryConfig,
        clashes: Arc<RwLock<Vec<NameClash>>>,
    ) -> (Self, mpsc::Receiver<RpcDone>) {
        let (rpc_tx, rpc_rx) = mpsc::channel(256);
        (
            Self {
                backup_id,
                root,
                policy,
                shadow,
                cloud: CloudTree::new(),
                consumer: DeltaConsumer::new(),
                fs,
                cloud_client,
                transfers,
                observer,
                debris,
                backup,
                retry,
                local_changes: HashMap::new(),
                move_targets: HashMap::new(),
                remote_changes: HashMap::new(),
                new_local: Vec::new(),
                new_remote: HashSet::new(),
                touched_handles: HashSet::new(),
                removed_handles: HashSet::new(),
                busy: HashSet::new(),
                stalled: HashSet::new(),
                clashed: HashSet::new(),
                retries: HashMap::new(),
                not_before: HashMap::new(),
                clashes,
                rpc_tx,
                diverged_this_pass: false,
                rescan_needed: true,
                fatal: None,
            },
            rpc_rx,
        )
    }

    /// Shared handle on the current clash records (the public "list
    /// conflicts" surface reads through this).
    #[must_use]
    pub fn clash_records(&self) -> Arc<RwLock<Vec<NameClash>>> {
        Arc::clone(&self.clashes)
    }

    /// The shadow tree, for persistence on shutdown (`keep_cache`).
    #[must_use]
    pub fn shadow(&self) -> &ShadowTree {
        &self.shadow
    }

    /// Seeds the cloud mirror from a full `fetch_nodes` result.
    pub fn load_remote(&mut self, nodes: Vec<CloudNode>, seq: Option<u64>) {
        let mut tree = CloudTree::new();
        let mut handles = Vec::new();
        for node in nodes {
            handles.push(node.handle);
            tree.upsert(node);
        }
        self.cloud = tree;
        self.consumer.reset(seq);
        // Every mirrored node is re-examined against the shadow tree
        self.touched_handles.extend(handles);
        self.rescan_needed = true;
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Feeds one watcher signal into the coalescing queue / pass state.
    pub fn note_watcher_signal(&mut self, signal: WatcherSignal, queue: &mut CoalescingQueue) {
        match signal {
            WatcherSignal::Event(event) => queue.push(event),
            WatcherSignal::Lost => {
                warn!(backup_id = %self.backup_id, "Watcher lost, full rescan scheduled");
                queue.drain();
                self.rescan_needed = true;
            }
        }
    }

    /// Applies one remote delta batch atomically to the cloud mirror and
    /// records the affected handles for the next pass.
    pub fn note_delta_batch(&mut self, batch: DeltaBatch) {
        let applied = match self.consumer.apply(&mut self.cloud, batch) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(error = %err, "Delta stream broken, remote reload required");
                self.rescan_needed = true;
                return;
            }
        };

        if applied.foreign && (!applied.touched.is_empty() || !applied.removed.is_empty()) {
            if let Some(controller) = &self.backup {
                match controller.on_foreign_change() {
                    BackupVerdict::OverwriteRemote => self.diverged_this_pass = true,
                    BackupVerdict::Disable(reason) => {
                        self.fatal = Some(reason);
                        return;
                    }
                }
            }
        }

        self.touched_handles.extend(applied.touched);
        self.removed_handles.extend(applied.removed);
    }

    /// Applies one transfer completion to the shadow tree.
    pub async fn note_transfer_event(&mut self, event: TransferEvent) {
        self.busy.remove(&event.node);
        match event.outcome {
            TransferOutcome::Completed { new_handle } => {
                self.retries.remove(&event.node);
                match event.direction {
                    TransferDirection::Upload => {
                        if let Some(handle) = new_handle {
                            self.finish_upload(event.node, handle);
                        }
                    }
                    TransferDirection::Download => self.finish_download(event.node).await,
                }
            }
            TransferOutcome::DedupUpload { content } => {
                self.spawn_copy_from_content(event.node, content);
            }
            TransferOutcome::DedupDownload { source } => {
                self.finish_dedup_download(event.node, &source).await;
            }
            TransferOutcome::Failed { failure, message } => {
                self.note_failure(event.node, failure, &message);
            }
            TransferOutcome::Cancelled => {
                debug!(node = %event.node, "Transfer cancelled, node stays pending");
            }
        }
    }

    /// Applies one cloud RPC completion to the shadow tree and mirror.
    pub fn note_rpc_done(&mut self, done: RpcDone) {
        self.busy.remove(&done.node);
        let handles = match done.result {
            Ok(handles) => {
                self.retries.remove(&done.node);
                handles
            }
            Err((failure, message)) => {
                self.note_failure(done.node, failure, &message);
                return;
            }
        };

        match done.kind {
            RpcKind::CreateFolder | RpcKind::CreateFromContent => {
                if let Some(&handle) = handles.first() {
                    self.finish_remote_create(done.node, handle);
                }
            }
            RpcKind::RubbishNode { tombstone } => {
                if let Some(handle) = done.handle {
                    self.cloud.remove_subtree(handle);
                }
                self.shadow.clear_remote(done.node);
                if tombstone {
                    self.reap_subtree(done.node);
                }
            }
            RpcKind::MoveRemote {
                new_parent,
                new_name,
            } => {
                if let Some(handle) = done.handle {
                    let _ = self.cloud.move_node(handle, new_parent, new_name);
                }
            }
        }
    }

    fn note_failure(&mut self, node: NodeId, failure: TransferFailure, message: &str) {
        match failure {
            TransferFailure::Transient => {
                let attempt = {
                    let entry = self.retries.entry(node).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt > self.retry.max_attempts {
                    warn!(node = %node, message, "Retry ceiling reached, stalling node");
                    self.stalled.insert(node);
                } else {
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    debug!(node = %node, attempt, ?delay, message, "Scheduling retry");
                    self.observer.on_retry(self.backup_id, attempt, delay);
                    self.not_before.insert(node, Instant::now() + delay);
                }
            }
            TransferFailure::OverQuota => {
                warn!(node = %node, "Over quota, node stalled; sync stays enabled");
                self.stalled.insert(node);
            }
            TransferFailure::SessionLost => {
                warn!(node = %node, "Cloud session lost, disabling sync");
                self.fatal = Some(SyncError::RemotePathGone);
            }
        }
    }

    // ========================================================================
    // Scan-up: local filesystem into pass state
    // ========================================================================

    /// Folds one settled path event into the pass state.
    async fn scan_up_event(&mut self, event: PathEvent) -> Result<()> {
        let Ok(rel) = event.path.strip_prefix(&self.root).map(Path::to_path_buf) else {
            return Ok(());
        };
        if debris::is_debris_path(&self.root, &event.path) {
            return Ok(());
        }

        let node = self.resolve_local(&rel);
        let on_disk = self.fs.entry(&event.path).await?;

        match (node, on_disk) {
            (Some(id), None) => {
                debug!(node = %id, path = %event.path.display(), "Local entry gone");
                // The creation half of a rename may already have claimed
                // this node as a move; the move subsumes the deletion
                if self.local_changes.get(&id) != Some(&SideChange::Moved) {
                    self.local_changes.insert(id, SideChange::Deleted);
                }
            }
            (Some(id), Some(info)) => {
                if info.is_symlink {
                    self.report_symlink(&event.path);
                    return Ok(());
                }
                if info.kind == NodeKind::File && event.kind != PathEventKind::AttrChanged {
                    let fp = self.fs.fingerprint(&event.path).await?;
                    let old = self.shadow.node(id).and_then(|n| n.fingerprint().copied());
                    if old != Some(fp) {
                        if let Some(n) = self.shadow.node_mut(id) {
                            n.set_fingerprint(fp);
                        }
                        self.local_changes.insert(id, SideChange::Modified);
                    }
                }
            }
            (None, Some(info)) => {
                if info.is_symlink {
                    self.report_symlink(&event.path);
                    return Ok(());
                }
                self.note_new_local(&rel, info).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Registers a new local entry, detecting moves by unique fingerprint
    /// match and sibling clashes by canonical-name collision.
    async fn note_new_local(&mut self, rel: &Path, info: EntryInfo) -> Result<()> {
        let Some(parent) = self.resolve_local_parent(rel) else {
            // Parent not tracked yet; its own create event (or the
            // rescan) brings this entry in later
            return Ok(());
        };

        let fingerprint = if info.kind == NodeKind::File {
            Some(self.fs.fingerprint(&self.root.join(rel)).await?)
        } else {
            None
        };

        // Move detection: exactly one tracked file with this fingerprint
        // whose local copy is now absent means the entry moved here
        if let Some(fp) = fingerprint {
            let mut candidates = Vec::new();
            for id in self.shadow.walk_dfs() {
                if id == self.shadow.root() {
                    continue;
                }
                let matches = self
                    .shadow
                    .node(id)
                    .map(|n| {
                        n.kind() == NodeKind::File
                            && n.fingerprint() == Some(&fp)
                            && !n.is_deleted()
                    })
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
                let path = self.root.join(self.shadow.local_rel_path(id));
                if self.fs.entry(&path).await?.is_none() {
                    candidates.push(id);
                }
            }
            if let [moved] = candidates[..] {
                info!(node = %moved, to = %rel.display(), "Local move detected by fingerprint");
                self.local_changes.insert(moved, SideChange::Moved);
                self.move_targets.insert(moved, (parent, info.name));
                return Ok(());
            }
        }

        // A rescan may re-surface an entry that is already queued
        if !self
            .new_local
            .iter()
            .any(|e| e.parent == parent && e.info.name == info.name)
        {
            self.new_local.push(NewLocalEntry {
                parent,
                info,
                fingerprint,
            });
        }
        Ok(())
    }

    /// Full local rescan: walks the filesystem under the root and diffs
    /// it against the shadow tree. Used at startup, on session resume,
    /// and after watcher loss.
    async fn full_rescan(&mut self) -> Result<()> {
        info!(backup_id = %self.backup_id, "Full local rescan");

        let mut stack = vec![(self.shadow.root(), self.root.clone())];
        let mut seen: HashSet<NodeId> = HashSet::new();
        seen.insert(self.shadow.root());

        while let Some((dir_node, dir_path)) = stack.pop() {
            let entries = match self.fs.read_dir(&dir_path).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %dir_path.display(), error = %err, "Rescan cannot read dir");
                    continue;
                }
            };

            for info in entries {
                if dir_node == self.shadow.root() && info.name == debris::DEBRIS_DIR {
                    continue;
                }
                if info.is_symlink {
                    self.report_symlink(&dir_path.join(&info.name));
                    continue;
                }

                match self.shadow.lookup_child_local(dir_node, &info.name) {
                    Some(id) => {
                        seen.insert(id);
                        if info.kind == NodeKind::File {
                            let path = dir_path.join(&info.name);
                            let fp = self.fs.fingerprint(&path).await?;
                            let old =
                                self.shadow.node(id).and_then(|n| n.fingerprint().copied());
                            if old != Some(fp) {
                                if let Some(n) = self.shadow.node_mut(id) {
                                    n.set_fingerprint(fp);
                                }
                                self.local_changes.insert(id, SideChange::Modified);
                            }
                        } else {
                            stack.push((id, dir_path.join(&info.name)));
                        }
                    }
                    None => {
                        let rel = dir_path
                            .join(&info.name)
                            .strip_prefix(&self.root)
                            .map(Path::to_path_buf)
                            .unwrap_or_default();
                        self.note_new_local(&rel, info).await?;
                    }
                }
            }
        }

        // Tracked nodes not seen on disk are local deletes. Only nodes
        // whose parent was reachable are marked; descendants follow when
        // the delete executes.
        for id in self.shadow.walk_dfs() {
            if id == self.shadow.root() || seen.contains(&id) {
                continue;
            }
            let parent_seen = self
                .shadow
                .node(id)
                .and_then(|n| n.parent())
                .map(|p| seen.contains(&p))
                .unwrap_or(false);
            if parent_seen && self.local_changes.get(&id) != Some(&SideChange::Moved) {
                self.local_changes.insert(id, SideChange::Deleted);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Scan-down: cloud mirror into pass state
    // ========================================================================

    fn scan_down(&mut self) {
        let Some(root_handle) = self.shadow.node(self.shadow.root()).and_then(|n| n.remote())
        else {
            return;
        };

        for handle in std::mem::take(&mut self.removed_handles) {
            if let Some(id) = self.shadow.by_handle(handle) {
                self.remote_changes.insert(id, SideChange::Deleted);
            }
        }

        for handle in std::mem::take(&mut self.touched_handles) {
            let Some(cloud_node) = self.cloud.node(handle).cloned() else {
                continue;
            };
            match self.shadow.by_handle(handle) {
                Some(id) => {
                    if !self.cloud.is_under(handle, root_handle) {
                        // Moved out of the sync subtree: gone as far as
                        // this sync is concerned
                        self.remote_changes.insert(id, SideChange::Deleted);
                        continue;
                    }
                    let (name, parent_handle, fp) = match self.shadow.node(id) {
                        Some(node) => (
                            node.name().to_string(),
                            node.parent()
                                .and_then(|p| self.shadow.node(p))
                                .and_then(|p| p.remote()),
                            node.fingerprint().copied(),
                        ),
                        None => continue,
                    };
                    let moved = cloud_node.name != name
                        || (parent_handle.is_some() && cloud_node.parent != parent_handle);
                    let modified = cloud_node.kind == NodeKind::File
                        && cloud_node.fingerprint.is_some()
                        && cloud_node.fingerprint != fp;
                    if moved {
                        self.remote_changes.insert(id, SideChange::Moved);
                    } else if modified {
                        self.remote_changes.insert(id, SideChange::Modified);
                    }
                }
                None => {
                    if handle != root_handle && self.cloud.is_under(handle, root_handle) {
                        self.new_remote.insert(handle);
                    }
                }
            }
        }
    }

    // ========================================================================
    // The pass
    // ========================================================================

    /// Runs one full reconciliation pass.
    ///
    /// # Errors
    /// Propagates filesystem errors; RPC and transfer failures never
    /// surface here (they come back through the completion channels).
    pub async fn pass(&mut self, queue: &mut CoalescingQueue) -> Result<PassSummary> {
        let mut summary = PassSummary::default();

        if let Some(reason) = self.fatal.take() {
            summary.fatal = Some(reason);
            return Ok(summary);
        }

        // Invariants I1/I2/I4 hold between passes or the sync is done
        // for: the tree is no longer trustworthy, so the pass never runs
        // on it
        if let Err(err) = self.shadow.check_invariants() {
            warn!(backup_id = %self.backup_id, error = %err, "Shadow tree invariant broken");
            summary.fatal = Some(SyncError::InternalInconsistency);
            return Ok(summary);
        }

        // Clash records rebuild every pass so resolved clashes clear
        // automatically
        self.clashed.clear();
        if let Ok(mut clashes) = self.clashes.write() {
            clashes.clear();
        }

        // Phase 1: scan-up
        if self.rescan_needed {
            self.rescan_needed = false;
            queue.drain();
            self.full_rescan().await?;
        } else {
            for event in queue.poll() {
                self.scan_up_event(event).await?;
            }
        }

        // Phase 2: scan-down
        self.scan_down();

        // Phase 3: act. Clash detection runs first so clashing entries
        // block their tracked partners before any action is chosen.
        let clean_new_local = self.detect_local_clashes().await?;
        summary.actions += self.act_on_existing().await?;
        summary.actions += self.act_on_new_remote().await?;
        summary.actions += self.act_on_new_local(clean_new_local).await?;

        if let Some(reason) = self.fatal.take() {
            summary.fatal = Some(reason);
            return Ok(summary);
        }

        summary.pending = self.transfers.pending() + self.busy.len();

        if let Some(controller) = &mut self.backup {
            let converged = summary.pending == 0
                && summary.actions == 0
                && self.local_changes.is_empty()
                && self.remote_changes.is_empty()
                && self.new_local.is_empty()
                && self.new_remote.is_empty();
            if converged && controller.on_pass_complete(0, self.diverged_this_pass) {
                summary.entered_monitoring = true;
            }
        }
        self.diverged_this_pass = false;

        Ok(summary)
    }

    /// Decision-table phase over already-tracked nodes.
    async fn act_on_existing(&mut self) -> Result<usize> {
        let mut actions = 0;
        let now = Instant::now();

        for id in self.shadow.walk_dfs() {
            if id == self.shadow.root() {
                continue;
            }
            if self.busy.contains(&id) || self.stalled.contains(&id) || self.clashed.contains(&id)
            {
                continue;
            }
            if self.not_before.get(&id).map(|&t| t > now).unwrap_or(false) {
                continue;
            }

            let local = self
                .local_changes
                .get(&id)
                .copied()
                .unwrap_or(SideChange::Unchanged);
            let remote = self
                .remote_changes
                .get(&id)
                .copied()
                .unwrap_or(SideChange::Unchanged);
            if local == SideChange::Unchanged && remote == SideChange::Unchanged {
                continue;
            }

            let action = if self.backup.is_some() {
                decide_backup(local, remote)
            } else {
                decide(local, remote)
            };
            debug!(node = %id, ?local, ?remote, ?action, "Decision");

            // Clear the marks first so an action may re-mark the node for
            // its follow-up pass; deferred actions restore them.
            self.local_changes.remove(&id);
            self.remote_changes.remove(&id);

            if self.execute(id, action).await? {
                actions += 1;
            } else {
                if local != SideChange::Unchanged {
                    self.local_changes.insert(id, local);
                }
                if remote != SideChange::Unchanged {
                    self.remote_changes.insert(id, remote);
                }
            }
        }
        Ok(actions)
    }

    /// Executes one action for one node. Returns `false` when the action
    /// had to be deferred (e.g. parent not created yet).
    async fn execute(&mut self, id: NodeId, action: Action) -> Result<bool> {
        match action {
            Action::None => Ok(true),

            Action::Upload => self.start_upload(id),

            Action::Download | Action::RecreateLocal => self.start_download(id).await,

            Action::DeleteLocal => {
                let rel = self.shadow.local_rel_path(id);
                self.debris.stash(&rel).await?;
                self.reap_subtree(id);
                Ok(true)
            }

            Action::DeleteRemote => {
                self.start_rubbish(id, true);
                Ok(true)
            }

            Action::MoveRemote => self.start_remote_move(id),

            Action::ApplyRemoteMoveLocally => self.apply_remote_move_locally(id).await,

            Action::MoveRemoteThenDownload => {
                // The move lands first; the content pull runs next pass
                let moved = self.start_remote_move(id)?;
                if moved {
                    self.remote_changes.insert(id, SideChange::Modified);
                }
                Ok(moved)
            }

            Action::UploadAndFollowRemoteMove => {
                let moved = self.apply_remote_move_locally(id).await?;
                if moved {
                    self.local_changes.insert(id, SideChange::Modified);
                }
                Ok(moved)
            }

            Action::RecreateRemote => {
                // The remote node is gone; unpair and rebuild from local
                self.shadow.clear_remote(id);
                let kind = self.shadow.node(id).map(|n| n.kind());
                match kind {
                    Some(NodeKind::File) => self.start_upload(id),
                    Some(NodeKind::Folder) => self.start_create_folder(id),
                    None => Ok(true),
                }
            }

            Action::Conflict => self.resolve_conflict(id).await,

            Action::PickPathWinner => self.pick_path_winner(id).await,
        }
    }

    // ------------------------------------------------------------------
    // Action implementations
    // ------------------------------------------------------------------

    fn start_upload(&mut self, id: NodeId) -> Result<bool> {
        let (kind, fp, name, parent_handle) = {
            let Some(node) = self.shadow.node(id) else {
                return Ok(true);
            };
            (
                node.kind(),
                node.fingerprint().copied(),
                node.name().to_string(),
                node.parent()
                    .and_then(|p| self.shadow.node(p))
                    .and_then(|p| p.remote()),
            )
        };

        if kind == NodeKind::Folder {
            return self.start_create_folder(id);
        }
        let Some(fp) = fp else {
            return Ok(false);
        };
        let Some(parent_handle) = parent_handle else {
            // Parent creation has not completed yet
            return Ok(false);
        };

        let local_path = self.root.join(self.shadow.local_rel_path(id));
        self.report_anomaly(&local_path, &name);
        self.busy.insert(id);
        self.transfers.enqueue(TransferRequest {
            node: id,
            direction: TransferDirection::Upload,
            fingerprint: fp,
            local_path,
            parent: Some(parent_handle),
            name,
            handle: None,
        });
        Ok(true)
    }

    async fn start_download(&mut self, id: NodeId) -> Result<bool> {
        let handle = match self.shadow.node(id).and_then(|n| n.remote()) {
            Some(h) => h,
            None => return Ok(false),
        };
        let (is_folder, fp, name) = match self.cloud.node(handle) {
            Some(n) => (n.is_folder(), n.fingerprint, n.name.clone()),
            None => return Ok(false),
        };

        let local_path = self.root.join(self.shadow.local_rel_path(id));
        if is_folder {
            self.fs.create_dir_all(&local_path).await?;
            return Ok(true);
        }

        let Some(fp) = fp else {
            return Ok(false);
        };
        if let Some(parent) = local_path.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.report_anomaly(&local_path, &name);
        self.busy.insert(id);
        self.transfers.enqueue(TransferRequest {
            node: id,
            direction: TransferDirection::Download,
            fingerprint: fp,
            local_path,
            parent: None,
            name,
            handle: Some(handle),
        });
        Ok(true)
    }

    fn start_create_folder(&mut self, id: NodeId) -> Result<bool> {
        let (name, parent_handle) = {
            let Some(node) = self.shadow.node(id) else {
                return Ok(true);
            };
            (
                node.name().to_string(),
                node.parent()
                    .and_then(|p| self.shadow.node(p))
                    .and_then(|p| p.remote()),
            )
        };
        let Some(parent_handle) = parent_handle else {
            return Ok(false);
        };

        self.busy.insert(id);
        let client = Arc::clone(&self.cloud_client);
        let tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            let result = client
                .put_nodes(parent_handle, vec![NewNode::folder(name)])
                .await
                .map_err(|e| (classify_error(&e), format!("{e:#}")));
            let _ = tx
                .send(RpcDone {
                    node: id,
                    kind: RpcKind::CreateFolder,
                    handle: None,
                    result,
                })
                .await;
        });
        Ok(true)
    }

    /// Moves the remote node into the rubbish bin, stamping the `rr`
    /// back-reference with its original parent so an undelete can restore
    /// it in place.
    fn start_rubbish(&mut self, id: NodeId, tombstone: bool) {
        let (handle, name) = {
            let Some(node) = self.shadow.node(id) else {
                return;
            };
            (node.remote(), node.name().to_string())
        };
        let Some(handle) = handle else {
            // Never uploaded: nothing remote to delete
            if tombstone {
                self.reap_subtree(id);
            }
            return;
        };
        let original_parent = self
            .cloud
            .node(handle)
            .and_then(|n| n.parent)
            .unwrap_or_else(|| self.cloud_client.rubbish_handle());

        self.busy.insert(id);
        let client = Arc::clone(&self.cloud_client);
        let tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            let rubbish = client.rubbish_handle();
            let result = async {
                client.rename(handle, rubbish, &name).await?;
                let mut attrs = std::collections::BTreeMap::new();
                attrs.insert(RESTORE_ATTR.to_string(), original_parent.to_base64());
                client.set_attr(handle, attrs).await?;
                Ok::<_, anyhow::Error>(Vec::new())
            }
            .await
            .map_err(|e| (classify_error(&e), format!("{e:#}")));
            let _ = tx
                .send(RpcDone {
                    node: id,
                    kind: RpcKind::RubbishNode { tombstone },
                    handle: Some(handle),
                    result,
                })
                .await;
        });
    }

    fn start_remote_move(&mut self, id: NodeId) -> Result<bool> {
        let handle = match self.shadow.node(id).and_then(|n| n.remote()) {
            Some(h) => h,
            None => return Ok(false),
        };

        // The move target was recorded during scan-up; apply it to the
        // shadow first so the remote op mirrors the tree
        if let Some((new_parent, new_local_name)) = self.move_targets.remove(&id) {
            let new_name = canonical::decode(&new_local_name);
            if self.shadow.move_node(id, new_parent).is_err() {
                return Ok(false);
            }
            if self.shadow.rename(id, new_name, new_local_name).is_err() {
                self.fatal = Some(SyncError::InternalInconsistency);
                return Ok(false);
            }
        }

        let new_parent_handle = self
            .shadow
            .node(id)
            .and_then(|n| n.parent())
            .and_then(|p| self.shadow.node(p))
            .and_then(|p| p.remote());
        let Some(new_parent_handle) = new_parent_handle else {
            return Ok(false);
        };
        let new_name = match self.shadow.node(id) {
            Some(node) => node.name().to_string(),
            None => return Ok(true),
        };

        self.busy.insert(id);
        let client = Arc::clone(&self.cloud_client);
        let tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            let result = client
                .rename(handle, new_parent_handle, &new_name)
                .await
                .map(|()| Vec::new())
                .map_err(|e| (classify_error(&e), format!("{e:#}")));
            let _ = tx
                .send(RpcDone {
                    node: id,
                    kind: RpcKind::MoveRemote {
                        new_parent: new_parent_handle,
                        new_name,
                    },
                    handle: Some(handle),
                    result,
                })
                .await;
        });
        Ok(true)
    }

    /// Updates the shadow node's position/names from its cloud twin
    /// without touching the filesystem. Returns `false` when the new
    /// parent has no local materialization yet.
    fn adopt_remote_position(&mut self, id: NodeId) -> Result<bool> {
        let handle = match self.shadow.node(id).and_then(|n| n.remote()) {
            Some(h) => h,
            None => return Ok(false),
        };
        let (cloud_name, cloud_parent) = match self.cloud.node(handle) {
            Some(n) => (n.name.clone(), n.parent),
            None => return Ok(false),
        };
        let Some(new_parent_id) = cloud_parent.and_then(|p| self.shadow.by_handle(p)) else {
            return Ok(false);
        };

        if self.shadow.node(id).and_then(|n| n.parent()) != Some(new_parent_id)
            && self.shadow.move_node(id, new_parent_id).is_err()
        {
            return Ok(false);
        }
        let new_local_name = canonical::encode(&cloud_name, &self.policy);
        if self.shadow.rename(id, cloud_name, new_local_name).is_err() {
            self.fatal = Some(SyncError::InternalInconsistency);
            return Ok(false);
        }
        Ok(true)
    }

    /// Replays a remote move/rename on the local filesystem and the
    /// shadow tree.
    async fn apply_remote_move_locally(&mut self, id: NodeId) -> Result<bool> {
        let old_path = self.root.join(self.shadow.local_rel_path(id));
        if !self.adopt_remote_position(id)? {
            return Ok(false);
        }
        let new_path = self.root.join(self.shadow.local_rel_path(id));
        if old_path != new_path {
            self.fs.rename(&old_path, &new_path).await?;
        }
        let cloud_name = self
            .shadow
            .node(id)
            .map(|n| n.name().to_string())
            .unwrap_or_default();
        self.report_anomaly(&new_path, &cloud_name);
        info!(
            node = %id,
            from = %old_path.display(),
            to = %new_path.display(),
            "Applied remote move locally"
        );
        Ok(true)
    }

    /// Content conflict: strictly greater mtime wins; exact fingerprint
    /// equality is a no-op; an mtime tie with differing CRCs falls to the
    /// local side. The loser lands in sync debris (local) or the rubbish
    /// bin (remote).
    async fn resolve_conflict(&mut self, id: NodeId) -> Result<bool> {
        let local_fp = match self.shadow.node(id).and_then(|n| n.fingerprint().copied()) {
            Some(fp) => fp,
            None => return Ok(false),
        };
        let remote_fp = self
            .shadow
            .node(id)
            .and_then(|n| n.remote())
            .and_then(|h| self.cloud.node(h))
            .and_then(|n| n.fingerprint);
        let Some(remote_fp) = remote_fp else {
            return Ok(false);
        };

        if local_fp == remote_fp {
            debug!(node = %id, "Conflict dissolved: fingerprints agree");
            return Ok(true);
        }

        let local_wins = match local_fp.mtime.cmp(&remote_fp.mtime) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                if local_fp.same_content(&remote_fp) {
                    debug!(node = %id, "Conflict dissolved: same content, mtime tie");
                    return Ok(true);
                }
                true
            }
        };

        if local_wins {
            info!(node = %id, "Conflict: local side wins, rubbishing remote copy");
            // Unpairing makes the node upload-pending; the next pass
            // pushes the winning content
            self.start_rubbish(id, false);
            self.local_changes.insert(id, SideChange::Modified);
            Ok(true)
        } else {
            info!(node = %id, "Conflict: remote side wins, local copy to debris");
            let rel = self.shadow.local_rel_path(id);
            self.debris.stash(&rel).await?;
            self.start_download(id).await
        }
    }

    /// Both sides moved the node to different places: the move whose
    /// containing parent has the lexicographically smaller full path
    /// wins. A side that deleted instead of moving has no path and loses.
    async fn pick_path_winner(&mut self, id: NodeId) -> Result<bool> {
        let local_target = self.move_targets.get(&id).cloned();
        let remote_parent_path = {
            let root_handle = self.shadow.node(self.shadow.root()).and_then(|n| n.remote());
            self.shadow
                .node(id)
                .and_then(|n| n.remote())
                .and_then(|h| self.cloud.node(h))
                .and_then(|n| n.parent)
                .and_then(|p| root_handle.and_then(|r| self.cloud.rel_path(p, r)))
        };

        match (local_target, remote_parent_path) {
            (Some((local_parent, _)), Some(remote_path)) => {
                let local_path = self.shadow.cloud_rel_path(local_parent);
                if local_path <= remote_path {
                    debug!(node = %id, "Double move: local path wins");
                    self.start_remote_move(id)
                } else {
                    debug!(node = %id, "Double move: remote path wins");
                    self.move_targets.remove(&id);
                    self.apply_remote_move_locally(id).await
                }
            }
            // The local side deleted: the remote move survives and the
            // entry is re-created at its new location
            (None, Some(_)) => {
                if !self.adopt_remote_position(id)? {
                    return Ok(false);
                }
                self.start_download(id).await
            }
            (Some(_), None) => self.start_remote_move(id),
            (None, None) => Ok(true),
        }
    }

    // ------------------------------------------------------------------
    // New-entry handling
    // ------------------------------------------------------------------

    /// Splits the queued new local entries into clean ones (returned)
    /// and clashing ones (retained for the next pass). Clash records are
    /// (re-)asserted here and tracked clash partners are marked so the
    /// act phase skips them; a clash therefore clears by itself once the
    /// user removes a duplicate, because the vanished entry drops out of
    /// revalidation.
    async fn detect_local_clashes(&mut self) -> Result<Vec<NewLocalEntry>> {
        let mut entries = std::mem::take(&mut self.new_local);

        // Revalidate against the filesystem: entries whose file vanished
        // (e.g. a removed clash partner) drop out here
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let path = self
                .root
                .join(self.shadow.local_rel_path(entry.parent))
                .join(&entry.info.name);
            if self.fs.entry(&path).await?.is_some() {
                live.push(entry);
            }
        }

        // Clashes among the new entries themselves (two untracked
        // siblings canonicalizing to the same name)
        let mut clashing: HashSet<usize> = HashSet::new();
        for i in 0..live.len() {
            for j in (i + 1)..live.len() {
                if live[i].parent == live[j].parent
                    && canonical::local_names_collide(
                        &live[i].info.name,
                        &live[j].info.name,
                        &self.policy,
                    )
                {
                    clashing.insert(i);
                    clashing.insert(j);
                    let (parent, a, b) = (
                        live[i].parent,
                        live[i].info.name.clone(),
                        live[j].info.name.clone(),
                    );
                    self.record_clash(parent, ClashSide::Local, vec![a, b]);
                }
            }
        }

        let mut clean = Vec::with_capacity(live.len());
        for (idx, entry) in live.into_iter().enumerate() {
            if clashing.contains(&idx) {
                debug!(name = %entry.info.name, "New entry clashes, holding back");
                self.new_local.push(entry);
                continue;
            }

            // A tracked sibling may clash with the new entry; neither
            // side propagates while the clash stands
            let tracked_clash: Option<(NodeId, String)> = {
                let policy = &self.policy;
                let shadow = &self.shadow;
                let name = &entry.info.name;
                shadow.node(entry.parent).and_then(|p| {
                    p.children()
                        .values()
                        .filter_map(|&c| shadow.node(c).map(|n| (c, n.local_name().to_string())))
                        .find(|(_, other)| {
                            other != name && canonical::local_names_collide(other, name, policy)
                        })
                })
            };
            if let Some((sibling, other)) = tracked_clash {
                self.clashed.insert(sibling);
                self.record_clash(
                    entry.parent,
                    ClashSide::Local,
                    vec![other, entry.info.name.clone()],
                );
                self.new_local.push(entry);
                continue;
            }

            clean.push(entry);
        }
        Ok(clean)
    }

    /// Creates shadow nodes and uploads for clean new local entries.
    async fn act_on_new_local(&mut self, entries: Vec<NewLocalEntry>) -> Result<usize> {
        let mut actions = 0;
        for entry in entries {
            let cloud_name = canonical::decode(&entry.info.name);
            let id = match self.shadow.add_child(
                entry.parent,
                entry.info.kind,
                cloud_name,
                entry.info.name.clone(),
            ) {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, name = %entry.info.name, "Could not track new entry");
                    continue;
                }
            };
            if let Some(fp) = entry.fingerprint {
                if let Some(node) = self.shadow.node_mut(id) {
                    node.set_fingerprint(fp);
                }
            }

            let started = match entry.info.kind {
                NodeKind::File => self.start_upload(id)?,
                NodeKind::Folder => {
                    let started = self.start_create_folder(id)?;
                    // Children of the new folder surface on the rescan
                    self.rescan_needed = true;
                    started
                }
            };
            if started {
                actions += 1;
            } else {
                // Parent handle not ready; re-marked so a later pass
                // retries the upload
                self.local_changes.insert(id, SideChange::Modified);
            }
        }
        Ok(actions)
    }

    /// Creates shadow nodes and downloads for unmatched new remote nodes.
    async fn act_on_new_remote(&mut self) -> Result<usize> {
        let mut actions = 0;
        let Some(root_handle) = self.shadow.node(self.shadow.root()).and_then(|n| n.remote())
        else {
            return Ok(0);
        };

        // Parents before children so folder pairings exist first
        let handles: Vec<NodeHandle> = {
            let mut hs: Vec<NodeHandle> = self.new_remote.iter().copied().collect();
            hs.sort_by_key(|&h| {
                self.cloud
                    .rel_path(h, root_handle)
                    .map(|p| p.matches('/').count())
                    .unwrap_or(usize::MAX)
            });
            hs
        };

        for handle in handles {
            let Some(cloud_node) = self.cloud.node(handle).cloned() else {
                self.new_remote.remove(&handle);
                continue;
            };
            let Some(parent_id) = cloud_node.parent.and_then(|p| self.shadow.by_handle(p))
            else {
                // Parent shadow node not there yet; next pass
                continue;
            };
            self.new_remote.remove(&handle);

            // A backup sync never accepts foreign remote additions
            if self.backup.is_some() {
                info!(handle = %handle, "Backup: removing foreign remote addition");
                self.diverged_this_pass = true;
                self.spawn_rubbish_unpaired(handle, cloud_node.name.clone(), cloud_node.parent);
                actions += 1;
                continue;
            }

            // Remote sibling clash: two cloud names realizing identically
            let clash_partner: Option<String> = {
                let policy = &self.policy;
                self.shadow.node(parent_id).and_then(|p| {
                    p.children()
                        .keys()
                        .find(|existing| {
                            **existing != cloud_node.name
                                && canonical::cloud_names_collide(
                                    existing,
                                    &cloud_node.name,
                                    policy,
                                )
                        })
                        .cloned()
                })
            };
            if let Some(partner) = clash_partner {
                if let Some(partner_id) = self.shadow.lookup_child(parent_id, &partner) {
                    self.clashed.insert(partner_id);
                }
                self.record_clash(
                    parent_id,
                    ClashSide::Remote,
                    vec![partner, cloud_node.name.clone()],
                );
                // Stays queued so the record re-asserts until the
                // duplicate goes away
                self.new_remote.insert(handle);
                continue;
            }

            let local_name = canonical::encode(&cloud_node.name, &self.policy);
            let id = match self.shadow.add_child(
                parent_id,
                cloud_node.kind,
                cloud_node.name.clone(),
                local_name,
            ) {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, name = %cloud_node.name, "Could not track remote node");
                    continue;
                }
            };
            if self.shadow.set_remote(id, handle).is_err() {
                continue;
            }

            if self.start_download(id).await? {
                actions += 1;
            }
        }
        Ok(actions)
    }

    /// Rubbishes a remote node that has no shadow pairing (foreign
    /// additions under a backup root).
    fn spawn_rubbish_unpaired(
        &mut self,
        handle: NodeHandle,
        name: String,
        original_parent: Option<NodeHandle>,
    ) {
        self.cloud.remove_subtree(handle);
        let client = Arc::clone(&self.cloud_client);
        tokio::spawn(async move {
            let rubbish = client.rubbish_handle();
            if let Err(err) = client.rename(handle, rubbish, &name).await {
                warn!(handle = %handle, error = %err, "Could not rubbish foreign node");
                return;
            }
            if let Some(parent) = original_parent {
                let mut attrs = std::collections::BTreeMap::new();
                attrs.insert(RESTORE_ATTR.to_string(), parent.to_base64());
                let _ = client.set_attr(handle, attrs).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Completion plumbing
    // ------------------------------------------------------------------

    fn finish_upload(&mut self, id: NodeId, handle: NodeHandle) {
        self.finish_remote_create(id, handle);
        debug!(node = %id, handle = %handle, "Upload paired");
    }

    /// Pairs a node with its freshly created cloud twin and mirrors the
    /// creation locally ahead of the echo delta.
    fn finish_remote_create(&mut self, id: NodeId, handle: NodeHandle) {
        if self.shadow.set_remote(id, handle).is_err() {
            warn!(node = %id, "Pairing for vanished node dropped");
            return;
        }
        let mirrored = {
            let Some(node) = self.shadow.node(id) else {
                return;
            };
            let parent_handle = node
                .parent()
                .and_then(|p| self.shadow.node(p))
                .and_then(|p| p.remote());
            parent_handle.map(|parent_handle| CloudNode {
                handle,
                parent: Some(parent_handle),
                kind: node.kind(),
                name: node.name().to_string(),
                fingerprint: node.fingerprint().copied(),
                attrs: std::collections::BTreeMap::new(),
            })
        };
        if let Some(cloud_node) = mirrored {
            self.cloud.upsert(cloud_node);
        }
    }

    async fn finish_download(&mut self, id: NodeId) {
        let path = self.root.join(self.shadow.local_rel_path(id));
        match self.fs.fingerprint(&path).await {
            Ok(fp) => {
                if let Some(node) = self.shadow.node_mut(id) {
                    node.set_fingerprint(fp);
                }
                // The download just (re-)materialized the entry, so any
                // local change mark observed mid-flight is stale. A real
                // user edit after this write raises a fresh event.
                self.local_changes.remove(&id);
            }
            Err(err) => {
                warn!(node = %id, error = %err, "Downloaded file vanished before fingerprint");
            }
        }
    }

    async fn finish_dedup_download(&mut self, id: NodeId, source: &Path) {
        let dest = self.root.join(self.shadow.local_rel_path(id));
        let copied = async {
            let data = self.fs.read_file(source).await?;
            self.fs.write_file(&dest, &data).await
        }
        .await;
        match copied {
            Ok(()) => self.finish_download(id).await,
            Err(err) => {
                self.note_failure(id, TransferFailure::Transient, &format!("{err:#}"));
            }
        }
    }

    fn spawn_copy_from_content(&mut self, id: NodeId, content: NodeHandle) {
        let (name, fp, parent_handle) = {
            let Some(node) = self.shadow.node(id) else {
                return;
            };
            (
                node.name().to_string(),
                node.fingerprint().copied(),
                node.parent()
                    .and_then(|p| self.shadow.node(p))
                    .and_then(|p| p.remote()),
            )
        };
        let (Some(fp), Some(parent_handle)) = (fp, parent_handle) else {
            return;
        };

        self.busy.insert(id);
        let client = Arc::clone(&self.cloud_client);
        let tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            let result = client
                .put_nodes(parent_handle, vec![NewNode::file_from(name, fp, content)])
                .await
                .map_err(|e| (classify_error(&e), format!("{e:#}")));
            let _ = tx
                .send(RpcDone {
                    node: id,
                    kind: RpcKind::CreateFromContent,
                    handle: None,
                    result,
                })
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Resolves a root-relative path to its shadow node by local names.
    fn resolve_local(&self, rel: &Path) -> Option<NodeId> {
        let mut cursor = self.shadow.root();
        for component in rel.components() {
            let name = component.as_os_str().to_string_lossy();
            cursor = self.shadow.lookup_child_local(cursor, &name)?;
        }
        Some(cursor)
    }

    /// Resolves the parent node of a root-relative path.
    fn resolve_local_parent(&self, rel: &Path) -> Option<NodeId> {
        match rel.parent() {
            None => Some(self.shadow.root()),
            Some(parent) if parent.as_os_str().is_empty() => Some(self.shadow.root()),
            Some(parent) => self.resolve_local(parent),
        }
    }

    /// Tombstones and reaps a whole subtree, children first.
    fn reap_subtree(&mut self, id: NodeId) {
        let mut order: Vec<NodeId> = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            order.push(n);
            if let Some(node) = self.shadow.node(n) {
                stack.extend(node.children().values().copied());
            }
        }
        for n in order.into_iter().rev() {
            self.shadow.tombstone(n);
            if let Err(err) = self.shadow.reap(n) {
                warn!(node = %n, error = %err, "Reap failed");
            }
            self.local_changes.remove(&n);
            self.remote_changes.remove(&n);
            self.retries.remove(&n);
            self.not_before.remove(&n);
            self.stalled.remove(&n);
            self.move_targets.remove(&n);
        }
    }

    fn record_clash(&mut self, parent: NodeId, side: ClashSide, mut names: Vec<String>) {
        names.sort();
        names.dedup();
        let clash = NameClash {
            parent_path: self.shadow.cloud_rel_path(parent),
            side,
            names,
        };
        self.observer.on_name_clash(self.backup_id, &clash);
        if let Ok(mut clashes) = self.clashes.write() {
            if !clashes.contains(&clash) {
                clashes.push(clash);
            }
        }
    }

    fn report_anomaly(&self, local_path: &Path, cloud_name: &str) {
        let local_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = canonical::classify(cloud_name, &local_name, &self.policy);
        if kind != FilenameAnomaly::None {
            self.observer
                .on_filename_anomaly(local_path, cloud_name, kind);
        }
    }

    fn report_symlink(&self, path: &Path) {
        debug!(path = %path.display(), "Symlink ignored");
        self.observer
            .on_filename_anomaly(path, "", FilenameAnomaly::SpecialEntry);
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod invariant_tests {
        use super::*;
        use skysync_core::ports::{ITransferPipeline, NullObserver};
        use std::collections::BTreeMap;
        use tokio_util::sync::CancellationToken;

        /// Ports that must never be reached: the invariant check runs
        /// before any scan or action touches them.
        struct UnreachableFs;

        #[async_trait::async_trait]
        impl IFileSystem for UnreachableFs {
            async fn entry(&self, _: &Path) -> anyhow::Result<Option<EntryInfo>> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn read_dir(&self, _: &Path) -> anyhow::Result<Vec<EntryInfo>> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn fingerprint(&self, _: &Path) -> anyhow::Result<Fingerprint> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn create_dir_all(&self, _: &Path) -> anyhow::Result<()> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn rename(&self, _: &Path, _: &Path) -> anyhow::Result<()> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn remove_file(&self, _: &Path) -> anyhow::Result<()> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn remove_dir(&self, _: &Path) -> anyhow::Result<()> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn write_file(&self, _: &Path, _: &[u8]) -> anyhow::Result<()> {
                unreachable!("pass must bail before filesystem access")
            }
            async fn read_file(&self, _: &Path) -> anyhow::Result<Vec<u8>> {
                unreachable!("pass must bail before filesystem access")
            }
        }

        struct UnreachableCloud;

        #[async_trait::async_trait]
        impl ICloudClient for UnreachableCloud {
            async fn put_nodes(
                &self,
                _: NodeHandle,
                _: Vec<NewNode>,
            ) -> anyhow::Result<Vec<NodeHandle>> {
                unreachable!("pass must bail before cloud access")
            }
            async fn unlink(&self, _: NodeHandle) -> anyhow::Result<()> {
                unreachable!("pass must bail before cloud access")
            }
            async fn rename(&self, _: NodeHandle, _: NodeHandle, _: &str) -> anyhow::Result<()> {
                unreachable!("pass must bail before cloud access")
            }
            async fn set_attr(
                &self,
                _: NodeHandle,
                _: BTreeMap<String, String>,
            ) -> anyhow::Result<()> {
                unreachable!("pass must bail before cloud access")
            }
            async fn fetch_nodes(&self) -> anyhow::Result<Vec<CloudNode>> {
                unreachable!("pass must bail before cloud access")
            }
            async fn catchup(&self) -> anyhow::Result<()> {
                unreachable!("pass must bail before cloud access")
            }
            fn rubbish_handle(&self) -> NodeHandle {
                NodeHandle::from_raw(2)
            }
            fn subscribe_deltas(&self) -> mpsc::Receiver<DeltaBatch> {
                mpsc::channel(1).1
            }
        }

        struct UnreachablePipeline;

        #[async_trait::async_trait]
        impl ITransferPipeline for UnreachablePipeline {
            async fn upload(
                &self,
                _: &Path,
                _: NodeHandle,
                _: &str,
                _: CancellationToken,
            ) -> anyhow::Result<NodeHandle> {
                unreachable!("pass must bail before transfers")
            }
            async fn download(
                &self,
                _: NodeHandle,
                _: &Path,
                _: CancellationToken,
            ) -> anyhow::Result<()> {
                unreachable!("pass must bail before transfers")
            }
        }

        fn reconciler_over(shadow: ShadowTree) -> Reconciler {
            let fs: Arc<dyn IFileSystem> = Arc::new(UnreachableFs);
            let (tx, _rx) = mpsc::channel(8);
            let debris =
                DebrisFolder::new(PathBuf::from("/nonexistent/root"), Arc::clone(&fs));
            let transfers = TransferOrchestrator::new(
                BackupId::from_raw(1),
                Arc::new(UnreachablePipeline),
                Arc::new(NullObserver),
                debris.clone(),
                tx,
                1,
                1,
                CancellationToken::new(),
            );
            let (reconciler, _rpc_rx) = Reconciler::new(
                BackupId::from_raw(1),
                PathBuf::from("/nonexistent/root"),
                NamePolicy::posix(),
                shadow,
                fs,
                Arc::new(UnreachableCloud),
                transfers,
                Arc::new(NullObserver),
                debris,
                None,
                RetryConfig::default(),
                Arc::new(RwLock::new(Vec::new())),
            );
            reconciler
        }

        #[tokio::test]
        async fn test_pass_disables_sync_on_broken_invariants() {
            let mut shadow = ShadowTree::new(NodeHandle::from_raw(1));
            let d = shadow
                .add_child(shadow.root(), NodeKind::Folder, "d", "d")
                .unwrap();
            shadow.add_child(d, NodeKind::File, "f", "f").unwrap();

            // Corrupt I2 through the persisted form, the way a damaged
            // resume cache would: the child ends up registered under the
            // wrong sibling key
            let json = serde_json::to_string(&shadow).unwrap();
            let corrupted = json.replace("\"f\":", "\"wrong\":");
            assert_ne!(json, corrupted, "corruption must hit the children key");
            let shadow: ShadowTree = serde_json::from_str(&corrupted).unwrap();
            assert!(shadow.check_invariants().is_err());

            let mut reconciler = reconciler_over(shadow);
            let mut queue = CoalescingQueue::new(std::time::Duration::ZERO);
            let summary = reconciler.pass(&mut queue).await.unwrap();

            assert_eq!(summary.fatal, Some(SyncError::InternalInconsistency));
        }
    }

    mod decision_table_tests {
        use super::*;
        use SideChange::{Deleted, Modified, Moved, Unchanged};

        #[test]
        fn test_local_unchanged_row() {
            assert_eq!(decide(Unchanged, Unchanged), Action::None);
            assert_eq!(decide(Unchanged, Modified), Action::Download);
            assert_eq!(decide(Unchanged, Moved), Action::ApplyRemoteMoveLocally);
            assert_eq!(decide(Unchanged, Deleted), Action::DeleteLocal);
        }

        #[test]
        fn test_local_modified_row() {
            assert_eq!(decide(Modified, Unchanged), Action::Upload);
            assert_eq!(decide(Modified, Modified), Action::Conflict);
            assert_eq!(decide(Modified, Moved), Action::UploadAndFollowRemoteMove);
            assert_eq!(decide(Modified, Deleted), Action::RecreateRemote);
        }

        #[test]
        fn test_local_moved_row() {
            assert_eq!(decide(Moved, Unchanged), Action::MoveRemote);
            assert_eq!(decide(Moved, Modified), Action::MoveRemoteThenDownload);
            assert_eq!(decide(Moved, Moved), Action::PickPathWinner);
            assert_eq!(decide(Moved, Deleted), Action::RecreateRemote);
        }

        #[test]
        fn test_local_deleted_row() {
            assert_eq!(decide(Deleted, Unchanged), Action::DeleteRemote);
            assert_eq!(decide(Deleted, Modified), Action::RecreateLocal);
            assert_eq!(decide(Deleted, Moved), Action::PickPathWinner);
            assert_eq!(decide(Deleted, Deleted), Action::None);
        }

        #[test]
        fn test_backup_table_local_always_wins() {
            // Remote deviations converge back to local
            assert_eq!(decide_backup(Unchanged, Modified), Action::Upload);
            assert_eq!(decide_backup(Unchanged, Deleted), Action::RecreateRemote);
            assert_eq!(decide_backup(Unchanged, Moved), Action::MoveRemote);
            // Local changes propagate
            assert_eq!(decide_backup(Modified, Modified), Action::Upload);
            assert_eq!(decide_backup(Deleted, Unchanged), Action::DeleteRemote);
            assert_eq!(decide_backup(Moved, Deleted), Action::RecreateRemote);
            assert_eq!(decide_backup(Deleted, Deleted), Action::None);
            // Nothing in the backup table ever mutates the local side
            for local in [Unchanged, Modified, Moved, Deleted] {
                for remote in [Unchanged, Modified, Moved, Deleted] {
                    let action = decide_backup(local, remote);
                    assert!(
                        !matches!(
                            action,
                            Action::Download
                                | Action::ApplyRemoteMoveLocally
                                | Action::DeleteLocal
                                | Action::RecreateLocal
                        ),
                        "backup table must never touch the local side: {local:?}/{remote:?} -> {action:?}"
                    );
                }
            }
        }
    }
}
