//! The programmatic sync surface
//!
//! [`SyncService`] is the engine context: it owns the config store, the
//! shared ports, the per-sync runner tasks, and the shadow-tree caches
//! kept for fast resume. There are no process-wide singletons; everything
//! an embedder needs hangs off one `SyncService` value.
//!
//! ## Runner lifecycle
//!
//! Each enabled sync gets one spawned runner task that owns its
//! [`Reconciler`] and drives it from a `select!` loop over the watcher
//! stream, the delta stream, transfer completions, RPC completions, and
//! a pass timer. Disabling a sync cancels the token; the runner persists
//! its shadow tree into the resume cache on the way out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skysync_core::config::EngineConfig;
use skysync_core::domain::canonical::{NameClash, NamePolicy};
use skysync_core::domain::{
    BackupId, BackupState, DriveId, LocalPath, RemotePath, ShadowTree, SyncConfig, SyncError,
    SyncType,
};
use skysync_core::ports::{
    ICloudClient, IConfigDb, IFileSystem, ISyncObserver, ITransferPipeline, NullObserver,
};
use skysync_store::SyncConfigStore;

use crate::backup::BackupController;
use crate::debris::DebrisFolder;
use crate::reconciler::Reconciler;
use crate::transfers::TransferOrchestrator;
use crate::watcher::{CoalescingQueue, RootWatcher};

// ============================================================================
// Observer forwarding
// ============================================================================

/// Forwards observer events to whichever observer is currently installed
/// via [`SyncService::set_filename_anomaly_reporter`].
struct SharedObserver {
    inner: RwLock<Arc<dyn ISyncObserver>>,
}

impl SharedObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Arc::new(NullObserver)),
        })
    }

    fn install(&self, observer: Arc<dyn ISyncObserver>) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = observer;
        }
    }

    fn current(&self) -> Arc<dyn ISyncObserver> {
        self.inner
            .read()
            .map(|o| Arc::clone(&o))
            .unwrap_or_else(|_| Arc::new(NullObserver))
    }
}

impl ISyncObserver for SharedObserver {
    fn on_sync_state(&self, backup_id: BackupId, enabled: bool, last_error: SyncError) {
        self.current().on_sync_state(backup_id, enabled, last_error);
    }

    fn on_transfer(
        &self,
        backup_id: BackupId,
        direction: skysync_core::ports::TransferDirection,
        phase: skysync_core::ports::TransferPhase,
        local_path: &Path,
    ) {
        self.current()
            .on_transfer(backup_id, direction, phase, local_path);
    }

    fn on_retry(&self, backup_id: BackupId, attempt: u32, delay: Duration) {
        self.current().on_retry(backup_id, attempt, delay);
    }

    fn on_filename_anomaly(
        &self,
        local_path: &Path,
        remote_path: &str,
        kind: skysync_core::domain::canonical::FilenameAnomaly,
    ) {
        self.current()
            .on_filename_anomaly(local_path, remote_path, kind);
    }

    fn on_name_clash(&self, backup_id: BackupId, clash: &NameClash) {
        self.current().on_name_clash(backup_id, clash);
    }
}

// ============================================================================
// SyncService
// ============================================================================

/// Parameters for [`SyncService::add_sync`]
#[derive(Debug, Clone)]
pub struct AddSyncParams {
    /// Absolute local sync root
    pub local_path: LocalPath,
    /// Cloud subtree root handle
    pub remote_handle: skysync_core::domain::NodeHandle,
    /// Advisory cloud path of the root
    pub remote_path: RemotePath,
    /// Two-way or backup semantics
    pub sync_type: SyncType,
    /// Removable-drive root for external backups
    pub drive_path: Option<PathBuf>,
}

struct SyncRunner {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    clashes: Arc<RwLock<Vec<NameClash>>>,
}

/// The engine context: config store, ports, and one runner per enabled
/// sync.
pub struct SyncService {
    config: EngineConfig,
    policy: NamePolicy,
    store: Arc<SyncConfigStore>,
    fs: Arc<dyn IFileSystem>,
    cloud_client: Arc<dyn ICloudClient>,
    pipeline: Arc<dyn ITransferPipeline>,
    observer: Arc<SharedObserver>,
    runners: Mutex<HashMap<BackupId, SyncRunner>>,
    shadow_caches: Arc<Mutex<HashMap<BackupId, ShadowTree>>>,
}

impl SyncService {
    /// Builds the service and loads persisted configs; syncs that were
    /// left enabled resume immediately.
    ///
    /// # Errors
    /// Fails when the config database cannot be read.
    pub async fn start(
        config: EngineConfig,
        policy: NamePolicy,
        db: Arc<dyn IConfigDb>,
        fs: Arc<dyn IFileSystem>,
        cloud_client: Arc<dyn ICloudClient>,
        pipeline: Arc<dyn ITransferPipeline>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(
            SyncConfigStore::load(db)
                .await
                .context("Failed to load sync configs")?,
        );

        let service = Arc::new(Self {
            config,
            policy,
            store,
            fs,
            cloud_client,
            pipeline,
            observer: SharedObserver::new(),
            runners: Mutex::new(HashMap::new()),
            shadow_caches: Arc::new(Mutex::new(HashMap::new())),
        });

        let mut to_resume = Vec::new();
        service.store.for_each(|c| {
            if c.enabled {
                to_resume.push(c.clone());
            }
        });
        for config in to_resume {
            // External backups re-verify from mirroring after a restart
            let force_mirror = config.is_external();
            service.start_runner(config, force_mirror);
        }

        Ok(service)
    }

    /// Installs the application observer (anomaly reporter and friends).
    pub fn set_filename_anomaly_reporter(&self, observer: Arc<dyn ISyncObserver>) {
        self.observer.install(observer);
    }

    // ========================================================================
    // Sync lifecycle surface
    // ========================================================================

    /// Registers a new sync and starts it.
    ///
    /// # Errors
    /// Propagates overlap rejection and drive/persistence failures.
    pub async fn add_sync(&self, params: AddSyncParams) -> Result<BackupId> {
        let mut config = match params.sync_type {
            SyncType::TwoWay => SyncConfig::two_way(
                params.local_path,
                params.remote_handle,
                params.remote_path,
            ),
            SyncType::Backup => SyncConfig::backup(
                params.local_path,
                params.remote_handle,
                params.remote_path,
            ),
        };

        if let Some(drive_path) = params.drive_path {
            let drive_id: DriveId = skysync_store::ensure_drive_id(&self.fs, &drive_path)
                .await
                .context("Failed to bind drive id")?;
            config = config.on_drive(drive_path, drive_id);
        }

        let id = self.store.add(config.clone()).await?;
        self.start_runner(config, false);
        Ok(id)
    }

    /// Stops and removes a sync. With `keep_cache` the shadow tree stays
    /// around for a fast re-add; without it, no state referencing the
    /// backup id survives.
    ///
    /// # Errors
    /// `StoreError::UnknownBackupId` via the store when no such sync.
    pub async fn remove_sync(&self, id: BackupId, keep_cache: bool) -> Result<()> {
        self.stop_runner(id).await;
        self.store.remove(id, keep_cache).await?;
        if !keep_cache {
            self.shadow_caches.lock().expect("cache lock").remove(&id);
        }
        self.observer.on_sync_state(id, false, SyncError::None);
        Ok(())
    }

    /// Re-enables a disabled sync. Backups re-enter mirroring.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn enable_sync(&self, id: BackupId) -> Result<()> {
        let config = self.store.enable(id).await?;
        self.observer.on_sync_state(id, true, SyncError::None);
        self.start_runner(config, false);
        Ok(())
    }

    /// Disables a sync, recording the reason.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn disable_sync(&self, id: BackupId, reason: SyncError) -> Result<()> {
        self.stop_runner(id).await;
        self.store.disable(id, reason).await?;
        self.observer.on_sync_state(id, false, reason);
        Ok(())
    }

    /// Config lookup by backup id
    #[must_use]
    pub fn sync_config_by_backup_id(&self, id: BackupId) -> Option<SyncConfig> {
        self.store.by_backup_id(id)
    }

    /// Visits every sync config
    pub fn for_each_sync_config(&self, f: impl FnMut(&SyncConfig)) {
        self.store.for_each(f);
    }

    /// Portable export of all configs
    #[must_use]
    pub fn export_sync_configs(&self) -> Vec<u8> {
        self.store.export_all()
    }

    /// Imports configs exported on another client; they arrive disabled.
    ///
    /// # Errors
    /// Propagates decode and overlap failures.
    pub async fn import_sync_configs(&self, blob: &[u8]) -> Result<Vec<BackupId>> {
        Ok(self.store.import_all(blob).await?)
    }

    /// Opens a newly attached drive and resumes its external backups,
    /// always back in mirroring.
    ///
    /// # Errors
    /// Propagates drive and persistence failures.
    pub async fn backup_open_drive(&self, drive_path: &Path) -> Result<Vec<BackupId>> {
        let (_, resurrected) = self.store.open_drive(&self.fs, drive_path).await?;
        let ids = resurrected.iter().map(|c| c.backup_id).collect();
        for config in resurrected {
            self.observer
                .on_sync_state(config.backup_id, true, SyncError::None);
            self.start_runner(config, true);
        }
        Ok(ids)
    }

    /// Current name-clash records across all running syncs.
    #[must_use]
    pub fn conflicts(&self) -> Vec<NameClash> {
        let runners = self.runners.lock().expect("runner lock");
        let mut out = Vec::new();
        for runner in runners.values() {
            if let Ok(clashes) = runner.clashes.read() {
                out.extend(clashes.iter().cloned());
            }
        }
        out
    }

    /// Stops every runner. Configs keep their persisted enabled state, so
    /// the next [`SyncService::start`] resumes them.
    pub async fn shutdown(&self) {
        let runners: Vec<(BackupId, SyncRunner)> = {
            let mut map = self.runners.lock().expect("runner lock");
            map.drain().collect()
        };
        for (id, runner) in runners {
            runner.cancel.cancel();
            if let Err(err) = runner.handle.await {
                warn!(backup_id = %id, error = %err, "Runner did not exit cleanly");
            }
        }
        info!("Sync service shut down");
    }

    // ========================================================================
    // Runner plumbing
    // ========================================================================

    fn start_runner(&self, config: SyncConfig, force_mirror: bool) {
        if !config.enabled {
            return;
        }
        let id = config.backup_id;
        let mut runners = self.runners.lock().expect("runner lock");
        if let Some(existing) = runners.get(&id) {
            if !existing.handle.is_finished() {
                warn!(backup_id = %id, "Runner already active");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let clashes: Arc<RwLock<Vec<NameClash>>> = Arc::new(RwLock::new(Vec::new()));
        let cached_shadow = self
            .shadow_caches
            .lock()
            .expect("cache lock")
            .remove(&id);

        let ctx = RunnerCtx {
            config,
            force_mirror,
            engine_config: self.config.clone(),
            policy: self.policy.clone(),
            store: Arc::clone(&self.store),
            fs: Arc::clone(&self.fs),
            cloud_client: Arc::clone(&self.cloud_client),
            pipeline: Arc::clone(&self.pipeline),
            observer: Arc::clone(&self.observer) as Arc<dyn ISyncObserver>,
            cancel: cancel.clone(),
            clashes: Arc::clone(&clashes),
            shadow_caches: Arc::clone(&self.shadow_caches),
            cached_shadow,
        };
        let handle = tokio::spawn(run_sync(ctx));

        runners.insert(
            id,
            SyncRunner {
                cancel,
                handle,
                clashes,
            },
        );
        info!(backup_id = %id, "Sync runner started");
    }

    async fn stop_runner(&self, id: BackupId) {
        let runner = self.runners.lock().expect("runner lock").remove(&id);
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(err) = runner.handle.await {
                warn!(backup_id = %id, error = %err, "Runner did not exit cleanly");
            }
        }
    }
}

// ============================================================================
// The per-sync runner task
// ============================================================================

struct RunnerCtx {
    config: SyncConfig,
    force_mirror: bool,
    engine_config: EngineConfig,
    policy: NamePolicy,
    store: Arc<SyncConfigStore>,
    fs: Arc<dyn IFileSystem>,
    cloud_client: Arc<dyn ICloudClient>,
    pipeline: Arc<dyn ITransferPipeline>,
    observer: Arc<dyn ISyncObserver>,
    cancel: CancellationToken,
    clashes: Arc<RwLock<Vec<NameClash>>>,
    shadow_caches: Arc<Mutex<HashMap<BackupId, ShadowTree>>>,
    cached_shadow: Option<ShadowTree>,
}

/// Interval between reconciler passes while idle
const PASS_INTERVAL: Duration = Duration::from_millis(250);

async fn run_sync(ctx: RunnerCtx) {
    let id = ctx.config.backup_id;
    let root = ctx.config.local_path.as_path().to_path_buf();

    // The root must exist before anything else happens
    match ctx.fs.entry(&root).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            error!(backup_id = %id, root = %root.display(), "Sync root missing");
            disable(&ctx, SyncError::LocalPathGone).await;
            return;
        }
        Err(err) => {
            error!(backup_id = %id, error = %err, "Sync root inaccessible");
            disable(&ctx, SyncError::FsAccessLost).await;
            return;
        }
    }

    // Subscribe before the initial fetch so no delta falls into the gap;
    // batches already reflected in the snapshot re-apply harmlessly
    let mut delta_rx = ctx.cloud_client.subscribe_deltas();

    // Initial remote tree
    let nodes = match ctx.cloud_client.fetch_nodes().await {
        Ok(nodes) => nodes,
        Err(err) => {
            error!(backup_id = %id, error = %err, "Could not fetch remote tree");
            disable(&ctx, SyncError::RemotePathGone).await;
            return;
        }
    };

    // Watcher
    let (mut watcher, mut watch_rx) =
        match RootWatcher::start(&root, ctx.engine_config.watcher.queue_capacity) {
            Ok(pair) => pair,
            Err(err) => {
                error!(backup_id = %id, error = %err, "Could not start watcher");
                disable(&ctx, SyncError::FsAccessLost).await;
                return;
            }
        };

    // Reconciler and its plumbing
    let (transfer_tx, mut transfer_rx) = mpsc::channel(256);
    let debris = DebrisFolder::new(root.clone(), Arc::clone(&ctx.fs));
    let transfers = TransferOrchestrator::new(
        id,
        Arc::clone(&ctx.pipeline),
        Arc::clone(&ctx.observer),
        debris.clone(),
        transfer_tx,
        ctx.engine_config.transfers.upload_concurrent,
        ctx.engine_config.transfers.download_concurrent,
        ctx.cancel.clone(),
    );
    let backup = ctx.config.is_backup().then(|| {
        BackupController::new(id, ctx.config.backup_state, ctx.force_mirror)
    });
    let shadow = ctx
        .cached_shadow
        .clone()
        .unwrap_or_else(|| ShadowTree::new(ctx.config.remote_handle));

    let (mut reconciler, mut rpc_rx) = Reconciler::new(
        id,
        root,
        ctx.policy.clone(),
        shadow,
        Arc::clone(&ctx.fs),
        Arc::clone(&ctx.cloud_client),
        transfers,
        Arc::clone(&ctx.observer),
        debris,
        backup,
        ctx.engine_config.retry.clone(),
        Arc::clone(&ctx.clashes),
    );
    reconciler.load_remote(nodes, None);

    let mut queue = CoalescingQueue::new(Duration::from_millis(
        ctx.engine_config.watcher.debounce_ms,
    ));
    let mut pass_timer = tokio::time::interval(PASS_INTERVAL);

    info!(backup_id = %id, "Sync running");
    let fatal = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break None,

            signal = watch_rx.recv() => match signal {
                Some(signal) => reconciler.note_watcher_signal(signal, &mut queue),
                None => {
                    warn!(backup_id = %id, "Watcher channel closed");
                    break Some(SyncError::FsAccessLost);
                }
            },

            batch = delta_rx.recv() => match batch {
                Some(batch) => reconciler.note_delta_batch(batch),
                None => {
                    warn!(backup_id = %id, "Delta stream closed");
                    break Some(SyncError::RemotePathGone);
                }
            },

            Some(event) = transfer_rx.recv() => {
                reconciler.note_transfer_event(event).await;
            }

            Some(done) = rpc_rx.recv() => {
                reconciler.note_rpc_done(done);
            }

            _ = pass_timer.tick() => {
                match reconciler.pass(&mut queue).await {
                    Ok(summary) => {
                        if let Some(reason) = summary.fatal {
                            break Some(reason);
                        }
                        if summary.entered_monitoring {
                            if let Err(err) = ctx
                                .store
                                .set_backup_state(id, BackupState::Monitoring)
                                .await
                            {
                                warn!(backup_id = %id, error = %err, "Could not persist monitoring state");
                            }
                        }
                    }
                    Err(err) => {
                        // A vanished root is fatal; anything else retries
                        // on the next tick
                        match ctx.fs.entry(ctx.config.local_path.as_path()).await {
                            Ok(Some(_)) => {
                                warn!(backup_id = %id, error = %err, "Pass failed, will retry");
                            }
                            _ => break Some(SyncError::LocalPathGone),
                        }
                    }
                }
            }
        }
    };

    watcher.stop();

    // Keep the shadow tree for fast resume. A tree that broke its own
    // invariants is invalidated instead, so the next enable rebuilds it
    // from a full rescan.
    {
        let mut caches = ctx.shadow_caches.lock().expect("cache lock");
        if fatal == Some(SyncError::InternalInconsistency) {
            caches.remove(&id);
        } else {
            caches.insert(id, reconciler.shadow().clone());
        }
    }

    if let Some(reason) = fatal {
        disable(&ctx, reason).await;
    }
    info!(backup_id = %id, "Sync runner stopped");
}

async fn disable(ctx: &RunnerCtx, reason: SyncError) {
    let id = ctx.config.backup_id;
    if let Err(err) = ctx.store.disable(id, reason).await {
        warn!(backup_id = %id, error = %err, "Could not persist disable");
    }
    ctx.observer.on_sync_state(id, false, reason);
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_core::domain::canonical::FilenameAnomaly;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        anomalies: AtomicUsize,
    }

    impl ISyncObserver for CountingObserver {
        fn on_filename_anomaly(&self, _: &Path, _: &str, _: FilenameAnomaly) {
            self.anomalies.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shared_observer_forwards_after_install() {
        let shared = SharedObserver::new();
        let counting = Arc::new(CountingObserver::default());

        // Before install: events fall into the null observer
        shared.on_filename_anomaly(Path::new("/x"), "x", FilenameAnomaly::NameMismatch);
        assert_eq!(counting.anomalies.load(Ordering::SeqCst), 0);

        shared.install(Arc::clone(&counting) as Arc<dyn ISyncObserver>);
        shared.on_filename_anomaly(Path::new("/x"), "x", FilenameAnomaly::NameMismatch);
        assert_eq!(counting.anomalies.load(Ordering::SeqCst), 1);
    }
}
