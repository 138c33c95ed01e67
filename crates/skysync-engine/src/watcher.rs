//! Filesystem watching and event coalescing
//!
//! Wraps the `notify` crate to monitor one sync root, converting raw OS
//! events into [`PathEvent`]s. The watcher reports *what happened where*
//! and nothing more: it never infers move-vs-delete semantics (renames
//! surface as remove+create and the reconciler pairs them by
//! fingerprint).
//!
//! The [`CoalescingQueue`] keeps at most one pending event per path, the
//! strongest kind winning (`Created > Modified > AttrChanged`), and is
//! bounded: overflow, like a watcher error, surfaces as
//! [`WatcherSignal::Lost`], which sends the sync into lock-retry and a
//! full rescan on recovery.
//!
//! ## Architecture
//!
//! ```text
//! inotify / fsevents
//!       │
//!       ▼
//!  RootWatcher ──→ mpsc::channel ──→ CoalescingQueue ──→ Reconciler pass
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::debris;

// ============================================================================
// PathEvent / EventKind mapping
// ============================================================================

/// Kind of a raw path event, ordered by strength for coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathEventKind {
    /// Attributes changed (weakest)
    AttrChanged,
    /// Content changed
    Modified,
    /// Entry appeared
    Created,
    /// Entry disappeared (never coalesced away)
    Removed,
}

/// A raw filesystem observation: a path and what happened to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    /// Absolute path the event refers to
    pub path: PathBuf,
    /// What happened
    pub kind: PathEventKind,
}

impl PathEvent {
    /// Convenience constructor
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: PathEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// What the watcher feeds the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherSignal {
    /// A path event inside the sync root
    Event(PathEvent),
    /// The watcher lost track (overflow, unmount, permissions); the sync
    /// enters lock-retry and must rescan on recovery
    Lost,
}

/// Converts a `notify::Event` into our internal [`PathEvent`]s.
///
/// Rename events decompose into `Removed` + `Created` on their two
/// paths; access events are dropped.
fn map_notify_event(event: &notify::Event) -> Vec<PathEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => paths
            .first()
            .map(|p| vec![PathEvent::new(p.clone(), PathEventKind::Created)])
            .unwrap_or_default(),

        EventKind::Remove(_) => paths
            .first()
            .map(|p| vec![PathEvent::new(p.clone(), PathEventKind::Removed)])
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Data(_)) => paths
            .first()
            .map(|p| vec![PathEvent::new(p.clone(), PathEventKind::Modified)])
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Metadata(_)) => paths
            .first()
            .map(|p| vec![PathEvent::new(p.clone(), PathEventKind::AttrChanged)])
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Name(_)) => {
            // A rename is reported as the old path vanishing and the new
            // one appearing; pairing the two is the reconciler's job.
            match paths.as_slice() {
                [old, new] => vec![
                    PathEvent::new(old.clone(), PathEventKind::Removed),
                    PathEvent::new(new.clone(), PathEventKind::Created),
                ],
                [only] => vec![PathEvent::new(only.clone(), PathEventKind::Modified)],
                _ => Vec::new(),
            }
        }

        EventKind::Modify(_) => paths
            .first()
            .map(|p| vec![PathEvent::new(p.clone(), PathEventKind::Modified)])
            .unwrap_or_default(),

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    }
}

// ============================================================================
// RootWatcher
// ============================================================================

/// Watches one sync root recursively, feeding [`WatcherSignal`]s into a
/// bounded channel.
///
/// Events under the sync's debris folder are filtered out at the source:
/// debris is engine-produced noise, never user changes.
pub struct RootWatcher {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl RootWatcher {
    /// Creates a watcher for `root` and returns it with the signal
    /// receiver.
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created or the root
    /// cannot be watched.
    pub fn start(
        root: &Path,
        queue_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<WatcherSignal>)> {
        let (tx, rx) = mpsc::channel::<WatcherSignal>(queue_capacity.max(1));
        let root_owned = root.to_path_buf();
        let event_root = root_owned.clone();

        info!(root = %root.display(), "Starting recursive watch");

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for pe in map_notify_event(&event) {
                        if debris::is_debris_path(&event_root, &pe.path) {
                            continue;
                        }
                        match tx.try_send(WatcherSignal::Event(pe)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Queue overflow loses events; the sync
                                // must rescan
                                warn!("Watcher queue overflow, signalling loss");
                                let _ = tx.try_send(WatcherSignal::Lost);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {}
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "Watcher error, signalling loss");
                    let _ = tx.try_send(WatcherSignal::Lost);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        Ok((
            Self {
                watcher,
                root: root_owned,
            },
            rx,
        ))
    }

    /// Stops watching. Dropping the watcher has the same effect; this
    /// exists for explicit shutdown paths.
    pub fn stop(&mut self) {
        if let Err(err) = self.watcher.unwatch(&self.root) {
            debug!(error = %err, "Unwatch on stop failed (already gone?)");
        }
    }
}

// ============================================================================
// CoalescingQueue
// ============================================================================

/// Coalesces rapid-fire events so the reconciler sees at most one pending
/// event per path.
///
/// For a given path the strongest kind wins: a `Created` absorbs a later
/// `Modified`, and any event is superseded by a `Removed` (the entry is
/// gone, whatever happened before). Each update refreshes the timestamp,
/// so a busy path keeps extending its quiet window.
pub struct CoalescingQueue {
    pending: HashMap<PathBuf, (PathEventKind, Instant)>,
    debounce: std::time::Duration,
}

impl CoalescingQueue {
    /// Creates a queue with the given debounce window.
    #[must_use]
    pub fn new(debounce: std::time::Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce,
        }
    }

    /// Inserts or merges an event for its path.
    pub fn push(&mut self, event: PathEvent) {
        let now = Instant::now();
        match self.pending.get_mut(&event.path) {
            Some((kind, stamp)) => {
                if event.kind > *kind {
                    *kind = event.kind;
                }
                *stamp = now;
            }
            None => {
                self.pending.insert(event.path, (event.kind, now));
            }
        }
    }

    /// Returns every event that has been quiet for the debounce window,
    /// removing it from the queue.
    pub fn poll(&mut self) -> Vec<PathEvent> {
        let now = Instant::now();
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, stamp))| now.duration_since(*stamp) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        let mut settled = Vec::with_capacity(settled_paths.len());
        for path in settled_paths {
            if let Some((kind, _)) = self.pending.remove(&path) {
                settled.push(PathEvent { path, kind });
            }
        }

        if !settled.is_empty() {
            debug!(count = settled.len(), "Settled path events");
        }
        settled
    }

    /// Drains everything regardless of age (used on shutdown and before a
    /// full rescan).
    pub fn drain(&mut self) -> Vec<PathEvent> {
        self.pending
            .drain()
            .map(|(path, (kind, _))| PathEvent { path, kind })
            .collect()
    }

    /// Number of unsettled events
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Event mapping tests
    // ------------------------------------------------------------------

    #[test]
    fn test_map_create_event() {
        let event = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/s/a.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(&event),
            vec![PathEvent::new("/s/a.txt", PathEventKind::Created)]
        );
    }

    #[test]
    fn test_map_remove_event() {
        let event = notify::Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/s/a.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(&event),
            vec![PathEvent::new("/s/a.txt", PathEventKind::Removed)]
        );
    }

    #[test]
    fn test_map_rename_decomposes() {
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::Both)),
            paths: vec![PathBuf::from("/s/old.txt"), PathBuf::from("/s/new.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(&event),
            vec![
                PathEvent::new("/s/old.txt", PathEventKind::Removed),
                PathEvent::new("/s/new.txt", PathEventKind::Created),
            ]
        );
    }

    #[test]
    fn test_map_metadata_event() {
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Metadata(
                notify::event::MetadataKind::Permissions,
            )),
            paths: vec![PathBuf::from("/s/a.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_notify_event(&event),
            vec![PathEvent::new("/s/a.txt", PathEventKind::AttrChanged)]
        );
    }

    #[test]
    fn test_map_access_event_ignored() {
        let event = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/s/a.txt")],
            attrs: Default::default(),
        };
        assert!(map_notify_event(&event).is_empty());
    }

    // ------------------------------------------------------------------
    // CoalescingQueue tests
    // ------------------------------------------------------------------

    #[test]
    fn test_coalesce_keeps_strongest_kind() {
        let mut q = CoalescingQueue::new(Duration::ZERO);
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        q.push(PathEvent::new("/s/a", PathEventKind::Modified));
        q.push(PathEvent::new("/s/a", PathEventKind::AttrChanged));

        assert_eq!(q.pending_count(), 1);
        std::thread::sleep(Duration::from_millis(5));
        let settled = q.poll();
        assert_eq!(settled, vec![PathEvent::new("/s/a", PathEventKind::Created)]);
    }

    #[test]
    fn test_removed_supersedes_everything() {
        let mut q = CoalescingQueue::new(Duration::ZERO);
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        q.push(PathEvent::new("/s/a", PathEventKind::Removed));

        std::thread::sleep(Duration::from_millis(5));
        let settled = q.poll();
        assert_eq!(settled, vec![PathEvent::new("/s/a", PathEventKind::Removed)]);
    }

    #[test]
    fn test_distinct_paths_stay_distinct() {
        let mut q = CoalescingQueue::new(Duration::ZERO);
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        q.push(PathEvent::new("/s/b", PathEventKind::Modified));
        assert_eq!(q.pending_count(), 2);
    }

    #[test]
    fn test_poll_respects_debounce() {
        let mut q = CoalescingQueue::new(Duration::from_secs(60));
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        assert!(q.poll().is_empty());
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn test_push_refreshes_timestamp() {
        let mut q = CoalescingQueue::new(Duration::from_millis(50));
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        std::thread::sleep(Duration::from_millis(30));
        q.push(PathEvent::new("/s/a", PathEventKind::Modified));
        std::thread::sleep(Duration::from_millis(30));

        // 60ms since first push, but only 30ms since the refresh
        assert!(q.poll().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.poll().len(), 1);
    }

    #[test]
    fn test_drain_ignores_debounce() {
        let mut q = CoalescingQueue::new(Duration::from_secs(60));
        q.push(PathEvent::new("/s/a", PathEventKind::Created));
        q.push(PathEvent::new("/s/b", PathEventKind::Removed));
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }

    // ------------------------------------------------------------------
    // RootWatcher smoke test
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = RootWatcher::start(dir.path(), 64).unwrap();

        tokio::fs::write(dir.path().join("new.txt"), b"x")
            .await
            .unwrap();

        // The OS event can take a moment; accept any signal about the file
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatcherSignal::Event(pe)) if pe.path.ends_with("new.txt") => {
                        return true;
                    }
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        assert!(got, "expected a watcher event for the new file");
        watcher.stop();
    }

    #[tokio::test]
    async fn test_watcher_ignores_debris() {
        let dir = tempfile::tempdir().unwrap();
        let debris_dir = dir.path().join(".debris/2024-01-01");
        std::fs::create_dir_all(&debris_dir).unwrap();

        let (mut watcher, mut rx) = RootWatcher::start(dir.path(), 64).unwrap();
        tokio::fs::write(debris_dir.join("old.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("real.txt"), b"y")
            .await
            .unwrap();

        let first_real = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatcherSignal::Event(pe)) => return Some(pe.path),
                    Some(WatcherSignal::Lost) => continue,
                    None => return None,
                }
            }
        })
        .await
        .ok()
        .flatten();

        // The first delivered event must be about real.txt, never debris
        if let Some(path) = first_real {
            assert!(path.ends_with("real.txt"), "got debris event: {path:?}");
        }
        watcher.stop();
    }
}
