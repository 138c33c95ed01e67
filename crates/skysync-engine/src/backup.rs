//! Backup controller
//!
//! Backup-type syncs are unidirectional local → cloud with a divergence
//! check, enforced as a two-state machine:
//!
//! ```text
//!     ┌───────────┐   converged    ┌────────────┐
//!     │ Mirroring │ ─────────────► │ Monitoring │
//!     └───────────┘                └────────────┘
//!          ▲                             │
//!          │ re-enable /                 │ foreign remote delta
//!          │ drive re-attach             ▼
//!          │                   disabled(BackupModified)
//!          └─────────────────────────────┘
//! ```
//!
//! While mirroring, any remote change not produced by this client is
//! overwritten by the local side. Once the tree has converged (no pending
//! transfers, local == remote) the sync enters monitoring, where a
//! foreign mutation disables it; the user must consciously re-enable,
//! which always re-enters mirroring.

use tracing::{info, warn};

use skysync_core::domain::{BackupId, BackupState, SyncError};

/// What the reconciler should do about a foreign remote change on a
/// backup sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupVerdict {
    /// Mirroring: converge the remote back to the local side
    OverwriteRemote,
    /// Monitoring: the backup contract is broken; disable the sync
    Disable(SyncError),
}

/// State machine for one backup-type sync
#[derive(Debug, Clone)]
pub struct BackupController {
    backup_id: BackupId,
    state: BackupState,
}

impl BackupController {
    /// Creates a controller in the given persisted state.
    ///
    /// External-drive resumption always restarts from [`BackupState::Mirroring`]
    /// regardless of what was persisted; pass `force_mirror` for that path.
    #[must_use]
    pub fn new(backup_id: BackupId, persisted: BackupState, force_mirror: bool) -> Self {
        let state = if force_mirror {
            BackupState::Mirroring
        } else {
            persisted
        };
        Self { backup_id, state }
    }

    /// Current operating mode
    #[must_use]
    pub fn state(&self) -> BackupState {
        self.state
    }

    /// True while the initial mirror is still converging
    #[must_use]
    pub fn is_mirroring(&self) -> bool {
        matches!(self.state, BackupState::Mirroring)
    }

    /// Reports the end of a reconciler pass.
    ///
    /// Entering monitoring requires full convergence: nothing pending and
    /// no divergence seen during the pass. Returns `true` when the state
    /// changed (so the caller persists it).
    pub fn on_pass_complete(&mut self, pending_operations: usize, diverged: bool) -> bool {
        if self.state == BackupState::Mirroring && pending_operations == 0 && !diverged {
            info!(backup_id = %self.backup_id, "Mirror converged, entering monitoring");
            self.state = BackupState::Monitoring;
            return true;
        }
        false
    }

    /// Reports a remote change produced by another client.
    #[must_use]
    pub fn on_foreign_change(&self) -> BackupVerdict {
        match self.state {
            BackupState::Mirroring => {
                info!(backup_id = %self.backup_id, "Foreign change during mirror, overwriting");
                BackupVerdict::OverwriteRemote
            }
            BackupState::Monitoring => {
                warn!(
                    backup_id = %self.backup_id,
                    "Foreign change while monitoring, disabling backup"
                );
                BackupVerdict::Disable(SyncError::BackupModified)
            }
        }
    }

    /// Explicit re-enable after a disable: always back to mirroring.
    pub fn on_enable(&mut self) {
        self.state = BackupState::Mirroring;
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(state: BackupState) -> BackupController {
        BackupController::new(BackupId::from_raw(7), state, false)
    }

    #[test]
    fn test_starts_in_persisted_state() {
        assert_eq!(
            controller(BackupState::Monitoring).state(),
            BackupState::Monitoring
        );
        assert!(controller(BackupState::Mirroring).is_mirroring());
    }

    #[test]
    fn test_force_mirror_overrides_persisted_state() {
        let c = BackupController::new(BackupId::from_raw(7), BackupState::Monitoring, true);
        assert!(c.is_mirroring());
    }

    #[test]
    fn test_convergence_enters_monitoring() {
        let mut c = controller(BackupState::Mirroring);

        // Still pending work: no transition
        assert!(!c.on_pass_complete(3, false));
        assert!(c.is_mirroring());

        // Divergence seen this pass: no transition
        assert!(!c.on_pass_complete(0, true));
        assert!(c.is_mirroring());

        // Converged
        assert!(c.on_pass_complete(0, false));
        assert_eq!(c.state(), BackupState::Monitoring);

        // Already monitoring: no further transition to report
        assert!(!c.on_pass_complete(0, false));
    }

    #[test]
    fn test_foreign_change_verdicts() {
        let c = controller(BackupState::Mirroring);
        assert_eq!(c.on_foreign_change(), BackupVerdict::OverwriteRemote);

        let c = controller(BackupState::Monitoring);
        assert_eq!(
            c.on_foreign_change(),
            BackupVerdict::Disable(SyncError::BackupModified)
        );
    }

    #[test]
    fn test_enable_always_reenters_mirroring() {
        let mut c = controller(BackupState::Monitoring);
        c.on_enable();
        assert!(c.is_mirroring());
    }
}
