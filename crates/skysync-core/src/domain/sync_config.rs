//! Sync configuration and its persisted wire format
//!
//! A [`SyncConfig`] describes one sync: its stable backup id, the local
//! and remote roots, the sync type, and the runtime/lifecycle flags. The
//! config is persisted through the `IConfigDb` port as a versioned
//! little-endian binary blob so it can travel between clients unchanged.
//!
//! ## Wire format (version 1, little-endian)
//!
//! ```text
//! u32 version | u64 backupId | u16 type | u16 state | u16 enabled |
//! u16 lastError | pstr localPath | u64 remoteHandle | pstr remotePath |
//! pstr drivePath | u64 driveId
//!
//! pstr = u16 length | utf-8 bytes
//! ```
//!
//! An absent drive path is an empty `pstr`; an absent drive id is zero.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::{DomainError, SyncError};
use super::newtypes::{BackupId, DriveId, LocalPath, NodeHandle, RemotePath};

/// Wire format version written by this build
pub const CONFIG_WIRE_VERSION: u32 = 1;

// ============================================================================
// SyncType / BackupState
// ============================================================================

/// Direction semantics of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Bidirectional synchronization
    TwoWay,
    /// Unidirectional local → cloud mirror with divergence detection
    Backup,
}

impl SyncType {
    /// Wire code
    pub fn as_u16(self) -> u16 {
        match self {
            SyncType::TwoWay => 0,
            SyncType::Backup => 1,
        }
    }

    /// Decodes a wire code
    ///
    /// # Errors
    /// `DomainError::MalformedBlob` for unknown codes.
    pub fn from_u16(code: u16) -> Result<Self, DomainError> {
        match code {
            0 => Ok(SyncType::TwoWay),
            1 => Ok(SyncType::Backup),
            other => Err(DomainError::MalformedBlob(format!(
                "Unknown sync type: {other}"
            ))),
        }
    }
}

/// Operating mode of a backup-type sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    /// Initial state: local wins, remote divergence is overwritten
    #[default]
    Mirroring,
    /// Converged state: foreign remote mutation disables the sync
    Monitoring,
}

impl BackupState {
    /// Wire code
    pub fn as_u16(self) -> u16 {
        match self {
            BackupState::Mirroring => 0,
            BackupState::Monitoring => 1,
        }
    }

    /// Decodes a wire code
    ///
    /// # Errors
    /// `DomainError::MalformedBlob` for unknown codes.
    pub fn from_u16(code: u16) -> Result<Self, DomainError> {
        match code {
            0 => Ok(BackupState::Mirroring),
            1 => Ok(BackupState::Monitoring),
            other => Err(DomainError::MalformedBlob(format!(
                "Unknown backup state: {other}"
            ))),
        }
    }
}

// ============================================================================
// SyncConfig
// ============================================================================

/// Persistent descriptor of one sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Stable identifier, assigned on creation, never reused
    pub backup_id: BackupId,
    /// Absolute sync root on the local device
    pub local_path: LocalPath,
    /// Authoritative cloud subtree root
    pub remote_handle: NodeHandle,
    /// Last known cloud path; advisory only
    pub remote_path: RemotePath,
    /// Root of the removable drive, for external backups
    pub drive_path: Option<PathBuf>,
    /// Identifier persisted on the drive itself, for external backups
    pub drive_id: Option<DriveId>,
    /// Direction semantics
    pub sync_type: SyncType,
    /// Operating mode; meaningful only when `sync_type` is `Backup`
    pub backup_state: BackupState,
    /// User-intended runtime state
    pub enabled: bool,
    /// Last automatic-disable reason
    pub last_error: SyncError,
}

impl SyncConfig {
    /// Creates an enabled two-way sync descriptor with a fresh backup id.
    #[must_use]
    pub fn two_way(
        local_path: LocalPath,
        remote_handle: NodeHandle,
        remote_path: RemotePath,
    ) -> Self {
        Self {
            backup_id: BackupId::fresh(),
            local_path,
            remote_handle,
            remote_path,
            drive_path: None,
            drive_id: None,
            sync_type: SyncType::TwoWay,
            backup_state: BackupState::default(),
            enabled: true,
            last_error: SyncError::None,
        }
    }

    /// Creates an enabled backup descriptor, starting in mirroring mode.
    #[must_use]
    pub fn backup(
        local_path: LocalPath,
        remote_handle: NodeHandle,
        remote_path: RemotePath,
    ) -> Self {
        Self {
            sync_type: SyncType::Backup,
            ..Self::two_way(local_path, remote_handle, remote_path)
        }
    }

    /// Binds this backup to an external drive.
    #[must_use]
    pub fn on_drive(mut self, drive_path: PathBuf, drive_id: DriveId) -> Self {
        self.drive_path = Some(drive_path);
        self.drive_id = Some(drive_id);
        self
    }

    /// True for backup-type syncs
    #[must_use]
    pub fn is_backup(&self) -> bool {
        matches!(self.sync_type, SyncType::Backup)
    }

    /// True for external (drive-bound) backups
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.drive_path.is_some()
    }

    /// Records an automatic disable with its reason.
    pub fn disable(&mut self, reason: SyncError) {
        self.enabled = false;
        self.last_error = reason;
    }

    /// Re-enables after a disable. Backups always re-enter mirroring;
    /// monitoring is never resumed across a divergence.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.last_error = SyncError::None;
        if self.is_backup() {
            self.backup_state = BackupState::Mirroring;
        }
    }

    // ========================================================================
    // Wire codec
    // ========================================================================

    /// Serializes to the versioned wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let local = self.local_path.as_path().to_string_lossy();
        let drive = self
            .drive_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut out =
            Vec::with_capacity(64 + local.len() + self.remote_path.as_str().len() + drive.len());
        out.extend_from_slice(&CONFIG_WIRE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.backup_id.as_u64().to_le_bytes());
        out.extend_from_slice(&self.sync_type.as_u16().to_le_bytes());
        out.extend_from_slice(&self.backup_state.as_u16().to_le_bytes());
        out.extend_from_slice(&u16::from(self.enabled).to_le_bytes());
        out.extend_from_slice(&self.last_error.as_u16().to_le_bytes());
        put_pstr(&mut out, &local);
        out.extend_from_slice(&self.remote_handle.as_u64().to_le_bytes());
        put_pstr(&mut out, self.remote_path.as_str());
        put_pstr(&mut out, &drive);
        out.extend_from_slice(
            &self
                .drive_id
                .map(|d| d.as_u64())
                .unwrap_or_default()
                .to_le_bytes(),
        );
        out
    }

    /// Deserializes from the wire format, rejecting unknown versions,
    /// truncation, and trailing garbage.
    ///
    /// # Errors
    /// `DomainError::MalformedBlob` on any structural problem;
    /// `DomainError::InvalidPath` if the stored local path is not absolute.
    pub fn decode(blob: &[u8]) -> Result<Self, DomainError> {
        let mut r = Reader::new(blob);

        let version = r.u32()?;
        if version != CONFIG_WIRE_VERSION {
            return Err(DomainError::MalformedBlob(format!(
                "Unsupported config version: {version}"
            )));
        }

        let backup_id = BackupId::from_raw(r.u64()?);
        let sync_type = SyncType::from_u16(r.u16()?)?;
        let backup_state = BackupState::from_u16(r.u16()?)?;
        let enabled = match r.u16()? {
            0 => false,
            1 => true,
            other => {
                return Err(DomainError::MalformedBlob(format!(
                    "Invalid enabled flag: {other}"
                )))
            }
        };
        let last_error = SyncError::from_u16(r.u16()?)?;
        let local_path = LocalPath::new(PathBuf::from(r.pstr()?))?;
        let remote_handle = NodeHandle::from_raw(r.u64()?);
        let remote_path = RemotePath::new(r.pstr()?)?;
        let drive = r.pstr()?;
        let drive_raw = r.u64()?;
        r.finish()?;

        Ok(Self {
            backup_id,
            local_path,
            remote_handle,
            remote_path,
            drive_path: (!drive.is_empty()).then(|| PathBuf::from(drive)),
            drive_id: (drive_raw != 0).then(|| DriveId::from_raw(drive_raw)),
            sync_type,
            backup_state,
            enabled,
            last_error,
        })
    }
}

fn put_pstr(out: &mut Vec<u8>, s: &str) {
    let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

/// Cursor over a wire-format blob
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DomainError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| DomainError::MalformedBlob("Truncated blob".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DomainError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DomainError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DomainError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn pstr(&mut self) -> Result<String, DomainError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DomainError::MalformedBlob(format!("Invalid utf-8 in pstr: {e}")))
    }

    fn finish(&self) -> Result<(), DomainError> {
        if self.pos != self.buf.len() {
            return Err(DomainError::MalformedBlob(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
