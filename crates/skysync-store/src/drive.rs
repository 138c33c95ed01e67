//! Drive-ID binding for external backups
//!
//! External backups are bound to the physical medium, not the mount
//! point: a well-known file on the drive carries a 64-bit drive ID, and
//! attaching the drive anywhere resurrects every sync bound to that ID.
//!
//! File format: 8 bytes, `u64` little-endian, at
//! `<drive>/.skysync/drive.id`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use skysync_core::domain::DriveId;
use skysync_core::ports::IFileSystem;

/// Relative path of the drive-id file on a removable drive
pub const DRIVE_ID_REL_PATH: &str = ".skysync/drive.id";

/// Reads the drive id from an attached drive, if one was ever written.
///
/// # Errors
/// Propagates filesystem errors other than absence; a malformed file is
/// an error (the drive carries something that is not ours).
pub async fn read_drive_id(
    fs: &Arc<dyn IFileSystem>,
    drive_root: &Path,
) -> anyhow::Result<Option<DriveId>> {
    let path = drive_root.join(DRIVE_ID_REL_PATH);
    if fs.entry(&path).await?.is_none() {
        return Ok(None);
    }
    let bytes = fs.read_file(&path).await?;
    let arr: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .context("Drive id file is not 8 bytes")?;
    let id = DriveId::from_le_bytes(arr);
    debug!(drive = %drive_root.display(), id = %id, "Drive id read");
    Ok(Some(id))
}

/// Writes the drive id file onto a drive.
///
/// # Errors
/// Propagates filesystem errors.
pub async fn write_drive_id(
    fs: &Arc<dyn IFileSystem>,
    drive_root: &Path,
    id: DriveId,
) -> anyhow::Result<()> {
    let path = drive_root.join(DRIVE_ID_REL_PATH);
    fs.write_file(&path, &id.to_le_bytes())
        .await
        .context("Failed to write drive id file")?;
    info!(drive = %drive_root.display(), id = %id, "Drive id written");
    Ok(())
}

/// Returns the drive's id, minting and persisting a fresh one on first
/// use.
///
/// # Errors
/// Propagates filesystem errors.
pub async fn ensure_drive_id(
    fs: &Arc<dyn IFileSystem>,
    drive_root: &Path,
) -> anyhow::Result<DriveId> {
    if let Some(id) = read_drive_id(fs, drive_root).await? {
        return Ok(id);
    }
    let id = DriveId::fresh();
    write_drive_id(fs, drive_root, id).await?;
    Ok(id)
}
