//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and paths the engine passes
//! around. Each newtype validates at construction time so the rest of the
//! code can take well-formedness for granted.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Draws a fresh random 64-bit identifier from OS-seeded entropy.
///
/// Zero is reserved as "unset" in the wire format, so it is never returned.
fn fresh_u64() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

// ============================================================================
// 64-bit ID types
// ============================================================================

/// Stable identifier of a sync configuration.
///
/// Assigned on creation, never reused; survives logout/login and external
/// drive detach/attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(u64);

impl BackupId {
    /// Creates a fresh random BackupId
    #[must_use]
    pub fn fresh() -> Self {
        Self(fresh_u64())
    }

    /// Wraps an existing raw id
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for BackupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for BackupId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| DomainError::InvalidName(format!("Invalid backup id: {e}")))
    }
}

/// Identifier persisted on a removable drive to bind external backups
/// to the physical media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(u64);

impl DriveId {
    /// Creates a fresh random DriveId
    #[must_use]
    pub fn fresh() -> Self {
        Self(fresh_u64())
    }

    /// Wraps an existing raw id
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Little-endian on-drive encoding (the drive-id file body)
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decodes the on-drive encoding
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl Display for DriveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable identifier of a cloud node.
///
/// Handles are assigned by the server and never change across renames or
/// moves, which is what makes remote move detection trivial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u64);

impl NodeHandle {
    /// Wraps an existing raw handle
    #[must_use]
    pub const fn from_raw(handle: u64) -> Self {
        Self(handle)
    }

    /// Returns the raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Base64 rendering used by node attributes (the `rr` back-reference)
    #[must_use]
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_le_bytes())
    }

    /// Decodes the base64 attribute rendering
    ///
    /// # Errors
    /// Returns `DomainError::InvalidName` if the input is not a base64
    /// encoding of exactly eight bytes.
    pub fn from_base64(s: &str) -> Result<Self, DomainError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| DomainError::InvalidName(format!("Invalid handle encoding: {e}")))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| DomainError::InvalidName("Handle must be 8 bytes".to_string()))?;
        Ok(Self(u64::from_le_bytes(arr)))
    }
}

impl Display for NodeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Path types
// ============================================================================

/// A validated absolute local path.
///
/// Guarantees: absolute, normalized (no `.`/`..` components). The path
/// need not exist; normalization is purely lexical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct LocalPath(PathBuf);

impl LocalPath {
    /// Creates a new LocalPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is relative or
    /// escapes its root via `..`.
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(Self(normalized))
    }

    /// Borrows the inner path
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Converts to an owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Joins a single relative component, rejecting traversal
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the component is absolute or
    /// contains `..`.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.contains("..") || component.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }
        Self::new(self.0.join(component))
    }

    /// Path relative to `root`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if this path is not under `root`.
    pub fn relative_to(&self, root: &LocalPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(Path::to_path_buf)
            .map_err(|_| {
                DomainError::InvalidPath(format!(
                    "{} is not within {}",
                    self.0.display(),
                    root.0.display()
                ))
            })
    }

    /// True if `self` contains `other` or vice versa (or they are equal).
    ///
    /// Used to reject overlapping sync roots.
    #[must_use]
    pub fn overlaps(&self, other: &LocalPath) -> bool {
        self.0.starts_with(&other.0) || other.0.starts_with(&self.0)
    }
}

impl Display for LocalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for LocalPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<LocalPath> for PathBuf {
    fn from(path: LocalPath) -> Self {
        path.0
    }
}

impl AsRef<Path> for LocalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A cloud-side path (`/` separated, rooted at the account root).
///
/// Advisory only: the authoritative identity of a cloud subtree is its
/// `NodeHandle`, never its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Creates a new RemotePath
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemotePath` unless the path starts
    /// with `/` and is free of empty or traversal components.
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }
        if path.len() > 1 && path.contains("//") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains empty component: {path}"
            )));
        }
        if path.split('/').any(|c| c == "..") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains traversal: {path}"
            )));
        }
        Ok(Self(path))
    }

    /// The account root `/`
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Borrows the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins a single name component
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemotePath` for empty names or names
    /// containing `/`.
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name.contains('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Invalid name component: {name}"
            )));
        }
        let joined = if self.0 == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0)
        };
        Self::new(joined)
    }

    /// Parent path, or `None` at the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final name component, or `None` at the root
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        if self.0 == "/" {
            return None;
        }
        self.0.rsplit('/').next()
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod id_tests {
        use super::*;

        #[test]
        fn test_fresh_ids_are_distinct_and_nonzero() {
            let a = BackupId::fresh();
            let b = BackupId::fresh();
            assert_ne!(a, b);
            assert_ne!(a.as_u64(), 0);
            assert_ne!(DriveId::fresh().as_u64(), 0);
        }

        #[test]
        fn test_backup_id_display_roundtrip() {
            let id = BackupId::from_raw(0xdead_beef_0000_0001);
            let parsed: BackupId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }

        #[test]
        fn test_drive_id_le_bytes_roundtrip() {
            let id = DriveId::from_raw(0x0102_0304_0506_0708);
            assert_eq!(DriveId::from_le_bytes(id.to_le_bytes()), id);
            assert_eq!(id.to_le_bytes()[0], 0x08);
        }

        #[test]
        fn test_handle_base64_roundtrip() {
            let handle = NodeHandle::from_raw(0x0011_2233_4455_6677);
            let encoded = handle.to_base64();
            assert_eq!(NodeHandle::from_base64(&encoded).unwrap(), handle);
        }

        #[test]
        fn test_handle_base64_rejects_garbage() {
            assert!(NodeHandle::from_base64("!!!").is_err());
            assert!(NodeHandle::from_base64("AAAA").is_err()); // 3 bytes
        }
    }

    mod local_path_tests {
        use super::*;

        #[test]
        fn test_new_absolute() {
            let path = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            assert_eq!(path.to_string(), "/home/user/sync");
        }

        #[test]
        fn test_new_relative_fails() {
            assert!(LocalPath::new(PathBuf::from("relative/path")).is_err());
        }

        #[test]
        fn test_normalizes_dot_components() {
            let path = LocalPath::new(PathBuf::from("/home/user/./sync/../sync")).unwrap();
            assert_eq!(path.to_string(), "/home/user/sync");
        }

        #[test]
        fn test_join_rejects_traversal() {
            let root = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            assert!(root.join("../outside").is_err());
            assert!(root.join("/abs").is_err());
            assert_eq!(
                root.join("sub").unwrap().to_string(),
                "/home/user/sync/sub"
            );
        }

        #[test]
        fn test_relative_to() {
            let root = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            let child = LocalPath::new(PathBuf::from("/home/user/sync/d/f.txt")).unwrap();
            assert_eq!(child.relative_to(&root).unwrap(), PathBuf::from("d/f.txt"));
            assert!(root.relative_to(&child).is_err());
        }

        #[test]
        fn test_overlaps() {
            let a = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            let b = LocalPath::new(PathBuf::from("/home/user/sync/nested")).unwrap();
            let c = LocalPath::new(PathBuf::from("/home/user/other")).unwrap();
            assert!(a.overlaps(&b));
            assert!(b.overlaps(&a));
            assert!(a.overlaps(&a));
            assert!(!a.overlaps(&c));
        }
    }

    mod remote_path_tests {
        use super::*;

        #[test]
        fn test_new_valid() {
            let path = RemotePath::new("/docs/file.txt".to_string()).unwrap();
            assert_eq!(path.as_str(), "/docs/file.txt");
        }

        #[test]
        fn test_rejects_bad_paths() {
            assert!(RemotePath::new("docs/file.txt".to_string()).is_err());
            assert!(RemotePath::new("/docs//file.txt".to_string()).is_err());
            assert!(RemotePath::new("/docs/../file.txt".to_string()).is_err());
        }

        #[test]
        fn test_join_and_parent() {
            let path = RemotePath::root().join("docs").unwrap();
            assert_eq!(path.as_str(), "/docs");
            let file = path.join("file.txt").unwrap();
            assert_eq!(file.as_str(), "/docs/file.txt");
            assert_eq!(file.parent().unwrap().as_str(), "/docs");
            assert_eq!(file.parent().unwrap().parent().unwrap().as_str(), "/");
            assert!(RemotePath::root().parent().is_none());
        }

        #[test]
        fn test_name() {
            let path = RemotePath::new("/docs/file.txt".to_string()).unwrap();
            assert_eq!(path.name(), Some("file.txt"));
            assert_eq!(RemotePath::root().name(), None);
        }
    }
}
