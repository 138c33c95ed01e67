//! Filename canonicalization and anomaly classification
//!
//! Cloud names are free-form text; local names are restricted by the host
//! filesystem. This module defines the reversible `%xx` escape between the
//! two, classifies the mismatches it produces, and supplies the
//! case-aware comparators used for sibling clash detection.
//!
//! ## Round-trip contract
//!
//! For every cloud name `c`, `decode(&encode(c, p)) == c` byte-for-byte.
//! For every local name `l` produced by `encode`, `encode(&decode(l), p) == l`.
//! The escape character `%` is itself escaped only when followed by two
//! hex digits, so `%30` and `0` remain distinct after a round trip.

use serde::{Deserialize, Serialize};

/// Reserved device names on colon-hostile hosts (checked case-insensitively
/// against the portion of the name before the first dot).
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

// ============================================================================
// NamePolicy
// ============================================================================

/// Host filesystem naming restrictions.
///
/// Determines which bytes must be escaped when a cloud name is realized
/// locally, and how sibling names compare for clash purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePolicy {
    /// Characters the local filesystem reserves
    reserved: &'static [u8],
    /// Whether control characters 0-31 must be escaped
    escape_controls: bool,
    /// Whether device names like `CON` are unusable
    device_names_reserved: bool,
    /// Whether the local filesystem compares names case-insensitively
    case_insensitive: bool,
}

impl NamePolicy {
    /// Policy for POSIX-style hosts: only `/` and NUL are reserved,
    /// comparison is case-sensitive.
    #[must_use]
    pub fn posix() -> Self {
        Self {
            reserved: b"/",
            escape_controls: false,
            device_names_reserved: false,
            case_insensitive: false,
        }
    }

    /// Policy for case-insensitive, colon-hostile hosts: the full reserved
    /// set, control characters, and device names.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            reserved: b"\\/:?\"<>|*",
            escape_controls: true,
            device_names_reserved: true,
            case_insensitive: true,
        }
    }

    /// Policy matching the compile-target host.
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::strict()
        } else {
            Self::posix()
        }
    }

    /// True when the local filesystem compares names case-insensitively
    #[must_use]
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn must_escape(&self, byte: u8) -> bool {
        if byte == 0 || self.reserved.contains(&byte) {
            return true;
        }
        self.escape_controls && byte < 32
    }

    /// True when `name` collides with a reserved device name on this host.
    #[must_use]
    pub fn is_reserved_device_name(&self, name: &str) -> bool {
        if !self.device_names_reserved {
            return false;
        }
        let stem = name.split('.').next().unwrap_or(name);
        RESERVED_DEVICE_NAMES
            .iter()
            .any(|d| stem.eq_ignore_ascii_case(d))
    }

    /// Equality as the local filesystem itself would judge it.
    #[must_use]
    pub fn fs_equal(&self, a: &str, b: &str) -> bool {
        if self.case_insensitive {
            // Simple Unicode case folding; sufficient for the clash check
            a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    }
}

// ============================================================================
// Escape / unescape
// ============================================================================

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

/// Renders a cloud name as a filesystem-safe local name.
///
/// Reserved bytes become `%xx` (two lowercase hex digits). `%` is escaped
/// to `%25` only when leaving it bare would make it decodable, i.e. when
/// it is followed by two hex digits.
#[must_use]
pub fn encode(cloud_name: &str, policy: &NamePolicy) -> String {
    let bytes = cloud_name.as_bytes();
    let mut out = String::with_capacity(bytes.len());

    for (i, &b) in bytes.iter().enumerate() {
        if policy.must_escape(b) {
            out.push_str(&format!("%{b:02x}"));
        } else if b == b'%' && i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2])
        {
            out.push_str("%25");
        } else {
            // Multi-byte UTF-8 sequences pass through untouched
            out.push(b as char);
        }
    }

    // The bytes pushed as `char` above are all ASCII except UTF-8
    // continuation bytes, which survive only via the byte-faithful path.
    if cloud_name.is_ascii() {
        out
    } else {
        encode_non_ascii(cloud_name, policy)
    }
}

/// Byte-faithful encoding for names containing multi-byte UTF-8.
fn encode_non_ascii(cloud_name: &str, policy: &NamePolicy) -> String {
    let bytes = cloud_name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    for (i, &b) in bytes.iter().enumerate() {
        if policy.must_escape(b) {
            out.extend_from_slice(format!("%{b:02x}").as_bytes());
        } else if b == b'%' && i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2])
        {
            out.extend_from_slice(b"%25");
        } else {
            out.push(b);
        }
    }

    // Input was valid UTF-8 and escapes only insert ASCII
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Recovers the cloud name from a local name produced by [`encode`].
///
/// `%xx` becomes the byte `0xXX`; a `%` not followed by two hex digits
/// passes through unchanged.
#[must_use]
pub fn decode(local_name: &str) -> String {
    let bytes = local_name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2])
        {
            let hi = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (bytes[i + 2] as char).to_digit(16).unwrap_or(0) as u8;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

// ============================================================================
// Anomaly classification
// ============================================================================

/// How a cloud name and its local realization relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameAnomaly {
    /// Cloud name equals local name exactly
    None,
    /// Names differ after canonicalization (escaping was needed)
    NameMismatch,
    /// Cloud name collides with a reserved device name on this host
    NameReserved,
    /// The local entry is a kind the sync ignores (symlink, device node)
    SpecialEntry,
}

/// Classifies the cloud-name / local-name pair realized at a sync site.
#[must_use]
pub fn classify(cloud_name: &str, local_name: &str, policy: &NamePolicy) -> FilenameAnomaly {
    if policy.is_reserved_device_name(cloud_name) {
        FilenameAnomaly::NameReserved
    } else if cloud_name == local_name {
        FilenameAnomaly::None
    } else {
        FilenameAnomaly::NameMismatch
    }
}

// ============================================================================
// Clash detection
// ============================================================================

/// Which side of the sync a clash was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClashSide {
    /// Duplicate entries on the local filesystem
    Local,
    /// Duplicate entries in the cloud tree
    Remote,
}

/// A recorded sibling name clash.
///
/// Neither clashing entry propagates to the other side until the user
/// removes one of the duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameClash {
    /// Cloud-canonical path of the containing folder
    pub parent_path: String,
    /// Side the duplicates live on
    pub side: ClashSide,
    /// The clashing names, as spelled on that side
    pub names: Vec<String>,
}

/// True when two local sibling names would land on the same cloud name,
/// or when the local filesystem itself cannot tell them apart.
#[must_use]
pub fn local_names_collide(a: &str, b: &str, policy: &NamePolicy) -> bool {
    decode(a) == decode(b) || policy.fs_equal(a, b)
}

/// True when two cloud sibling names would be realized as the same local
/// entry on this host.
#[must_use]
pub fn cloud_names_collide(a: &str, b: &str, policy: &NamePolicy) -> bool {
    policy.fs_equal(&encode(a, policy), &encode(b, policy))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod escape_tests {
        use super::*;

        #[test]
        fn test_plain_name_unchanged() {
            let p = NamePolicy::strict();
            assert_eq!(encode("report.txt", &p), "report.txt");
            assert_eq!(decode("report.txt"), "report.txt");
        }

        #[test]
        fn test_reserved_chars_escaped_lowercase_hex() {
            let p = NamePolicy::strict();
            assert_eq!(encode("g:0", &p), "g%3a0");
            assert_eq!(encode("a<b>c", &p), "a%3cb%3ec");
            assert_eq!(encode("pipe|star*", &p), "pipe%7cstar%2a");
        }

        #[test]
        fn test_percent_escaped_only_when_decodable() {
            let p = NamePolicy::strict();
            // `%30` would decode as `0`, so the escape char itself escapes
            assert_eq!(encode("f%30", &p), "f%2530");
            // A bare trailing percent is not decodable and passes through
            assert_eq!(encode("100%", &p), "100%");
            assert_eq!(encode("%zz", &p), "%zz");
        }

        #[test]
        fn test_decode_distinguishes_escaped_percent() {
            assert_eq!(decode("f%2530"), "f%30");
            assert_eq!(decode("f%30"), "f0");
            assert_ne!(decode("f%2530"), decode("f%30"));
        }

        #[test]
        fn test_control_chars_escaped_on_strict() {
            let p = NamePolicy::strict();
            assert_eq!(encode("a\u{07}b", &p), "a%07b");
        }

        #[test]
        fn test_posix_escapes_only_slash() {
            let p = NamePolicy::posix();
            assert_eq!(encode("g:0", &p), "g:0");
            assert_eq!(encode("a/b", &p), "a%2fb");
        }

        #[test]
        fn test_roundtrip_cloud_to_local() {
            let p = NamePolicy::strict();
            for name in [
                "plain",
                "g:0",
                "f%30",
                "%25",
                "a\"b?c",
                "100%",
                "tricky%3a",
                "mixed: \"quotes\" | pipes",
            ] {
                assert_eq!(decode(&encode(name, &p)), name, "round-trip of {name:?}");
            }
        }

        #[test]
        fn test_roundtrip_local_to_cloud() {
            let p = NamePolicy::strict();
            for cloud in ["g:0", "f%30", "plain", "a*b"] {
                let local = encode(cloud, &p);
                assert_eq!(encode(&decode(&local), &p), local);
            }
        }

        #[test]
        fn test_non_ascii_names_pass_through() {
            let p = NamePolicy::strict();
            let name = "фото:2024";
            let local = encode(name, &p);
            assert_eq!(local, "фото%3a2024");
            assert_eq!(decode(&local), name);
        }
    }

    mod anomaly_tests {
        use super::*;

        #[test]
        fn test_identical_names_no_anomaly() {
            let p = NamePolicy::strict();
            assert_eq!(classify("a.txt", "a.txt", &p), FilenameAnomaly::None);
        }

        #[test]
        fn test_escaped_name_is_mismatch() {
            let p = NamePolicy::strict();
            assert_eq!(classify("g:0", "g%3a0", &p), FilenameAnomaly::NameMismatch);
        }

        #[test]
        fn test_device_name_is_reserved() {
            let p = NamePolicy::strict();
            assert_eq!(classify("CON", "CON", &p), FilenameAnomaly::NameReserved);
            assert_eq!(
                classify("aux.txt", "aux.txt", &p),
                FilenameAnomaly::NameReserved
            );
            assert_eq!(classify("lpt9", "lpt9", &p), FilenameAnomaly::NameReserved);
        }

        #[test]
        fn test_device_names_not_reserved_on_posix() {
            let p = NamePolicy::posix();
            assert_eq!(classify("CON", "CON", &p), FilenameAnomaly::None);
        }
    }

    mod clash_tests {
        use super::*;

        #[test]
        fn test_escape_collision_is_local_clash() {
            // `f%30` decodes to `f0`, same cloud name as literal `f0`
            let p = NamePolicy::posix();
            assert!(local_names_collide("f0", "f%30", &p));
            assert!(!local_names_collide("f0", "f1", &p));
        }

        #[test]
        fn test_case_collision_on_insensitive_host() {
            let strict = NamePolicy::strict();
            let posix = NamePolicy::posix();
            assert!(local_names_collide("Readme.md", "README.MD", &strict));
            assert!(!local_names_collide("Readme.md", "README.MD", &posix));
        }

        #[test]
        fn test_cloud_names_collide_via_realization() {
            let strict = NamePolicy::strict();
            assert!(cloud_names_collide("A.txt", "a.txt", &strict));
            assert!(!cloud_names_collide("a.txt", "b.txt", &strict));
        }
    }
}
