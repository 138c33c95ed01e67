//! Content fingerprints
//!
//! A [`Fingerprint`] is a compact content identity: file size, mtime, and
//! four CRC32 words computed over a fixed sparse sample of the file.
//! Equal fingerprints are treated as identical content for transfer
//! deduplication and move detection; this is a heuristic, not a proof,
//! and collisions are tolerated by the reconciler.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of CRC words in a fingerprint
pub const CRC_WORDS: usize = 4;

/// Bytes per sampled block for large files
const SAMPLE_BLOCK: u64 = 16;

/// Blocks contributing to each CRC word for large files
const BLOCKS_PER_WORD: u64 = 8;

/// Files up to this size are read in full and CRC'd in four bands
const FULL_READ_LIMIT: u64 = 16 * 1024;

// ============================================================================
// Fingerprint
// ============================================================================

/// Compact content identity of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes
    pub size: u64,
    /// Last-modified time of the file
    pub mtime: DateTime<Utc>,
    /// CRC32 words over the sparse sample
    pub crc: [u32; CRC_WORDS],
}

impl Fingerprint {
    /// Computes a fingerprint from an in-memory byte buffer.
    ///
    /// Used by tests and by adapters that already hold the content.
    #[must_use]
    pub fn from_bytes(data: &[u8], mtime: DateTime<Utc>) -> Self {
        let size = data.len() as u64;
        let mut crc = [0u32; CRC_WORDS];

        if size <= FULL_READ_LIMIT {
            // Four near-equal bands over the whole content
            for (i, word) in crc.iter_mut().enumerate() {
                let begin = (i as u64 * size / CRC_WORDS as u64) as usize;
                let end = ((i as u64 + 1) * size / CRC_WORDS as u64) as usize;
                *word = crc32fast::hash(&data[begin..end]);
            }
        } else {
            for (i, word) in crc.iter_mut().enumerate() {
                let mut hasher = crc32fast::Hasher::new();
                for k in 0..BLOCKS_PER_WORD {
                    let offset = sample_offset(size, i as u64 * BLOCKS_PER_WORD + k);
                    let end = (offset + SAMPLE_BLOCK).min(size) as usize;
                    hasher.update(&data[offset as usize..end]);
                }
                *word = hasher.finalize();
            }
        }

        Self { size, mtime, crc }
    }

    /// Computes a fingerprint by reading the file at `path`.
    ///
    /// Small files are read whole; larger files are sampled with seeks, so
    /// the cost is bounded regardless of file size.
    ///
    /// # Errors
    /// Propagates I/O errors from opening or reading the file.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let mtime: DateTime<Utc> = meta.modified()?.into();

        if size <= FULL_READ_LIMIT {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data)?;
            return Ok(Self::from_bytes(&data, mtime));
        }

        let mut crc = [0u32; CRC_WORDS];
        let mut block = [0u8; SAMPLE_BLOCK as usize];
        for (i, word) in crc.iter_mut().enumerate() {
            let mut hasher = crc32fast::Hasher::new();
            for k in 0..BLOCKS_PER_WORD {
                let offset = sample_offset(size, i as u64 * BLOCKS_PER_WORD + k);
                file.seek(SeekFrom::Start(offset))?;
                let want = (SAMPLE_BLOCK.min(size - offset)) as usize;
                file.read_exact(&mut block[..want])?;
                hasher.update(&block[..want]);
            }
            *word = hasher.finalize();
        }

        Ok(Self { size, mtime, crc })
    }

    /// True when size and CRC words agree, ignoring mtime.
    ///
    /// This is the content-identity check used to break mtime ties in
    /// conflict resolution.
    #[must_use]
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.size == other.size && self.crc == other.crc
    }
}

/// Byte offset of the `index`-th sampled block, spread evenly over the file.
fn sample_offset(size: u64, index: u64) -> u64 {
    let blocks = CRC_WORDS as u64 * BLOCKS_PER_WORD;
    debug_assert!(size > SAMPLE_BLOCK);
    let span = size - SAMPLE_BLOCK;
    index * span / (blocks - 1)
}

// ============================================================================
// Gallery ordering
// ============================================================================

/// Media band a node sorts into on gallery surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaClass {
    /// Still images
    Photo,
    /// Moving images
    Video,
    /// Folders that are neither of the above
    OtherFolder,
    /// Files that are neither of the above
    OtherFile,
}

impl MediaClass {
    /// Classifies a node by its name extension and kind.
    #[must_use]
    pub fn classify(name: &str, is_folder: bool) -> Self {
        if is_folder {
            return MediaClass::OtherFolder;
        }
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "heic" | "tif" | "tiff" => {
                MediaClass::Photo
            }
            "mp4" | "mov" | "avi" | "mkv" | "webm" | "m4v" | "mpg" | "mpeg" => MediaClass::Video,
            _ => MediaClass::OtherFile,
        }
    }
}

/// Ascending `(mtime, name)` order
#[must_use]
pub fn cmp_by_mtime_asc(
    a_mtime: DateTime<Utc>,
    a_name: &str,
    b_mtime: DateTime<Utc>,
    b_name: &str,
) -> Ordering {
    a_mtime.cmp(&b_mtime).then_with(|| a_name.cmp(b_name))
}

/// Descending `(mtime, name)` order
#[must_use]
pub fn cmp_by_mtime_desc(
    a_mtime: DateTime<Utc>,
    a_name: &str,
    b_mtime: DateTime<Utc>,
    b_name: &str,
) -> Ordering {
    cmp_by_mtime_asc(a_mtime, a_name, b_mtime, b_name).reverse()
}

/// Media-banded order: photos, then videos, then other folders, then
/// other files; `(mtime, name)` ascending within each band.
#[must_use]
pub fn cmp_with_media_bands(
    a_name: &str,
    a_folder: bool,
    a_mtime: DateTime<Utc>,
    b_name: &str,
    b_folder: bool,
    b_mtime: DateTime<Utc>,
) -> Ordering {
    MediaClass::classify(a_name, a_folder)
        .cmp(&MediaClass::classify(b_name, b_folder))
        .then_with(|| cmp_by_mtime_asc(a_mtime, a_name, b_mtime, b_name))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_equal_content_equal_fingerprint() {
        let data = vec![0xabu8; 4096];
        let a = Fingerprint::from_bytes(&data, ts(100));
        let b = Fingerprint::from_bytes(&data, ts(100));
        assert_eq!(a, b);
    }

    #[test]
    fn test_mtime_breaks_equality_but_not_content() {
        let data = vec![0x11u8; 1024];
        let a = Fingerprint::from_bytes(&data, ts(100));
        let b = Fingerprint::from_bytes(&data, ts(200));
        assert_ne!(a, b);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_small_file_change_is_detected() {
        let mut data = vec![0u8; 1000];
        let a = Fingerprint::from_bytes(&data, ts(1));
        data[500] = 1;
        let b = Fingerprint::from_bytes(&data, ts(1));
        assert_ne!(a.crc, b.crc);
    }

    #[test]
    fn test_large_file_sampling_misses_unsampled_bytes() {
        // Sparse sampling means a byte outside every sampled block leaves
        // the fingerprint unchanged; this is the documented collision case.
        let size = 1024 * 1024;
        let mut data = vec![0u8; size];
        let a = Fingerprint::from_bytes(&data, ts(1));

        let blocks = CRC_WORDS as u64 * BLOCKS_PER_WORD;
        let sampled: Vec<(u64, u64)> = (0..blocks)
            .map(|k| {
                let off = sample_offset(size as u64, k);
                (off, off + SAMPLE_BLOCK)
            })
            .collect();
        let victim = (0..size as u64)
            .find(|pos| !sampled.iter().any(|(lo, hi)| pos >= lo && pos < hi))
            .unwrap();

        data[victim as usize] ^= 0xff;
        let b = Fingerprint::from_bytes(&data, ts(1));
        assert_eq!(a.crc, b.crc);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_large_file_sampled_change_is_detected() {
        let size = 1024 * 1024;
        let mut data = vec![0u8; size];
        let a = Fingerprint::from_bytes(&data, ts(1));
        data[0] = 1; // first sampled block starts at offset 0
        let b = Fingerprint::from_bytes(&data, ts(1));
        assert_ne!(a.crc, b.crc);
    }

    #[test]
    fn test_from_file_matches_from_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let from_file = Fingerprint::from_file(&path).unwrap();
        let from_bytes = Fingerprint::from_bytes(&data, from_file.mtime);
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn test_empty_file() {
        let fp = Fingerprint::from_bytes(&[], ts(0));
        assert_eq!(fp.size, 0);
        // Four CRCs of the empty range
        assert_eq!(fp.crc, [crc32fast::hash(&[]); 4]);
    }

    mod ordering_tests {
        use super::*;

        #[test]
        fn test_media_classification() {
            assert_eq!(MediaClass::classify("a.JPG", false), MediaClass::Photo);
            assert_eq!(MediaClass::classify("b.mkv", false), MediaClass::Video);
            assert_eq!(MediaClass::classify("docs", true), MediaClass::OtherFolder);
            assert_eq!(MediaClass::classify("a.pdf", false), MediaClass::OtherFile);
            assert_eq!(MediaClass::classify("noext", false), MediaClass::OtherFile);
        }

        #[test]
        fn test_mtime_order_with_name_tiebreak() {
            assert_eq!(
                cmp_by_mtime_asc(ts(1), "a", ts(2), "b"),
                Ordering::Less
            );
            assert_eq!(
                cmp_by_mtime_asc(ts(1), "b", ts(1), "a"),
                Ordering::Greater
            );
            assert_eq!(
                cmp_by_mtime_desc(ts(1), "a", ts(2), "b"),
                Ordering::Greater
            );
        }

        #[test]
        fn test_media_bands_are_contiguous() {
            // photo < video < other folder < other file regardless of mtime
            assert_eq!(
                cmp_with_media_bands("z.jpg", false, ts(9), "a.mp4", false, ts(1)),
                Ordering::Less
            );
            assert_eq!(
                cmp_with_media_bands("movies", true, ts(1), "a.mov", false, ts(9)),
                Ordering::Greater
            );
            assert_eq!(
                cmp_with_media_bands("a.txt", false, ts(1), "b", true, ts(9)),
                Ordering::Greater
            );
        }
    }
}
