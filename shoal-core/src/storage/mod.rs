//! Storage layer for collected torrents and subtitle files.
//!
//! All file I/O for overlay-collected content goes through the
//! [`DiskManager`], which enforces a per-directory quota and keeps a reserve
//! of host free space untouched.

pub mod disk_manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::PathBuf;

pub use disk_manager::{DiskManager, FreeSpaceSource, SystemFreeSpace};

/// Smallest accounted file size in KiB.
pub const MIN_FILE_KIB: u64 = 4;

/// Deletions attempted by one write before giving up.
pub const MAX_EVICTIONS_PER_WRITE: usize = 100;

/// What a write does when the directory quota or host reserve is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Fail the write
    Reject,
    /// Delete files by ascending modification time
    DeleteOldest,
    /// Delete files by descending modification time
    DeleteNewest,
    /// Delete uniformly random files
    DeleteRandom,
}

/// On-disk encoding of a directory's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Bytes stored as given
    Raw,
    /// Text stored as UTF-8, invalid sequences replaced
    Utf8,
}

impl Encoding {
    /// Applies the encoding to bytes about to be written.
    pub fn encode(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Encoding::Raw => bytes.to_vec(),
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned().into_bytes(),
        }
    }
}

/// Quota settings of one managed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub max_kib: u64,
    pub policy: QuotaPolicy,
    pub encoding: Encoding,
}

/// Accounted size of a file of `len` bytes.
pub fn size_kib(len: usize) -> u64 {
    (len as u64).div_ceil(1024).max(MIN_FILE_KIB)
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Quota or host free-space reserve refused the write
    #[error("Disk full on {}: need {needed_kib} KiB, {available_kib} KiB available", drive.display())]
    DiskFull {
        /// Directory the write targeted
        drive: PathBuf,
        needed_kib: u64,
        available_kib: u64,
    },

    /// Directory was never registered with the manager
    #[error("Directory {} is not registered", dir.display())]
    UnregisteredDirectory { dir: PathBuf },

    /// File name would escape the managed directory
    #[error("Invalid file name {name:?}")]
    InvalidName { name: String },

    /// Requested file does not exist
    #[error("File {} not found", path.display())]
    NotFound { path: PathBuf },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up_with_floor() {
        assert_eq!(size_kib(0), 4);
        assert_eq!(size_kib(1), 4);
        assert_eq!(size_kib(4 * 1024), 4);
        assert_eq!(size_kib(4 * 1024 + 1), 5);
        assert_eq!(size_kib(300 * 1024), 300);
    }

    #[test]
    fn test_utf8_encoding_replaces_invalid_bytes() {
        assert_eq!(Encoding::Raw.encode(b"a\xffb"), b"a\xffb".to_vec());
        assert_eq!(
            Encoding::Utf8.encode(b"a\xffb"),
            "a\u{FFFD}b".as_bytes().to_vec()
        );
    }
}
