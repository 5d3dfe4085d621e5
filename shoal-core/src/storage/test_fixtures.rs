//! Test fixtures for storage testing.
//!
//! Provides a disk manager over a temporary directory with a scripted
//! free-space source so quota tests do not depend on the host disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DirectoryConfig, DiskManager, Encoding, FreeSpaceSource, QuotaPolicy};

/// Free-space source reporting an adjustable amount.
#[derive(Debug)]
pub struct FixedFreeSpace {
    free_kib: AtomicU64,
}

impl FixedFreeSpace {
    pub fn new(free_kib: u64) -> Arc<Self> {
        Arc::new(Self {
            free_kib: AtomicU64::new(free_kib),
        })
    }

    pub fn set(&self, free_kib: u64) {
        self.free_kib.store(free_kib, Ordering::SeqCst);
    }
}

impl FreeSpaceSource for FixedFreeSpace {
    fn free_kib(&self, _path: &Path) -> Option<u64> {
        Some(self.free_kib.load(Ordering::SeqCst))
    }
}

/// Creates a temporary directory and a disk manager with plenty of host space.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
pub fn temp_disk_manager() -> (tempfile::TempDir, DiskManager) {
    let temp_dir = tempfile::tempdir().unwrap();
    let manager = DiskManager::with_space_source(0, FixedFreeSpace::new(u64::MAX / 2));
    (temp_dir, manager)
}

/// Quota config for a directory of `max_kib`.
pub fn quota(max_kib: u64, policy: QuotaPolicy) -> DirectoryConfig {
    DirectoryConfig {
        max_kib,
        policy,
        encoding: Encoding::Raw,
    }
}

/// Writes a file of `kib` KiB directly, bypassing the manager.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_raw(dir: &Path, name: &str, kib: usize) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, vec![b'x'; kib * 1024]).unwrap();
    path
}
