//! Collected-torrent directory: naming, persistence and overflow eviction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::catalog::TorrentRecord;
use crate::storage::{DiskManager, StorageError};
use crate::torrent::{InfoHash, sha1_digest};

/// File name of a collected torrent: `hex(sha1(infohash)).torrent`.
pub fn collected_file_name(info_hash: &InfoHash) -> String {
    format!("{}.torrent", hex::encode(sha1_digest(info_hash.as_bytes())))
}

/// Infohashes to evict so the collection shrinks to `ratio` of `max`.
///
/// Records outside `preferences` go first, oldest first; preferred records
/// are only taken once nothing else is left.
pub fn eviction_plan(
    collected: &[TorrentRecord],
    preferences: &HashSet<InfoHash>,
    max: usize,
    ratio: f64,
) -> Vec<InfoHash> {
    if collected.len() <= max {
        return Vec::new();
    }
    let target = ((max as f64) * ratio).floor() as usize;
    let excess = collected.len().saturating_sub(target);

    let (preferred, others): (Vec<_>, Vec<_>) = collected
        .iter()
        .partition(|record| preferences.contains(&record.info_hash));

    others
        .into_iter()
        .chain(preferred)
        .take(excess)
        .map(|record| record.info_hash)
        .collect()
}

/// Collected `.torrent` files stored through the disk manager.
#[derive(Clone)]
pub struct CollectedTorrents {
    disk: Arc<DiskManager>,
    dir: PathBuf,
}

impl CollectedTorrents {
    /// Wraps `dir`, which must already be registered with `disk`.
    pub fn new(disk: Arc<DiskManager>, dir: PathBuf) -> Self {
        Self { disk, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// # Errors
    ///
    /// - `StorageError::DiskFull` - If the quota policy cannot make room
    /// - `StorageError::Io` - If the write fails
    pub async fn save(&self, info_hash: &InfoHash, torrent: &[u8]) -> Result<String, StorageError> {
        let file_name = collected_file_name(info_hash);
        self.disk.write(&self.dir, &file_name, torrent).await?;
        Ok(file_name)
    }

    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the file is gone
    pub async fn load(&self, file_name: &str) -> Result<Vec<u8>, StorageError> {
        self.disk.read(&self.dir, file_name).await
    }

    pub async fn exists(&self, file_name: &str) -> bool {
        tokio::fs::try_exists(self.dir.join(file_name))
            .await
            .unwrap_or(false)
    }

    /// # Errors
    ///
    /// - `StorageError::Io` - If removal fails
    pub async fn delete(&self, file_name: &str) -> Result<bool, StorageError> {
        self.disk.delete(&self.dir, file_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::catalog::{SOURCE_BUDDYCAST, SwarmStats};

    fn record(byte: u8) -> TorrentRecord {
        TorrentRecord {
            info_hash: InfoHash::new([byte; 20]),
            name: String::new(),
            file_name: None,
            source: SOURCE_BUDDYCAST.to_string(),
            stats: SwarmStats::default(),
            inserted_at: i64::from(byte),
            sources_seen: 1,
        }
    }

    #[test]
    fn test_collected_file_name() {
        let name = collected_file_name(&InfoHash::new([0; 20]));
        // sha1 of twenty zero bytes
        assert_eq!(name, "6768033e216468247bd031a0a2d9876d79818f8f.torrent");
    }

    #[test]
    fn test_no_eviction_under_cap() {
        let collected: Vec<_> = (0..10).map(record).collect();
        assert!(eviction_plan(&collected, &HashSet::new(), 10, 0.95).is_empty());
    }

    #[test]
    fn test_eviction_prefers_non_preferred_records() {
        let collected: Vec<_> = (0..21).map(record).collect();
        let preferences: HashSet<_> = [InfoHash::new([0; 20]), InfoHash::new([1; 20])]
            .into_iter()
            .collect();

        // Cap 20 at 95% leaves 19 records
        let plan = eviction_plan(&collected, &preferences, 20, 0.95);
        assert_eq!(plan, vec![InfoHash::new([2; 20]), InfoHash::new([3; 20])]);
    }

    #[test]
    fn test_eviction_falls_back_to_preferred() {
        let collected: Vec<_> = (0..3).map(record).collect();
        let preferences: HashSet<_> = collected.iter().map(|r| r.info_hash).collect();

        let plan = eviction_plan(&collected, &preferences, 2, 0.5);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], InfoHash::new([0; 20]));
    }
}
