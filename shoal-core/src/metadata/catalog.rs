//! Torrent catalog seen by the metadata exchange.
//!
//! The persistent catalog lives outside this crate; the exchange only needs
//! lookups, inserts, removals and swarm statistics.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;

use crate::torrent::InfoHash;

/// Source tag of torrents collected from overlay peers.
pub const SOURCE_BUDDYCAST: &str = "BC";

/// Liveness of a torrent as last checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TorrentStatus {
    Good,
    #[default]
    Unknown,
    Dead,
}

impl TorrentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TorrentStatus::Good => "good",
            TorrentStatus::Unknown => "unknown",
            TorrentStatus::Dead => "dead",
        }
    }

    pub fn parse(status: &str) -> Self {
        match status {
            "good" => TorrentStatus::Good,
            "dead" => TorrentStatus::Dead,
            _ => TorrentStatus::Unknown,
        }
    }
}

/// Swarm statistics reported alongside metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SwarmStats {
    pub seeders: i64,
    pub leechers: i64,
    /// Unix time of the last tracker check
    pub last_check: i64,
    pub status: TorrentStatus,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentRecord {
    pub info_hash: InfoHash,
    pub name: String,
    /// File name inside the collected-torrent directory
    pub file_name: Option<String>,
    pub source: String,
    pub stats: SwarmStats,
    /// Unix time the record was inserted
    pub inserted_at: i64,
    /// Distinct peers this torrent was heard from
    pub sources_seen: u32,
}

impl TorrentRecord {
    pub fn is_dead(&self) -> bool {
        self.stats.status == TorrentStatus::Dead
    }

    pub fn is_collected(&self) -> bool {
        self.source == SOURCE_BUDDYCAST
    }
}

/// Torrent catalog operations used by the exchange.
pub trait TorrentCatalog: Send + Sync {
    fn get(&self, info_hash: &InfoHash) -> Option<TorrentRecord>;

    fn contains(&self, info_hash: &InfoHash) -> bool {
        self.get(info_hash).is_some()
    }

    /// Inserts or replaces the record for `record.info_hash`.
    fn insert(&self, record: TorrentRecord);

    fn remove(&self, info_hash: &InfoHash) -> Option<TorrentRecord>;

    /// Records collected from peers, oldest first.
    fn collected(&self) -> Vec<TorrentRecord>;

    fn collected_count(&self) -> usize {
        self.collected().len()
    }

    /// Torrents the user downloaded or otherwise chose to keep.
    fn preferences(&self) -> HashSet<InfoHash>;

    fn swarm_stats(&self, info_hash: &InfoHash) -> Option<SwarmStats> {
        self.get(info_hash).map(|record| record.stats)
    }
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<HashMap<InfoHash, TorrentRecord>>,
    preferences: RwLock<HashSet<InfoHash>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_preference(&self, info_hash: InfoHash) {
        self.preferences.write().insert(info_hash);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl TorrentCatalog for MemoryCatalog {
    fn get(&self, info_hash: &InfoHash) -> Option<TorrentRecord> {
        self.records.read().get(info_hash).cloned()
    }

    fn insert(&self, record: TorrentRecord) {
        self.records.write().insert(record.info_hash, record);
    }

    fn remove(&self, info_hash: &InfoHash) -> Option<TorrentRecord> {
        self.records.write().remove(info_hash)
    }

    fn collected(&self) -> Vec<TorrentRecord> {
        let mut collected: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|record| record.is_collected())
            .cloned()
            .collect();
        collected.sort_by_key(|record| (record.inserted_at, record.info_hash));
        collected
    }

    fn preferences(&self) -> HashSet<InfoHash> {
        self.preferences.read().clone()
    }
}
