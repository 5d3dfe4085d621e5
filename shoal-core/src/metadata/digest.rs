//! Recently-collected torrents announced on overlay gossip.

use std::collections::VecDeque;

use serde::Serialize;

use super::catalog::TorrentCatalog;
use crate::bencode::Value;
use crate::overlay::OLPROTO_VER_ELEVENTH;
use crate::torrent::InfoHash;

/// Bounded most-recent-first ring of collected infohashes.
#[derive(Debug, Clone)]
pub struct RecentlyCollected {
    ring: VecDeque<InfoHash>,
    capacity: usize,
}

/// Swarm figures attached to digest entries for newer peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigestStats {
    pub seeders: i64,
    pub leechers: i64,
    /// Unix time the digest was built
    pub now: i64,
    pub sources_seen: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigestEntry {
    pub info_hash: InfoHash,
    pub stats: Option<DigestStats>,
}

impl DigestEntry {
    pub fn to_value(&self) -> Value {
        let info_hash = Value::bytes(self.info_hash.as_bytes());
        match &self.stats {
            Some(stats) => Value::List(vec![
                info_hash,
                Value::Integer(stats.seeders),
                Value::Integer(stats.leechers),
                Value::Integer(stats.now),
                Value::Integer(i64::from(stats.sources_seen)),
            ]),
            None => info_hash,
        }
    }
}

impl RecentlyCollected {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Moves `info_hash` to the head, dropping the tail beyond capacity.
    pub fn push_front(&mut self, info_hash: InfoHash) {
        self.ring.retain(|existing| *existing != info_hash);
        self.ring.push_front(info_hash);
        self.ring.truncate(self.capacity);
    }

    pub fn remove(&mut self, info_hash: &InfoHash) {
        self.ring.retain(|existing| existing != info_hash);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InfoHash> {
        self.ring.iter()
    }

    /// Up to `limit` most recent entries for a peer speaking `selversion`.
    pub fn digest(
        &self,
        limit: usize,
        selversion: u32,
        catalog: &dyn TorrentCatalog,
        now: i64,
    ) -> Vec<DigestEntry> {
        self.ring
            .iter()
            .take(limit)
            .map(|info_hash| {
                let stats = (selversion >= OLPROTO_VER_ELEVENTH).then(|| {
                    let record = catalog.get(info_hash);
                    DigestStats {
                        seeders: record.as_ref().map_or(-1, |r| r.stats.seeders),
                        leechers: record.as_ref().map_or(-1, |r| r.stats.leechers),
                        now,
                        sources_seen: record.map_or(1, |r| r.sources_seen),
                    }
                });
                DigestEntry {
                    info_hash: *info_hash,
                    stats,
                }
            })
            .collect()
    }
}
