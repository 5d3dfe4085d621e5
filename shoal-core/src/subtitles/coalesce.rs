//! Outstanding subtitle requests, coalesced per `(channel, infohash)`.
//!
//! Several local requesters may ask for overlapping language sets of the
//! same record. A response is split back across them: each requester gets
//! the languages it asked for that arrived, and keeps waiting for the rest.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::torrent::{InfoHash, Permid};

#[derive(Debug)]
struct PendingRequest<C> {
    /// Languages still awaited by this requester
    mask: u32,
    callback: C,
    requested_at: Instant,
}

#[derive(Debug)]
struct Entry<C> {
    /// Union of the pending masks
    cumulative: u32,
    requests: Vec<PendingRequest<C>>,
}

impl<C> Entry<C> {
    fn recompute(&mut self) {
        self.cumulative = self.requests.iter().fold(0, |mask, request| mask | request.mask);
    }
}

/// Request coalesce table; `C` identifies who to notify.
#[derive(Debug)]
pub struct CoalesceTable<C> {
    entries: HashMap<(Permid, InfoHash), Entry<C>>,
}

impl<C: Clone> CoalesceTable<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a request for the languages of `mask`.
    pub fn add(&mut self, channel: &Permid, info_hash: InfoHash, mask: u32, callback: C, now: Instant) {
        if mask == 0 {
            return;
        }
        let entry = self
            .entries
            .entry((channel.clone(), info_hash))
            .or_insert_with(|| Entry {
                cumulative: 0,
                requests: Vec::new(),
            });
        if entry.requests.iter().any(|request| request.mask == mask) {
            tracing::debug!(channel = %channel.short(), %info_hash, mask, "Duplicate subtitle request");
        }
        entry.cumulative |= mask;
        entry.requests.push(PendingRequest {
            mask,
            callback,
            requested_at: now,
        });
    }

    /// Languages currently awaited for the record.
    pub fn outstanding(&self, channel: &Permid, info_hash: &InfoHash) -> u32 {
        self.entries
            .get(&(channel.clone(), *info_hash))
            .map_or(0, |entry| entry.cumulative)
    }

    /// Splits the `received` languages across the pending requests.
    ///
    /// Returns each notified requester with the languages it gets back. Bits
    /// nobody asked for are ignored.
    pub fn on_response(&mut self, channel: &Permid, info_hash: &InfoHash, received: u32) -> Vec<(C, u32)> {
        let key = (channel.clone(), *info_hash);
        let Some(entry) = self.entries.get_mut(&key) else {
            return Vec::new();
        };

        let received = entry.cumulative & received;
        let mut notified = Vec::new();
        for request in &mut entry.requests {
            let delivered = request.mask & received;
            if delivered != 0 {
                notified.push((request.callback.clone(), delivered));
                request.mask &= !delivered;
            }
        }
        entry.requests.retain(|request| request.mask != 0);
        entry.cumulative &= !received;

        if entry.cumulative == 0 {
            self.entries.remove(&key);
        }
        notified
    }

    /// Drops requests older than `validity`. Returns how many were dropped.
    pub fn cleanup(&mut self, now: Instant, validity: Duration) -> usize {
        let mut dropped = 0;
        self.entries.retain(|_, entry| {
            let before = entry.requests.len();
            entry
                .requests
                .retain(|request| now.saturating_duration_since(request.requested_at) <= validity);
            if entry.requests.len() != before {
                dropped += before - entry.requests.len();
                entry.recompute();
            }
            entry.cumulative != 0
        });
        if dropped > 0 {
            tracing::debug!(dropped, "Expired subtitle requests");
        }
        dropped
    }

    /// Number of records with pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C: Clone> Default for CoalesceTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitles::languages::{bit, codes_of};

    fn key() -> (Permid, InfoHash) {
        (Permid::from_slice(&[1; 32]).unwrap(), InfoHash::new([2; 20]))
    }

    fn mask(codes: &[&str]) -> u32 {
        codes.iter().map(|code| bit(code).unwrap()).fold(0, |a, b| a | b)
    }

    #[test]
    fn test_overlapping_requests_split_response() {
        let (channel, ih) = key();
        let now = Instant::now();
        let mut table = CoalesceTable::new();
        table.add(&channel, ih, mask(&["eng", "ita"]), "first", now);
        table.add(&channel, ih, mask(&["ita", "nld"]), "second", now);

        assert_eq!(table.outstanding(&channel, &ih), mask(&["eng", "ita", "nld"]));

        let notified = table.on_response(&channel, &ih, mask(&["ita", "nld"]));
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0].0, "first");
        assert_eq!(codes_of(notified[0].1), vec!["ita"]);
        assert_eq!(notified[1].0, "second");
        assert_eq!(codes_of(notified[1].1), vec!["ita", "nld"]);

        assert_eq!(table.outstanding(&channel, &ih), mask(&["eng"]));
        assert_eq!(table.entries[&key()].requests.len(), 1);
        assert_eq!(table.entries[&key()].requests[0].callback, "first");
    }

    #[test]
    fn test_unrequested_languages_are_ignored() {
        let (channel, ih) = key();
        let mut table = CoalesceTable::new();
        table.add(&channel, ih, mask(&["eng"]), 1, Instant::now());

        assert!(table.on_response(&channel, &ih, mask(&["rus"])).is_empty());
        assert_eq!(table.outstanding(&channel, &ih), mask(&["eng"]));

        let notified = table.on_response(&channel, &ih, mask(&["eng", "rus"]));
        assert_eq!(notified, vec![(1, mask(&["eng"]))]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_response_for_unknown_record() {
        let (channel, _) = key();
        let mut table: CoalesceTable<u8> = CoalesceTable::new();
        assert!(table.on_response(&channel, &InfoHash::new([9; 20]), u32::MAX).is_empty());
    }

    #[test]
    fn test_cleanup_drops_expired_and_recomputes() {
        let (channel, ih) = key();
        let start = Instant::now();
        let mut table = CoalesceTable::new();
        table.add(&channel, ih, mask(&["eng"]), "old", start);
        table.add(&channel, ih, mask(&["ita"]), "new", start + Duration::from_secs(400));

        let validity = Duration::from_secs(600);
        assert_eq!(table.cleanup(start + Duration::from_secs(601), validity), 1);
        assert_eq!(table.outstanding(&channel, &ih), mask(&["ita"]));

        assert_eq!(table.cleanup(start + Duration::from_secs(1001), validity), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_empty_mask_is_not_recorded() {
        let (channel, ih) = key();
        let mut table = CoalesceTable::new();
        table.add(&channel, ih, 0, (), Instant::now());
        assert!(table.is_empty());
    }
}
