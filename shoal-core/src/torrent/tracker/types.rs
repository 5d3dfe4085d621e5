//! Core types for BitTorrent tracker communication

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use crate::torrent::{InfoHash, PeerId};

/// Announce events.
///
/// `Query` is a plain re-announce that reports no state transition; it
/// carries no `event` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client completed downloading this torrent
    Completed,
    /// Client stopped this torrent; suppresses further periodic announces
    Stopped,
    /// Periodic or emergency announce without an event
    Query,
}

impl AnnounceEvent {
    /// Numeric event code: 0 started, 1 completed, 2 stopped, 3 query.
    pub fn code(self) -> u8 {
        match self {
            AnnounceEvent::Started => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Stopped => 2,
            AnnounceEvent::Query => 3,
        }
    }

    /// Value of the `event` query parameter, if any.
    pub fn as_param(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Query => None,
        }
    }
}

/// Peer returned by a tracker.
///
/// Compact replies carry no peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
}

/// Everything needed to build one announce URL.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    /// Opaque `last` value echoed from the previous reply
    pub last: Option<String>,
    pub tracker_id: Option<String>,
    /// False when enough peers are known; requests `numwant=0`
    pub want_peers: bool,
    /// Externally visible address, already resolved
    pub ip: Option<String>,
    pub key: String,
}

/// Decoded announce reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: Option<Duration>,
    /// Minimum allowed interval between announces
    pub min_interval: Option<Duration>,
    /// Tracker-specific identifier for subsequent requests
    pub tracker_id: Option<String>,
    /// Value to echo as `last` on the next announce
    pub last: Option<String>,
    /// Swarm size as reported by the tracker
    pub num_peers: Option<u64>,
    /// Seeders as reported by the tracker
    pub done_peers: Option<u64>,
    /// List of peers for connection attempts
    pub peers: Vec<Peer>,
    /// Non-fatal message from the tracker
    pub warning: Option<String>,
}

/// Swarm statistics from a scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeStats {
    /// Number of seeders (peers with complete file)
    pub complete: u64,
    /// Total number of completed downloads
    pub downloaded: u64,
    /// Number of leechers (peers downloading)
    pub incomplete: u64,
}

/// Counters reported in announces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Download-engine view the rerequester reports from.
pub trait AnnounceSource: Send + Sync {
    fn transfer_stats(&self) -> TransferStats;

    /// Peers currently known to the download engine.
    fn known_peers(&self) -> usize;

    /// Whether downloading is paused.
    fn is_paused(&self) -> bool;
}

/// Receives peers harvested from trackers.
pub trait PeerSink: Send + Sync {
    fn connect(&self, peers: Vec<Peer>);
}
