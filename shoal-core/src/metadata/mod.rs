//! Torrent metadata exchange between overlay peers.
//!
//! Peers ask each other for `.torrent` files they heard about through
//! gossip. Answers are paced by an upload queue, arriving torrents are
//! validated against their declared infohash, stored in the collected
//! directory and inserted into the catalog.

pub mod catalog;
pub mod collected;
pub mod digest;
pub mod exchange;
pub mod messages;

pub use catalog::{MemoryCatalog, SwarmStats, TorrentCatalog, TorrentRecord, TorrentStatus};
pub use collected::{CollectedTorrents, collected_file_name};
pub use digest::{DigestEntry, RecentlyCollected};
pub use exchange::{MetadataExchange, UploadTask};
pub use messages::{MetadataMessage, MetadataPayload};

use crate::bencode::BencodeError;
use crate::overlay::OverlayError;
use crate::storage::StorageError;
use crate::torrent::{InfoHash, MetainfoError};

/// Errors raised while handling metadata messages.
///
/// All of them drop the offending message; none closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Bad encoding: {0}")]
    BadEncoding(#[from] BencodeError),

    #[error("Invalid infohash: expected 20 bytes, got {length}")]
    InvalidInfohash { length: usize },

    #[error("Malformed metadata message: {reason}")]
    Malformed { reason: String },

    #[error("Infohash mismatch: declared {declared}, computed {computed}")]
    InfohashMismatch {
        declared: InfoHash,
        computed: InfoHash,
    },

    #[error("Torrent of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid torrent: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}
