//! Subtitle dissemination over the overlay.
//!
//! Channels publish signed metadata records listing subtitle languages and
//! checksums. Records ride on channelcast gossip, peers advertise which
//! languages they hold through have-masks, and subtitle bundles travel as
//! GET_SUBS / SUBS message pairs paced by a token bucket.

pub mod coalesce;
pub mod handler;
pub mod have;
pub mod interceptor;
pub mod languages;
pub mod messages;
pub mod peer_selector;
pub mod record;
pub mod signer;
pub mod store;
pub mod support;

pub use coalesce::CoalesceTable;
pub use handler::{SubtitleHandler, SubsDelivery};
pub use have::{HaveEntry, HaveMaskStore};
pub use interceptor::{RichMetadataInterceptor, Vote, VoteSource, VoteTable};
pub use messages::{GetSubsMessage, SubsMessage};
pub use peer_selector::select_peers;
pub use record::{MetadataRecord, SubtitleInfo, subtitle_checksum};
pub use signer::{Ed25519Signer, Ed25519Verifier, SignatureVerifier, Signer};
pub use store::{InsertOutcome, LocalSubtitles, MetadataStore, SubtitleDb};
pub use support::{SubtitleSupport, subtitle_file_name};

use crate::bencode::BencodeError;
use crate::overlay::OverlayError;
use crate::storage::StorageError;
use crate::torrent::InfoHash;

/// Largest subtitle file served or accepted, in bytes.
pub const MAX_SUBTITLE_SIZE: usize = 1024 * 1024;

/// Errors raised by subtitle handling.
///
/// Remote input errors drop the offending message only.
#[derive(Debug, thiserror::Error)]
pub enum SubtitleError {
    #[error("Bad encoding: {0}")]
    BadEncoding(#[from] BencodeError),

    #[error("Malformed subtitle message: {reason}")]
    Malformed { reason: String },

    #[error("Invalid infohash: expected 20 bytes, got {length}")]
    InvalidInfohash { length: usize },

    #[error("Invalid permid of {length} bytes")]
    InvalidPermid { length: usize },

    #[error("Invalid bitmask: expected 4 bytes, got {length}")]
    InvalidBitmask { length: usize },

    #[error("Unsupported language: {code}")]
    UnsupportedLanguage { code: String },

    /// Rich metadata signature did not verify against the channel key
    #[error("Invalid signature from channel {channel} for {info_hash}")]
    SignatureInvalid { channel: String, info_hash: InfoHash },

    /// Received subtitle does not hash to the published checksum
    #[error("Checksum mismatch for {lang} subtitle")]
    ChecksumMismatch { lang: String },

    #[error("Subtitle of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("No metadata for channel {channel} and torrent {info_hash}")]
    UnknownMetadata { channel: String, info_hash: InfoHash },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}
