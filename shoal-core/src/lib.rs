//! Shoal Core - tracker interaction and overlay metadata dissemination
//!
//! This crate provides the building blocks of a BitTorrent client extended
//! with an overlay network: tracker announce/scrape, peer-to-peer torrent
//! file exchange, signed subtitle metadata with availability masks, paced
//! subtitle transfer, quota-managed storage and upload-rate arbitration.

pub mod bencode;
pub mod config;
pub mod events;
pub mod metadata;
pub mod network;
pub mod overlay;
pub mod storage;
pub mod subtitles;
pub mod torrent;
pub mod tracing_setup;
pub mod urm;

// Re-export main types for convenient access
pub use bencode::BencodeError;
pub use config::ShoalConfig;
pub use events::{CoreEvent, EventBus};
pub use metadata::MetadataError;
pub use network::FetchError;
pub use overlay::{OverlayError, OverlayHandle};
pub use storage::StorageError;
pub use subtitles::SubtitleError;
pub use torrent::{InfoHash, MetainfoError, Permid, TorrentError, TrackerError};

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("Metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("HTTP error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Subtitle error: {0}")]
    Subtitle(#[from] SubtitleError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`ShoalError`] used for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadEncoding,
    InvalidInfohash,
    SignatureInvalid,
    DiskFull,
    TrackerRejected,
    TrackerBadData,
    TrackerTrouble,
    RedirectRecursion,
    HttpStatus,
    CorruptResponse,
    ChecksumMismatch,
    /// Reserved; duplicate subtitle requests are coalesced and only logged
    DuplicateRequest,
    Other,
}

impl ShoalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShoalError::Bencode(_)
            | ShoalError::Metainfo(MetainfoError::Encoding(_))
            | ShoalError::Metadata(MetadataError::BadEncoding(_))
            | ShoalError::Subtitle(SubtitleError::BadEncoding(_))
            | ShoalError::Overlay(OverlayError::BadEncoding(_)) => ErrorKind::BadEncoding,

            ShoalError::Torrent(TorrentError::InvalidInfohash { .. })
            | ShoalError::Metadata(MetadataError::InvalidInfohash { .. })
            | ShoalError::Metadata(MetadataError::InfohashMismatch { .. })
            | ShoalError::Subtitle(SubtitleError::InvalidInfohash { .. }) => ErrorKind::InvalidInfohash,

            ShoalError::Subtitle(SubtitleError::SignatureInvalid { .. }) => ErrorKind::SignatureInvalid,
            ShoalError::Subtitle(SubtitleError::ChecksumMismatch { .. }) => ErrorKind::ChecksumMismatch,

            ShoalError::Storage(StorageError::DiskFull { .. })
            | ShoalError::Metadata(MetadataError::Storage(StorageError::DiskFull { .. }))
            | ShoalError::Subtitle(SubtitleError::Storage(StorageError::DiskFull { .. })) => {
                ErrorKind::DiskFull
            }

            ShoalError::Fetch(error) | ShoalError::Tracker(TrackerError::Fetch(error)) => {
                fetch_kind(error)
            }
            ShoalError::Tracker(TrackerError::Rejected { .. }) => ErrorKind::TrackerRejected,
            ShoalError::Tracker(TrackerError::BadData { .. }) => ErrorKind::TrackerBadData,
            ShoalError::Tracker(_) => ErrorKind::TrackerTrouble,

            _ => ErrorKind::Other,
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Metainfo(_)
                | ShoalError::Subtitle(SubtitleError::UnsupportedLanguage { .. })
                | ShoalError::Subtitle(SubtitleError::TooLarge { .. })
        )
    }
}

fn fetch_kind(error: &FetchError) -> ErrorKind {
    match error {
        FetchError::RedirectRecursion { .. } => ErrorKind::RedirectRecursion,
        FetchError::HttpStatus { .. } => ErrorKind::HttpStatus,
        FetchError::CorruptResponse { .. } => ErrorKind::CorruptResponse,
        _ => ErrorKind::TrackerTrouble,
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
