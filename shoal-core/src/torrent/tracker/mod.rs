//! BitTorrent tracker communication.
//!
//! HTTP tracker client following BEP 3 with announce/scrape operations, the
//! tiered announce loop built on top of it, and the latch that keeps one
//! result per announce cycle.

pub mod client;
pub mod key;
pub mod latch;
pub mod rerequester;
pub mod tiers;
pub mod types;

pub use client::HttpTrackerClient;
pub use key::TrackerKeys;
pub use latch::SuccessLatch;
pub use rerequester::{AnnounceCycle, AnnounceState, Rerequester, RerequesterDeps};
pub use tiers::TrackerTiers;
pub use types::{
    AnnounceEvent, AnnounceParams, AnnounceResponse, AnnounceSource, Peer, PeerSink, ScrapeStats,
    TransferStats,
};

use crate::network::FetchError;

/// Error categories cached per announce cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    Rejected,
    BadData,
    TroubleCode,
}

impl ErrorCategory {
    /// Reporting priority: a rejection beats bad data beats trouble.
    pub const PRIORITY: [ErrorCategory; 3] = [
        ErrorCategory::Rejected,
        ErrorCategory::BadData,
        ErrorCategory::TroubleCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Rejected => "rejected",
            ErrorCategory::BadData => "bad_data",
            ErrorCategory::TroubleCode => "troublecode",
        }
    }
}

/// Errors from tracker communication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Rejected by tracker - {reason}")]
    Rejected { reason: String },

    #[error("Bad data from tracker - {reason}")]
    BadData { reason: String },

    #[error("Problem connecting to tracker - {reason}")]
    Trouble { reason: String },

    #[error("Problem connecting to tracker - {0}")]
    Fetch(#[from] FetchError),

    #[error("Tracker {url} does not support scrape")]
    NoScrapeUrl { url: String },

    #[error("No supported tracker to contact")]
    NoTrackers,
}

impl TrackerError {
    /// Cache category this error is recorded under.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TrackerError::Rejected { .. } => ErrorCategory::Rejected,
            TrackerError::BadData { .. } => ErrorCategory::BadData,
            TrackerError::Trouble { .. }
            | TrackerError::Fetch(_)
            | TrackerError::NoScrapeUrl { .. }
            | TrackerError::NoTrackers => ErrorCategory::TroubleCode,
        }
    }
}
