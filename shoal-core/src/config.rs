//! Centralized configuration for Shoal.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::{DirectoryConfig, Encoding, QuotaPolicy};

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub tracker: TrackerConfig,
    pub http: HttpConfig,
    pub metadata: MetadataConfig,
    pub subtitles: SubtitlesConfig,
    pub disk: DiskConfig,
    pub urm: UrmConfig,
    pub overlay: OverlayConfig,
}

/// Tracker announce behaviour.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Azureus-style prefix of the generated peer id
    pub client_prefix: &'static str,
    /// Listen port reported to trackers
    pub port: u16,
    /// Optional address reported as `ip`; hostnames are resolved to an A record
    pub ip: Option<String>,
    /// Per-tracker request timeout
    pub timeout: Duration,
    /// Base interval of the short check timer, which fires every `interval / 2`
    pub rerequest_interval: Duration,
    /// Regular announce interval until a tracker says otherwise
    pub announce_interval: Duration,
    /// Retry interval while no tracker has ever answered
    pub retry_interval: Duration,
    /// Below this many known peers a paused torrent announces early
    pub min_peers: usize,
    /// At or above this many known peers `numwant=0` is requested
    pub max_peers: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            client_prefix: "-SH0100-",
            port: 6881,
            ip: None,
            timeout: Duration::from_secs(15),
            rerequest_interval: Duration::from_secs(300),
            announce_interval: Duration::from_secs(1800), // 30 minutes
            retry_interval: Duration::from_secs(60),
            min_peers: 20,
            max_peers: 50,
        }
    }
}

/// HTTP fetcher limits.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Socket timeout for a single request
    pub timeout: Duration,
    /// Total requests allowed for one fetch, redirects included
    pub max_requests: usize,
    /// Largest response body accepted
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("shoal/", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_requests: 10,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Metadata exchange and collected-torrent cache.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Directory holding collected `.torrent` files
    pub collected_dir: PathBuf,
    /// Upload rate for METADATA replies in KiB/s; zero disables uploads
    pub upload_rate_kib: u32,
    /// Upload queue check period
    pub upload_tick: Duration,
    /// Torrents larger than this are never sent or accepted
    pub max_torrent_size: usize,
    /// Maximum number of collected torrents before eviction
    pub max_collected_torrents: usize,
    /// Fraction of the maximum kept after an eviction pass
    pub eviction_ratio: f64,
    /// Capacity of the recently-collected ring
    pub recent_ring_size: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            collected_dir: PathBuf::from("collected_torrents"),
            upload_rate_kib: 50,
            upload_tick: Duration::from_secs(1),
            max_torrent_size: 2 * 1024 * 1024, // 2 MiB
            max_collected_torrents: 5000,
            eviction_ratio: 0.95,
            recent_ring_size: 50,
        }
    }
}

/// Subtitle exchange limits and timers.
#[derive(Debug, Clone)]
pub struct SubtitlesConfig {
    /// Directory holding received and published subtitle files
    pub subs_dir: PathBuf,
    /// SQLite database file for rich metadata and have masks
    pub database_path: PathBuf,
    /// Largest single subtitle accepted or served
    pub max_subtitle_size: usize,
    /// Token bucket fill rate for SUBS uploads in KiB/s
    pub upload_rate_kib: u32,
    /// Token bucket capacity; larger SUBS messages are dropped
    pub max_subs_message_size_kib: u32,
    /// Outstanding requests expire after this long
    pub request_validity: Duration,
    /// Coalesce table cleanup period
    pub cleanup_period: Duration,
    /// Have masks older than this are removed, except the publisher's
    pub have_ttl: Duration,
    /// Have-mask cleanup period
    pub have_cleanup_interval: Duration,
    /// Upper bound on have entries returned per torrent
    pub max_have_entries: usize,
    /// Upper bound on peers asked for one subtitle request
    pub max_peers_per_request: usize,
}

impl Default for SubtitlesConfig {
    fn default() -> Self {
        Self {
            subs_dir: PathBuf::from("subtitles"),
            database_path: PathBuf::from("shoal.db"),
            max_subtitle_size: 1024 * 1024, // 1 MiB
            upload_rate_kib: 1024,
            max_subs_message_size_kib: 2048,
            request_validity: Duration::from_secs(600),
            cleanup_period: Duration::from_secs(300),
            have_ttl: Duration::from_secs(7 * 24 * 3600),
            have_cleanup_interval: Duration::from_secs(6 * 3600),
            max_have_entries: 200,
            max_peers_per_request: 5,
        }
    }
}

/// Disk quota configuration.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Host free space never consumed, in KiB
    pub min_free_space_kib: u64,
    /// Quota of the collected-torrent directory
    pub torrents: DirectoryConfig,
    /// Quota of the subtitle directory
    pub subtitles: DirectoryConfig,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_space_kib: 256 * 1024, // 256 MiB
            torrents: DirectoryConfig {
                max_kib: 500 * 1024,
                policy: QuotaPolicy::DeleteOldest,
                encoding: Encoding::Raw,
            },
            subtitles: DirectoryConfig {
                max_kib: 200 * 1024,
                policy: QuotaPolicy::DeleteOldest,
                encoding: Encoding::Utf8,
            },
        }
    }
}

/// Upload-rate maximizer.
#[derive(Debug, Clone)]
pub struct UrmConfig {
    pub enabled: bool,
    /// Aggregate upload target in KiB/s
    pub max_upload_rate_kib: u32,
    /// Time spent under or over the target before acting
    pub hysteresis: Duration,
    /// Floor of any per-torrent reservation in KiB/s
    pub min_rate_kib: u32,
    /// Take bandwidth from URM-started torrents before raising local ones
    pub prioritize_local: bool,
    /// Control loop period
    pub tick: Duration,
}

impl Default for UrmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_upload_rate_kib: 100,
            hysteresis: Duration::from_secs(5),
            min_rate_kib: 3,
            prioritize_local: true,
            tick: Duration::from_secs(1),
        }
    }
}

/// Overlay reactor configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Overlay protocol version spoken by this node
    pub protocol_version: u32,
    /// Capacity of the reactor command queue
    pub command_buffer: usize,
    /// Bound on shutdown draining
    pub shutdown_grace: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            protocol_version: crate::overlay::OLPROTO_VER_CURRENT,
            command_buffer: 256,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("SHOAL_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.tracker.timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max_peers) = std::env::var("SHOAL_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.tracker.max_peers = count;
            }
        }

        if let Ok(rate) = std::env::var("SHOAL_METADATA_UPLOAD_RATE") {
            if let Ok(kib) = rate.parse::<u32>() {
                config.metadata.upload_rate_kib = kib;
            }
        }

        if let Ok(rate) = std::env::var("SHOAL_SUBS_UPLOAD_RATE") {
            if let Ok(kib) = rate.parse::<u32>() {
                config.subtitles.upload_rate_kib = kib;
            }
        }

        if let Ok(max) = std::env::var("SHOAL_MAX_COLLECTED_TORRENTS") {
            if let Ok(count) = max.parse::<usize>() {
                config.metadata.max_collected_torrents = count;
            }
        }

        if let Ok(reserve) = std::env::var("SHOAL_MIN_FREE_SPACE_KIB") {
            if let Ok(kib) = reserve.parse::<u64>() {
                config.disk.min_free_space_kib = kib;
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts, no host free-space reserve, and all directories
    /// placed under `root`.
    pub fn for_testing(root: &std::path::Path) -> Self {
        let mut config = Self::default();
        config.tracker.timeout = Duration::from_millis(500);
        config.http.timeout = Duration::from_secs(2);
        config.metadata.collected_dir = root.join("collected_torrents");
        config.subtitles.subs_dir = root.join("subtitles");
        config.subtitles.database_path = root.join("shoal.db");
        config.disk.min_free_space_kib = 0;
        config
    }
}
