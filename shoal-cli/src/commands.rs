//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use serde::Serialize;
use shoal_core::config::ShoalConfig;
use shoal_core::events::EventBus;
use shoal_core::network::HttpFetcher;
use shoal_core::subtitles::{MetadataStore, SubtitleDb, languages};
use shoal_core::torrent::p2p_url;
use shoal_core::torrent::tracker::{
    AnnounceCycle, AnnounceEvent, AnnounceSource, Peer, PeerSink, Rerequester, RerequesterDeps,
    TrackerTiers, TransferStats,
};
use shoal_core::torrent::{FileLayout, Metainfo, PeerId};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate a torrent file and print its summary
    Inspect {
        /// Path to a .torrent file or a p2p:// URL
        torrent: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Announce once to the torrent's trackers and print the peers
    Announce {
        /// Path to the torrent file
        torrent: PathBuf,
        /// Event to report
        #[arg(long, value_enum, default_value_t = EventArg::Started)]
        event: EventArg,
    },
    /// Scrape swarm statistics from the first supported tracker
    Scrape {
        /// Path to the torrent file
        torrent: PathBuf,
    },
    /// Subtitle database queries
    Subtitles {
        #[command(subcommand)]
        command: SubtitleCommands,
    },
    /// List the languages subtitles can be exchanged in
    Languages,
}

#[derive(Subcommand)]
pub enum SubtitleCommands {
    /// List subtitles known to the local database, by channel and torrent
    List {
        /// Database file; defaults to the configured path
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventArg {
    Started,
    Completed,
    Stopped,
    Query,
}

impl From<EventArg> for AnnounceEvent {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::Started => AnnounceEvent::Started,
            EventArg::Completed => AnnounceEvent::Completed,
            EventArg::Stopped => AnnounceEvent::Stopped,
            EventArg::Query => AnnounceEvent::Query,
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed, with context
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { torrent, json } => inspect(&torrent, json).await,
        Commands::Announce { torrent, event } => announce(&torrent, event.into()).await,
        Commands::Scrape { torrent } => scrape(&torrent).await,
        Commands::Subtitles {
            command: SubtitleCommands::List { database },
        } => list_subtitles(database),
        Commands::Languages => {
            list_languages();
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct TorrentSummary {
    name: String,
    info_hash: String,
    total_length: u64,
    piece_length: u64,
    pieces: usize,
    files: Vec<(String, u64)>,
    trackers: Vec<Vec<String>>,
    private: bool,
    p2p_url: Option<String>,
}

async fn load_metainfo(source: &str) -> anyhow::Result<Metainfo> {
    if source.contains("://") {
        return p2p_url::materialize(source).with_context(|| format!("invalid P2P URL {source}"));
    }
    let bytes = tokio::fs::read(source)
        .await
        .with_context(|| format!("cannot read {source}"))?;
    Metainfo::from_bytes(&bytes).with_context(|| format!("invalid torrent file {source}"))
}

/// Print the summary of a torrent
///
/// # Errors
/// - File cannot be read or fails validation
pub async fn inspect(source: &str, json: bool) -> anyhow::Result<()> {
    let metainfo = load_metainfo(source).await?;
    let files = match metainfo.layout() {
        FileLayout::Single { length } => vec![(metainfo.name().to_string(), *length)],
        FileLayout::Multi { files } => files
            .iter()
            .map(|file| (file.relative_path().display().to_string(), file.length))
            .collect(),
    };
    let summary = TorrentSummary {
        name: metainfo.name().to_string(),
        info_hash: metainfo.info_hash().to_string(),
        total_length: metainfo.total_length(),
        piece_length: metainfo.piece_length(),
        pieces: metainfo.pieces().len(),
        files,
        trackers: metainfo.tracker_tiers(),
        private: metainfo.is_private(),
        p2p_url: p2p_url::to_p2p_url(&metainfo),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Name:         {}", summary.name);
    println!("Info hash:    {}", summary.info_hash);
    println!("Size:         {} bytes", summary.total_length);
    println!("Pieces:       {} x {} bytes", summary.pieces, summary.piece_length);
    println!("Private:      {}", summary.private);
    for (tier, trackers) in summary.trackers.iter().enumerate() {
        println!("Tier {tier}:       {}", trackers.join(", "));
    }
    for (path, length) in &summary.files {
        println!("  {path} ({length} bytes)");
    }
    if let Some(url) = summary.p2p_url {
        println!("P2P URL:      {url}");
    }
    Ok(())
}

/// A fresh download: nothing transferred, everything left.
struct FreshDownload {
    left: u64,
}

impl AnnounceSource for FreshDownload {
    fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            uploaded: 0,
            downloaded: 0,
            left: self.left,
        }
    }

    fn known_peers(&self) -> usize {
        0
    }

    fn is_paused(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct CollectPeers {
    peers: Mutex<Vec<Peer>>,
}

impl PeerSink for CollectPeers {
    fn connect(&self, peers: Vec<Peer>) {
        if let Ok(mut known) = self.peers.lock() {
            known.extend(peers);
        }
    }
}

fn rerequester_for(metainfo: &Metainfo, sink: Arc<CollectPeers>) -> anyhow::Result<Rerequester> {
    let config = ShoalConfig::from_env();
    let fetch = Arc::new(HttpFetcher::new(&config.http)?);
    let tiers = TrackerTiers::new(metainfo.tracker_tiers());
    anyhow::ensure!(!tiers.is_empty(), "torrent lists no trackers");

    let deps = RerequesterDeps {
        fetch,
        source: Arc::new(FreshDownload {
            left: metainfo.total_length(),
        }),
        sink,
        events: EventBus::new(),
    };
    Ok(Rerequester::new(
        metainfo.info_hash(),
        PeerId::generate(config.tracker.client_prefix),
        tiers,
        config.tracker,
        deps,
    ))
}

/// Announce once and list the returned peers
///
/// # Errors
/// - Torrent cannot be loaded, has no trackers, or every tracker failed
pub async fn announce(path: &Path, event: AnnounceEvent) -> anyhow::Result<()> {
    let metainfo = load_metainfo(&path.to_string_lossy()).await?;
    let sink = Arc::new(CollectPeers::default());
    let rerequester = rerequester_for(&metainfo, sink.clone())?;

    match rerequester.announce(event).await {
        AnnounceCycle::Success {
            tracker,
            peers,
            warning,
        } => {
            println!("Announced to {tracker}: {peers} peers");
            if let Some(warning) = warning {
                println!("Tracker warning: {warning}");
            }
        }
        AnnounceCycle::Failed { reason } => anyhow::bail!(reason),
        AnnounceCycle::Skipped => println!("Announce skipped"),
    }

    if let Ok(peers) = sink.peers.lock() {
        for peer in peers.iter() {
            println!("  {}", peer.addr);
        }
    }
    Ok(())
}

/// Print seeders, leechers and completed downloads
///
/// # Errors
/// - Torrent cannot be loaded or the tracker cannot be scraped
pub async fn scrape(path: &Path) -> anyhow::Result<()> {
    let metainfo = load_metainfo(&path.to_string_lossy()).await?;
    let rerequester = rerequester_for(&metainfo, Arc::new(CollectPeers::default()))?;

    let stats = rerequester.scrape().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Print the local subtitle inventory as JSON
///
/// # Errors
/// - Database cannot be opened or read
pub fn list_subtitles(database: Option<PathBuf>) -> anyhow::Result<()> {
    let path = database.unwrap_or_else(|| ShoalConfig::from_env().subtitles.database_path);
    let db = SubtitleDb::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
    let store = MetadataStore::new(db, EventBus::new());

    let subtitles = store.list_local_subtitles()?;
    println!("{}", serde_json::to_string_pretty(&subtitles)?);
    Ok(())
}

/// Print the language table in bit order
pub fn list_languages() {
    for (bit, (code, name)) in languages::LANGUAGES.iter().enumerate() {
        println!("{bit:>2}  {code}  {name}");
    }
}
