//! GET_METADATA / METADATA handling with a paced upload queue.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::MetadataError;
use super::catalog::{SOURCE_BUDDYCAST, TorrentCatalog, TorrentRecord};
use super::collected::{CollectedTorrents, eviction_plan};
use super::digest::{DigestEntry, RecentlyCollected};
use super::messages::{MetadataMessage, MetadataPayload, decode_get_metadata, encode_get_metadata};
use crate::config::MetadataConfig;
use crate::events::{Activity, CoreEvent, EventBus};
use crate::overlay::{OLPROTO_VER_ELEVENTH, OverlaySender, unix_now};
use crate::storage::StorageError;
use crate::torrent::p2p_url::{materialize, to_p2p_url};
use crate::torrent::{InfoHash, Metainfo, Permid};

/// A torrent file waiting to be sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub peer: Permid,
    pub info_hash: InfoHash,
    pub file_name: String,
    pub selversion: u32,
}

/// Metadata exchange state. Owned by the overlay reactor.
pub struct MetadataExchange {
    config: MetadataConfig,
    catalog: Arc<dyn TorrentCatalog>,
    collected: CollectedTorrents,
    sender: Arc<dyn OverlaySender>,
    events: EventBus,
    upload_queue: VecDeque<UploadTask>,
    next_upload_time: Instant,
    requested: HashSet<InfoHash>,
    recent: RecentlyCollected,
    disk_full: bool,
}

impl MetadataExchange {
    pub fn new(
        config: MetadataConfig,
        catalog: Arc<dyn TorrentCatalog>,
        collected: CollectedTorrents,
        sender: Arc<dyn OverlaySender>,
        events: EventBus,
    ) -> Self {
        let recent = RecentlyCollected::new(config.recent_ring_size);
        Self {
            config,
            catalog,
            collected,
            sender,
            events,
            upload_queue: VecDeque::new(),
            next_upload_time: Instant::now(),
            requested: HashSet::new(),
            recent,
            disk_full: false,
        }
    }

    pub fn uploads_enabled(&self) -> bool {
        self.config.upload_rate_kib > 0
    }

    pub fn queue_len(&self) -> usize {
        self.upload_queue.len()
    }

    pub fn is_requested(&self, info_hash: &InfoHash) -> bool {
        self.requested.contains(info_hash)
    }

    pub fn recent(&self) -> &RecentlyCollected {
        &self.recent
    }

    /// Asks `peer` for the torrent file of `info_hash`.
    ///
    /// Returns false without sending when the torrent is already collected.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Overlay` - If the request cannot be sent
    pub fn request_torrent(&mut self, peer: &Permid, info_hash: InfoHash) -> Result<bool, MetadataError> {
        if self.has_torrent_file(&info_hash) {
            return Ok(false);
        }
        self.sender.send(peer, encode_get_metadata(&info_hash))?;
        self.requested.insert(info_hash);
        tracing::debug!(peer = %peer.short(), %info_hash, "Requested torrent metadata");
        Ok(true)
    }

    /// Handles a GET_METADATA body; returns whether an upload was queued.
    ///
    /// Requests for unknown, dead or file-less torrents are ignored.
    ///
    /// # Errors
    ///
    /// - `MetadataError::BadEncoding` - If the body is not bencode
    /// - `MetadataError::InvalidInfohash` - If the infohash is not 20 bytes
    pub async fn handle_get_metadata(
        &mut self,
        peer: &Permid,
        body: &[u8],
        selversion: u32,
    ) -> Result<bool, MetadataError> {
        let info_hash = decode_get_metadata(body)?;
        if !self.uploads_enabled() {
            return Ok(false);
        }

        let Some(record) = self.catalog.get(&info_hash) else {
            return Ok(false);
        };
        if record.is_dead() {
            return Ok(false);
        }
        let Some(file_name) = record.file_name else {
            return Ok(false);
        };
        if !self.collected.exists(&file_name).await {
            tracing::debug!(%info_hash, file_name, "Requested torrent file is missing");
            return Ok(false);
        }

        self.upload_queue.push_back(UploadTask {
            peer: peer.clone(),
            info_hash,
            file_name,
            selversion,
        });
        Ok(true)
    }

    /// Sends at most one queued torrent if the pacing window has opened.
    ///
    /// Returns the infohash sent, if any. Private and oversized torrents are
    /// skipped without consuming the window.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Overlay` - If the send fails
    pub async fn tick(&mut self, now: Instant) -> Result<Option<InfoHash>, MetadataError> {
        if !self.uploads_enabled() || now < self.next_upload_time {
            return Ok(None);
        }

        while let Some(task) = self.upload_queue.pop_front() {
            let Some(message) = self.prepare_upload(&task).await else {
                continue;
            };

            let encoded = message.encode();
            let size = encoded.len() as u64;
            self.sender.send(&task.peer, encoded)?;

            let rate = u64::from(self.config.upload_rate_kib) * 1024;
            self.next_upload_time = now + Duration::from_secs(size.div_ceil(rate) + 1);
            tracing::debug!(
                peer = %task.peer.short(),
                info_hash = %task.info_hash,
                size,
                "Uploaded torrent metadata"
            );
            return Ok(Some(task.info_hash));
        }
        Ok(None)
    }

    async fn prepare_upload(&self, task: &UploadTask) -> Option<MetadataMessage> {
        let torrent = match self.collected.load(&task.file_name).await {
            Ok(torrent) => torrent,
            Err(error) => {
                tracing::debug!(info_hash = %task.info_hash, %error, "Cannot read torrent for upload");
                return None;
            }
        };
        if torrent.len() > self.config.max_torrent_size {
            tracing::debug!(info_hash = %task.info_hash, size = torrent.len(), "Torrent too large to upload");
            return None;
        }
        let metainfo = match Metainfo::from_bytes(&torrent) {
            Ok(metainfo) => metainfo,
            Err(error) => {
                tracing::debug!(info_hash = %task.info_hash, %error, "Stored torrent is invalid");
                return None;
            }
        };
        if metainfo.is_private() {
            tracing::debug!(info_hash = %task.info_hash, "Not uploading private torrent");
            return None;
        }

        let modern = task.selversion >= OLPROTO_VER_ELEVENTH;
        let payload = match to_p2p_url(&metainfo).filter(|_| modern) {
            Some(url) => MetadataPayload::Url(url),
            None => MetadataPayload::Torrent(torrent),
        };
        let stats = modern
            .then(|| self.catalog.swarm_stats(&task.info_hash))
            .flatten();

        Some(MetadataMessage {
            info_hash: task.info_hash,
            payload,
            stats,
        })
    }

    /// Handles a METADATA body; returns the collected infohash.
    ///
    /// Unrequested and already collected torrents are dropped with `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - `MetadataError::BadEncoding` / `Malformed` - If the message is invalid
    /// - `MetadataError::TooLarge` - If the torrent exceeds the size limit
    /// - `MetadataError::Metainfo` - If the torrent or URL does not validate
    /// - `MetadataError::InfohashMismatch` - If the content hashes elsewhere
    /// - `MetadataError::Storage` - If the file cannot be stored
    pub async fn handle_metadata(
        &mut self,
        peer: &Permid,
        body: &[u8],
        selversion: u32,
    ) -> Result<Option<InfoHash>, MetadataError> {
        let message = MetadataMessage::decode(body)?;
        let info_hash = message.info_hash;

        if !self.requested.remove(&info_hash) {
            tracing::debug!(peer = %peer.short(), %info_hash, "Dropping unrequested metadata");
            return Ok(None);
        }
        if self.has_torrent_file(&info_hash) {
            tracing::debug!(%info_hash, "Dropping metadata for collected torrent");
            return Ok(None);
        }

        let size = message.payload_len();
        if size > self.config.max_torrent_size {
            return Err(MetadataError::TooLarge {
                size,
                limit: self.config.max_torrent_size,
            });
        }

        let (metainfo, torrent) = match message.payload {
            MetadataPayload::Url(url) => {
                if selversion < OLPROTO_VER_ELEVENTH {
                    return Err(MetadataError::Malformed {
                        reason: "url metadata from a peer without url support".to_string(),
                    });
                }
                let metainfo = materialize(&url)?;
                let torrent = metainfo.to_bytes();
                (metainfo, torrent)
            }
            MetadataPayload::Torrent(torrent) => (Metainfo::from_bytes(&torrent)?, torrent),
        };

        let computed = metainfo.info_hash();
        if computed != info_hash {
            return Err(MetadataError::InfohashMismatch {
                declared: info_hash,
                computed,
            });
        }

        let file_name = match self.collected.save(&info_hash, &torrent).await {
            Ok(file_name) => {
                self.disk_full = false;
                file_name
            }
            Err(error) => {
                if let StorageError::DiskFull { drive, .. } = &error {
                    self.signal_disk_full(drive.clone());
                }
                return Err(error.into());
            }
        };

        let sources_seen = self
            .catalog
            .get(&info_hash)
            .map_or(1, |existing| existing.sources_seen + 1);
        self.catalog.insert(TorrentRecord {
            info_hash,
            name: metainfo.name().to_string(),
            file_name: Some(file_name.clone()),
            source: SOURCE_BUDDYCAST.to_string(),
            stats: message.stats.unwrap_or_default(),
            inserted_at: unix_now(),
            sources_seen,
        });
        self.recent.push_front(info_hash);

        tracing::info!(peer = %peer.short(), %info_hash, name = metainfo.name(), "Collected torrent");
        self.events.publish(CoreEvent::TorrentCollected {
            info_hash,
            path: self.collected.dir().join(&file_name),
            from: peer.clone(),
        });

        self.enforce_collection_limit().await;
        Ok(Some(info_hash))
    }

    /// Recently collected torrents for the next gossip round.
    pub fn digest(&self, limit: usize, selversion: u32) -> Vec<DigestEntry> {
        self.recent
            .digest(limit, selversion, self.catalog.as_ref(), unix_now())
    }

    fn has_torrent_file(&self, info_hash: &InfoHash) -> bool {
        self.catalog
            .get(info_hash)
            .is_some_and(|record| record.file_name.is_some())
    }

    fn signal_disk_full(&mut self, drive: PathBuf) {
        if self.disk_full {
            return;
        }
        self.disk_full = true;
        tracing::warn!(drive = %drive.display(), "Disk full, dropping collected torrents");
        self.events
            .publish(CoreEvent::Activity(Activity::DiskFull { drive }));
    }

    async fn enforce_collection_limit(&mut self) {
        let collected = self.catalog.collected();
        let plan = eviction_plan(
            &collected,
            &self.catalog.preferences(),
            self.config.max_collected_torrents,
            self.config.eviction_ratio,
        );
        if plan.is_empty() {
            return;
        }

        tracing::info!(
            collected = collected.len(),
            evicting = plan.len(),
            "Collected torrents over limit"
        );
        for info_hash in plan {
            let Some(record) = self.catalog.remove(&info_hash) else {
                continue;
            };
            if let Some(file_name) = record.file_name {
                if let Err(error) = self.collected.delete(&file_name).await {
                    tracing::debug!(%info_hash, %error, "Could not delete evicted torrent");
                }
            }
            self.recent.remove(&info_hash);
            self.events.publish(CoreEvent::TorrentEvicted { info_hash });
        }
    }
}
