//! Subtitle files on disk and their rows in the metadata store.
//!
//! Serves GET_SUBS from local files, persists and verifies received SUBS,
//! and lets the local channel publish its own subtitles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use super::SubtitleError;
use super::have::HaveMaskStore;
use super::languages;
use super::messages::{GetSubsMessage, SubsMessage};
use super::peer_selector::select_peers;
use super::record::{MetadataRecord, SubtitleInfo, subtitle_checksum};
use super::signer::Signer;
use super::store::MetadataStore;
use crate::config::SubtitlesConfig;
use crate::events::{Activity, CoreEvent, EventBus};
use crate::overlay::unix_now;
use crate::storage::{DiskManager, StorageError};
use crate::torrent::{InfoHash, Permid};

/// `hex(sha1(channel || infohash || lang)) + ".srt"`.
pub fn subtitle_file_name(channel: &Permid, info_hash: &InfoHash, lang: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(channel.as_bytes());
    hasher.update(info_hash.as_bytes());
    hasher.update(lang.as_bytes());
    format!("{}.srt", hex::encode(hasher.finalize()))
}

/// Facade over the subtitle directory, metadata store and have-masks.
pub struct SubtitleSupport {
    store: MetadataStore,
    have: HaveMaskStore,
    disk: Arc<DiskManager>,
    subs_dir: PathBuf,
    signer: Arc<dyn Signer>,
    events: EventBus,
    max_subtitle_size: usize,
    max_peers: usize,
    disk_full: bool,
}

impl SubtitleSupport {
    /// The subtitle directory must already be registered with `disk`.
    pub fn new(
        config: &SubtitlesConfig,
        store: MetadataStore,
        have: HaveMaskStore,
        disk: Arc<DiskManager>,
        signer: Arc<dyn Signer>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            have,
            disk,
            subs_dir: config.subs_dir.clone(),
            signer,
            events,
            max_subtitle_size: config.max_subtitle_size,
            max_peers: config.max_peers_per_request,
            disk_full: false,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn have(&self) -> &HaveMaskStore {
        &self.have
    }

    pub fn permid(&self) -> Permid {
        self.signer.permid()
    }

    /// Builds the answer to `request` from local files.
    ///
    /// Only languages with a readable file within the size limit are
    /// included. Rows pointing at missing files lose their path.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the store cannot be queried
    pub async fn serve(&self, request: &GetSubsMessage) -> Result<SubsMessage, SubtitleError> {
        let mut subs = SubsMessage::new(request.channel.clone(), request.info_hash);
        let Some(record) = self.store.get(&request.channel, &request.info_hash)? else {
            tracing::debug!(
                channel = %request.channel.short(),
                info_hash = %request.info_hash,
                "GET_SUBS for unknown metadata"
            );
            return Ok(subs);
        };

        for lang in request.languages() {
            let Some(path) = record.subtitle(lang).and_then(|subtitle| subtitle.path.as_deref()) else {
                continue;
            };

            let size = match tokio::fs::metadata(path).await {
                Ok(metadata) => metadata.len(),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(lang, path = %path.display(), "Subtitle file vanished");
                    self.store
                        .update_subtitle_path(&record.channel, &record.info_hash, lang, None)?;
                    continue;
                }
                Err(error) => {
                    tracing::debug!(lang, path = %path.display(), %error, "Cannot stat subtitle");
                    continue;
                }
            };
            if size > self.max_subtitle_size as u64 {
                tracing::debug!(lang, size, "Subtitle too large to serve");
                continue;
            }

            match tokio::fs::read(path).await {
                Ok(content) => {
                    subs.contents.insert(lang.to_string(), content);
                }
                Err(error) => {
                    tracing::debug!(lang, path = %path.display(), %error, "Cannot read subtitle");
                }
            }
        }
        Ok(subs)
    }

    /// Stores every subtitle of `subs` that verifies.
    ///
    /// Returns the mask of languages now on disk. Failures are logged and
    /// skip only the affected language.
    pub async fn persist(&mut self, subs: &SubsMessage) -> u32 {
        let mut stored = 0;
        for (lang, content) in &subs.contents {
            match self
                .persist_subtitle(&subs.channel, &subs.info_hash, lang, content)
                .await
            {
                Ok(_) => {
                    stored |= languages::bit(lang).unwrap_or(0);
                }
                Err(SubtitleError::Storage(StorageError::DiskFull { drive, .. })) => {
                    self.signal_disk_full(drive);
                }
                Err(error) => {
                    tracing::debug!(
                        channel = %subs.channel.short(),
                        info_hash = %subs.info_hash,
                        lang,
                        %error,
                        "Dropping received subtitle"
                    );
                }
            }
        }
        stored
    }

    /// Writes one received subtitle and checks it against the published checksum.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::UnknownMetadata` - If the record or language is not known
    /// - `SubtitleError::ChecksumMismatch` - If the content does not verify;
    ///   the file is removed and the path cleared
    /// - `SubtitleError::Storage` - If the write is refused
    pub async fn persist_subtitle(
        &mut self,
        channel: &Permid,
        info_hash: &InfoHash,
        lang: &str,
        content: &[u8],
    ) -> Result<PathBuf, SubtitleError> {
        let expected = self
            .store
            .get_subtitle(channel, info_hash, lang)?
            .ok_or_else(|| SubtitleError::UnknownMetadata {
                channel: channel.short(),
                info_hash: *info_hash,
            })?;

        let name = subtitle_file_name(channel, info_hash, lang);
        let path = self.disk.write(&self.subs_dir, &name, content).await?;
        self.disk_full = false;

        let written = self.disk.read(&self.subs_dir, &name).await?;
        if subtitle_checksum(&written) != expected.checksum {
            self.disk.delete(&self.subs_dir, &name).await?;
            self.store
                .update_subtitle_path(channel, info_hash, lang, None)?;
            return Err(SubtitleError::ChecksumMismatch {
                lang: lang.to_string(),
            });
        }

        self.store
            .update_subtitle_path(channel, info_hash, lang, Some(&path))?;
        tracing::info!(channel = %channel.short(), %info_hash, lang, "Stored subtitle");
        self.events.publish(CoreEvent::SubtitleReceived {
            channel: channel.clone(),
            info_hash: *info_hash,
            lang: lang.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    /// Adds a subtitle to the local channel's record for `info_hash`.
    ///
    /// The record is re-signed with a timestamp newer than any stored one
    /// and the local have-mask is refreshed.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::UnsupportedLanguage` - If `lang` has no bit
    /// - `SubtitleError::TooLarge` - If `content` exceeds the subtitle limit
    /// - `SubtitleError::Storage` - If the file cannot be written
    /// - `SubtitleError::Database` - If the store update fails
    pub async fn publish_subtitle(
        &mut self,
        info_hash: &InfoHash,
        lang: &str,
        content: &[u8],
        description: Option<&str>,
    ) -> Result<MetadataRecord, SubtitleError> {
        languages::bit(lang)?;
        if content.len() > self.max_subtitle_size {
            return Err(SubtitleError::TooLarge {
                size: content.len(),
                limit: self.max_subtitle_size,
            });
        }

        let channel = self.signer.permid();
        let now = unix_now();
        let mut record = match self.store.get(&channel, info_hash)? {
            Some(mut record) => {
                record.timestamp = now.max(record.timestamp + 1);
                record
            }
            None => MetadataRecord::new(channel.clone(), *info_hash, "", now),
        };
        if let Some(description) = description {
            record.description = description.to_string();
        }

        let name = subtitle_file_name(&channel, info_hash, lang);
        let path = self.disk.write(&self.subs_dir, &name, content).await?;
        let written = self.disk.read(&self.subs_dir, &name).await?;
        record.add_subtitle(SubtitleInfo::from_content(lang, path, &written))?;
        record.sign(self.signer.as_ref());

        self.store.insert(&record)?;
        self.have
            .insert_or_update(&channel, info_hash, &channel, record.lang_mask(), now)?;
        tracing::info!(%info_hash, lang, "Published subtitle");
        Ok(record)
    }

    /// Peers to ask for `mask` of `(channel, info_hash)`, best first.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the have-masks cannot be read
    pub fn request_plan(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        mask: u32,
    ) -> Result<Vec<Permid>, SubtitleError> {
        let entries = self.have.get_entries(channel, info_hash)?;
        Ok(select_peers(&entries, channel, mask, self.max_peers))
    }

    /// Languages of the record available on local disk.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the store cannot be queried
    pub fn local_have_mask(&self, channel: &Permid, info_hash: &InfoHash) -> Result<u32, SubtitleError> {
        Ok(self
            .store
            .get(channel, info_hash)?
            .map_or(0, |record| {
                record
                    .subtitles
                    .values()
                    .filter(|subtitle| subtitle.path.is_some())
                    .filter_map(|subtitle| languages::bit(&subtitle.lang).ok())
                    .fold(0, |mask, bit| mask | bit)
            }))
    }

    /// Clears the path of every local subtitle that is missing or corrupt.
    ///
    /// Returns how many rows were rewritten.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the store cannot be queried or updated
    pub async fn verify_local_subtitles(&self) -> Result<usize, SubtitleError> {
        let local: Vec<_> = self
            .store
            .list_local_subtitles()?
            .into_iter()
            .flat_map(|(channel, torrents)| {
                torrents.into_iter().flat_map(move |(info_hash, subtitles)| {
                    let channel = channel.clone();
                    subtitles
                        .into_iter()
                        .map(move |subtitle| (channel.clone(), info_hash, subtitle))
                })
            })
            .collect();

        let checks = local.iter().map(|(_, _, subtitle)| async move {
            match subtitle.path.as_deref() {
                Some(path) => file_matches(path, subtitle).await,
                None => true,
            }
        });
        let verdicts = futures::future::join_all(checks).await;

        let mut rewritten = 0;
        for ((channel, info_hash, subtitle), intact) in local.iter().zip(verdicts) {
            if intact {
                continue;
            }
            tracing::debug!(
                channel = %channel.short(),
                %info_hash,
                lang = subtitle.lang,
                "Local subtitle missing or corrupt"
            );
            self.store
                .update_subtitle_path(channel, info_hash, &subtitle.lang, None)?;
            rewritten += 1;
        }
        if rewritten > 0 {
            tracing::info!(rewritten, "Cleared stale subtitle paths");
        }
        Ok(rewritten)
    }

    fn signal_disk_full(&mut self, drive: PathBuf) {
        if self.disk_full {
            return;
        }
        self.disk_full = true;
        tracing::warn!(drive = %drive.display(), "Disk full, dropping received subtitles");
        self.events
            .publish(CoreEvent::Activity(Activity::DiskFull { drive }));
    }
}

async fn file_matches(path: &Path, subtitle: &SubtitleInfo) -> bool {
    match tokio::fs::read(path).await {
        Ok(content) => subtitle.matches(&content),
        Err(_) => false,
    }
}
