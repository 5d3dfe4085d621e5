//! Piggybacks subtitle metadata on channelcast gossip.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::SubtitleError;
use super::have::HaveMaskStore;
use super::messages::GetSubsMessage;
use super::record::MetadataRecord;
use super::signer::SignatureVerifier;
use super::store::MetadataStore;
use crate::overlay::{ChannelcastEntry, OLPROTO_VER_FOURTEENTH};
use crate::torrent::{InfoHash, Permid};

/// Local opinion of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Vote {
    /// Marked as spam; its metadata is discarded
    Spam,
    #[default]
    Neutral,
    /// Subscribed; its subtitles are fetched eagerly
    Subscribed,
}

impl Vote {
    /// Maps the numeric vote of the channel database.
    pub fn from_score(score: i32) -> Self {
        match score {
            -1 => Vote::Spam,
            2 => Vote::Subscribed,
            _ => Vote::Neutral,
        }
    }
}

/// Where channel votes come from.
pub trait VoteSource: Send + Sync {
    fn vote(&self, channel: &Permid) -> Vote;
}

/// In-memory votes, neutral unless set.
#[derive(Debug, Default)]
pub struct VoteTable {
    votes: RwLock<HashMap<Permid, Vote>>,
}

impl VoteTable {
    pub fn set(&self, channel: Permid, vote: Vote) {
        self.votes.write().insert(channel, vote);
    }
}

impl VoteSource for VoteTable {
    fn vote(&self, channel: &Permid) -> Vote {
        self.votes.read().get(channel).copied().unwrap_or_default()
    }
}

/// Attaches and extracts the `rich_metadata` field of channelcast entries.
pub struct RichMetadataInterceptor {
    store: MetadataStore,
    have: HaveMaskStore,
    verifier: Arc<dyn SignatureVerifier>,
    votes: Arc<dyn VoteSource>,
}

impl RichMetadataInterceptor {
    pub fn new(
        store: MetadataStore,
        have: HaveMaskStore,
        verifier: Arc<dyn SignatureVerifier>,
        votes: Arc<dyn VoteSource>,
    ) -> Self {
        Self {
            store,
            have,
            verifier,
            votes,
        }
    }

    /// Adds stored metadata to outgoing `entries`.
    ///
    /// Peers older than protocol 14 get no rich metadata at all. Returns how
    /// many entries carry it.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the store cannot be queried
    pub fn add_rich_metadata(
        &self,
        entries: &mut [ChannelcastEntry],
        selversion: u32,
    ) -> Result<usize, SubtitleError> {
        if selversion < OLPROTO_VER_FOURTEENTH {
            for entry in entries.iter_mut() {
                entry.rich_metadata = None;
            }
            return Ok(0);
        }

        let mut attached = 0;
        for entry in entries.iter_mut() {
            entry.rich_metadata = match self.store.get(&entry.channel, &entry.info_hash)? {
                Some(record) => {
                    attached += 1;
                    Some(record.to_wire(local_mask(&record)))
                }
                None => None,
            };
        }
        Ok(attached)
    }

    /// Ingests the rich metadata of channelcast `entries` received from `sender`.
    ///
    /// Invalid entries are dropped one by one. Returns the subtitle requests
    /// to issue for subscribed channels.
    pub fn handle_rich_metadata(
        &self,
        sender: &Permid,
        entries: &[ChannelcastEntry],
        selversion: u32,
        now_ts: i64,
    ) -> Vec<GetSubsMessage> {
        if selversion < OLPROTO_VER_FOURTEENTH {
            return Vec::new();
        }

        entries
            .iter()
            .filter_map(|entry| {
                let rich_metadata = entry.rich_metadata.as_ref()?;
                match self.ingest(sender, entry, rich_metadata, now_ts) {
                    Ok(request) => request,
                    Err(error) => {
                        tracing::debug!(
                            peer = %sender.short(),
                            channel = %entry.channel.short(),
                            info_hash = %entry.info_hash,
                            %error,
                            "Dropping rich metadata"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn ingest(
        &self,
        sender: &Permid,
        entry: &ChannelcastEntry,
        rich_metadata: &crate::bencode::Value,
        now_ts: i64,
    ) -> Result<Option<GetSubsMessage>, SubtitleError> {
        let (record, have_mask) =
            MetadataRecord::from_wire(entry.channel.clone(), entry.info_hash, rich_metadata)?;
        record.verify(self.verifier.as_ref())?;

        let vote = self.votes.vote(&record.channel);
        if vote == Vote::Spam {
            tracing::debug!(channel = %record.channel.short(), "Ignoring metadata of spam channel");
            return Ok(None);
        }

        self.store.insert(&record)?;
        self.have
            .insert_or_update(&record.channel, &record.info_hash, sender, have_mask, now_ts)?;

        if vote != Vote::Subscribed {
            return Ok(None);
        }
        let missing = self.missing_languages(&record.channel, &record.info_hash)?;
        Ok((missing != 0).then(|| GetSubsMessage {
            channel: record.channel.clone(),
            info_hash: record.info_hash,
            mask: missing,
        }))
    }

    /// Languages of the stored record without a local file.
    fn missing_languages(&self, channel: &Permid, info_hash: &InfoHash) -> Result<u32, SubtitleError> {
        Ok(self
            .store
            .get(channel, info_hash)?
            .map_or(0, |record| record.lang_mask() & !local_mask(&record)))
    }
}

fn local_mask(record: &MetadataRecord) -> u32 {
    record
        .subtitles
        .values()
        .filter(|subtitle| subtitle.path.is_some())
        .filter_map(|subtitle| super::languages::bit(&subtitle.lang).ok())
        .fold(0, |mask, bit| mask | bit)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::events::EventBus;
    use crate::overlay::OLPROTO_VER_ELEVENTH;
    use crate::subtitles::record::tests::signed_record;
    use crate::subtitles::signer::{Ed25519Signer, Ed25519Verifier, Signer};
    use crate::subtitles::store::SubtitleDb;

    struct Fixture {
        interceptor: RichMetadataInterceptor,
        store: MetadataStore,
        have: HaveMaskStore,
        votes: Arc<VoteTable>,
        publisher: Ed25519Signer,
    }

    fn fixture() -> Fixture {
        let db = SubtitleDb::open_in_memory().unwrap();
        let store = MetadataStore::new(db.clone(), EventBus::new());
        let have = HaveMaskStore::new(db);
        let votes = Arc::new(VoteTable::default());
        Fixture {
            interceptor: RichMetadataInterceptor::new(
                store.clone(),
                have.clone(),
                Arc::new(Ed25519Verifier),
                votes.clone(),
            ),
            store,
            have,
            votes,
            publisher: Ed25519Signer::from_seed([11; 32]),
        }
    }

    fn entry(record: &MetadataRecord, have_mask: u32) -> ChannelcastEntry {
        ChannelcastEntry {
            channel: record.channel.clone(),
            info_hash: record.info_hash,
            name: "film".to_string(),
            timestamp: record.timestamp,
            rich_metadata: Some(record.to_wire(have_mask)),
        }
    }

    fn sender() -> Permid {
        Permid::from_slice(&[42; 32]).unwrap()
    }

    #[test]
    fn test_attach_only_for_new_peers() {
        let fixture = fixture();
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng"], 5);
        fixture.store.insert(&record).unwrap();
        fixture
            .store
            .update_subtitle_path(&record.channel, &record.info_hash, "eng", Some(Path::new("/s/eng.srt")))
            .unwrap();

        let unknown = ChannelcastEntry {
            info_hash: InfoHash::new([2; 20]),
            rich_metadata: None,
            ..entry(&record, 0)
        };
        let mut entries = vec![
            ChannelcastEntry {
                rich_metadata: None,
                ..entry(&record, 0)
            },
            unknown,
        ];

        assert_eq!(fixture.interceptor.add_rich_metadata(&mut entries, OLPROTO_VER_FOURTEENTH).unwrap(), 1);
        let (decoded, have_mask) = MetadataRecord::from_wire(
            record.channel.clone(),
            record.info_hash,
            entries[0].rich_metadata.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(decoded.signature, record.signature);
        assert_eq!(have_mask, 1 << 6);
        assert!(entries[1].rich_metadata.is_none());

        assert_eq!(fixture.interceptor.add_rich_metadata(&mut entries, OLPROTO_VER_ELEVENTH).unwrap(), 0);
        assert!(entries[0].rich_metadata.is_none());
    }

    #[test]
    fn test_valid_metadata_is_stored_with_have_mask() {
        let fixture = fixture();
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng", "ita"], 5);

        let requests = fixture.interceptor.handle_rich_metadata(
            &sender(),
            &[entry(&record, 1 << 13)],
            OLPROTO_VER_FOURTEENTH,
            1000,
        );

        assert!(requests.is_empty());
        assert_eq!(fixture.store.get(&record.channel, &record.info_hash).unwrap(), Some(record.clone()));
        assert_eq!(
            fixture.have.get_have_mask(&record.channel, &record.info_hash, &sender()).unwrap(),
            Some(1 << 13)
        );
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let fixture = fixture();
        let mut record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng"], 5);
        record.description = "forged".to_string();

        fixture
            .interceptor
            .handle_rich_metadata(&sender(), &[entry(&record, 0)], OLPROTO_VER_FOURTEENTH, 1);
        assert_eq!(fixture.store.get(&record.channel, &record.info_hash).unwrap(), None);
    }

    #[test]
    fn test_spam_channel_is_discarded() {
        let fixture = fixture();
        fixture.votes.set(fixture.publisher.permid(), Vote::from_score(-1));
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng"], 5);

        let requests = fixture.interceptor.handle_rich_metadata(
            &sender(),
            &[entry(&record, 1 << 6)],
            OLPROTO_VER_FOURTEENTH,
            1,
        );

        assert!(requests.is_empty());
        assert_eq!(fixture.store.get(&record.channel, &record.info_hash).unwrap(), None);
        assert_eq!(
            fixture.have.get_have_mask(&record.channel, &record.info_hash, &sender()).unwrap(),
            None
        );
        assert!(fixture.have.get_entries(&record.channel, &record.info_hash).unwrap().is_empty());
    }

    #[test]
    fn test_spam_vote_leaves_existing_rows_alone() {
        let fixture = fixture();
        let old = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng"], 5);
        fixture
            .interceptor
            .handle_rich_metadata(&sender(), &[entry(&old, 1 << 6)], OLPROTO_VER_FOURTEENTH, 1);

        fixture.votes.set(fixture.publisher.permid(), Vote::Spam);
        let newer = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng", "ita"], 9);
        fixture
            .interceptor
            .handle_rich_metadata(&sender(), &[entry(&newer, 1 << 13)], OLPROTO_VER_FOURTEENTH, 2);

        assert_eq!(fixture.store.get(&old.channel, &old.info_hash).unwrap(), Some(old.clone()));
        assert_eq!(
            fixture.have.get_have_mask(&old.channel, &old.info_hash, &sender()).unwrap(),
            Some(1 << 6)
        );
    }

    #[test]
    fn test_subscribed_channel_requests_all_languages() {
        let fixture = fixture();
        fixture.votes.set(fixture.publisher.permid(), Vote::from_score(2));
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng", "nld"], 5);

        let requests = fixture.interceptor.handle_rich_metadata(
            &sender(),
            &[entry(&record, 0)],
            OLPROTO_VER_FOURTEENTH,
            1,
        );

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].languages(), vec!["eng", "nld"]);
        assert_eq!(requests[0].channel, record.channel);
    }

    #[test]
    fn test_subscribed_channel_skips_languages_held_locally() {
        let fixture = fixture();
        fixture.votes.set(fixture.publisher.permid(), Vote::Subscribed);
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng", "nld"], 5);
        fixture.store.insert(&record).unwrap();
        fixture
            .store
            .update_subtitle_path(&record.channel, &record.info_hash, "eng", Some(Path::new("/s/eng.srt")))
            .unwrap();

        let requests = fixture.interceptor.handle_rich_metadata(
            &sender(),
            &[entry(&record, 0)],
            OLPROTO_VER_FOURTEENTH,
            1,
        );

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].languages(), vec!["nld"]);
    }

    #[test]
    fn test_old_peers_and_malformed_entries_are_ignored() {
        let fixture = fixture();
        let record = signed_record(&fixture.publisher, InfoHash::new([1; 20]), &["eng"], 5);

        fixture
            .interceptor
            .handle_rich_metadata(&sender(), &[entry(&record, 0)], OLPROTO_VER_ELEVENTH, 1);
        assert_eq!(fixture.store.get(&record.channel, &record.info_hash).unwrap(), None);

        let broken = ChannelcastEntry {
            rich_metadata: Some(crate::bencode::Value::Integer(3)),
            ..entry(&record, 0)
        };
        fixture
            .interceptor
            .handle_rich_metadata(&sender(), &[broken, entry(&record, 0)], OLPROTO_VER_FOURTEENTH, 1);
        assert!(fixture.store.get(&record.channel, &record.info_hash).unwrap().is_some());
    }
}
