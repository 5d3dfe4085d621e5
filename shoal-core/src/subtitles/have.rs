//! Which subtitle languages each peer claims to hold.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use super::SubtitleError;
use super::store::{SubtitleDb, metadata_id, permid_column};
use crate::torrent::{InfoHash, Permid};

/// Most entries returned for one record.
pub const MAX_HAVE_ENTRIES: usize = 200;

/// Have-mask advertised by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaveEntry {
    pub peer: Permid,
    pub have_mask: u32,
    /// Unix seconds of the last advertisement
    pub received_ts: i64,
}

/// `(channel, infohash, peer) -> (have_mask, ts)` on top of the subtitle database.
///
/// Entries hang off the metadata record and disappear with it.
#[derive(Clone)]
pub struct HaveMaskStore {
    db: Arc<SubtitleDb>,
    max_entries: usize,
}

impl HaveMaskStore {
    pub fn new(db: Arc<SubtitleDb>) -> Self {
        Self::with_limit(db, MAX_HAVE_ENTRIES)
    }

    pub fn with_limit(db: Arc<SubtitleDb>, max_entries: usize) -> Self {
        Self { db, max_entries }
    }

    /// Records that `peer` holds `have_mask` for the record.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::UnknownMetadata` - If the record is not stored
    /// - `SubtitleError::Database` - If the write fails
    pub fn insert_or_update(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        peer: &Permid,
        have_mask: u32,
        received_ts: i64,
    ) -> Result<(), SubtitleError> {
        let conn = self.db.lock();
        let id = metadata_id(&conn, channel, info_hash)?.ok_or_else(|| {
            SubtitleError::UnknownMetadata {
                channel: channel.short(),
                info_hash: *info_hash,
            }
        })?;

        let exists = conn
            .query_row(
                "SELECT 1 FROM SubtitlesHave WHERE metadata_id_fk = ?1 AND peer_id = ?2",
                params![id, peer.as_bytes()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if exists {
            conn.execute(
                "UPDATE SubtitlesHave SET have_mask = ?3, received_ts = ?4
                 WHERE metadata_id_fk = ?1 AND peer_id = ?2",
                params![id, peer.as_bytes(), have_mask, received_ts],
            )?;
        } else {
            conn.execute(
                "INSERT INTO SubtitlesHave (metadata_id_fk, peer_id, have_mask, received_ts)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, peer.as_bytes(), have_mask, received_ts],
            )?;
        }

        tracing::trace!(
            channel = %channel.short(),
            %info_hash,
            peer = %peer.short(),
            have_mask,
            "Recorded have-mask"
        );
        Ok(())
    }

    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the delete fails
    pub fn delete(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        peer: &Permid,
    ) -> Result<bool, SubtitleError> {
        let deleted = self.db.lock().execute(
            "DELETE FROM SubtitlesHave WHERE peer_id = ?3 AND metadata_id_fk = (
                 SELECT metadata_id FROM Metadata WHERE publisher_id = ?1 AND infohash = ?2
             )",
            params![channel.as_bytes(), info_hash.as_bytes().as_slice(), peer.as_bytes()],
        )?;
        Ok(deleted > 0)
    }

    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn get_have_mask(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        peer: &Permid,
    ) -> Result<Option<u32>, SubtitleError> {
        Ok(self
            .db
            .lock()
            .query_row(
                "SELECT h.have_mask FROM SubtitlesHave h
                 JOIN Metadata m ON h.metadata_id_fk = m.metadata_id
                 WHERE m.publisher_id = ?1 AND m.infohash = ?2 AND h.peer_id = ?3",
                params![channel.as_bytes(), info_hash.as_bytes().as_slice(), peer.as_bytes()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Entries for the record, most recent first.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn get_entries(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
    ) -> Result<Vec<HaveEntry>, SubtitleError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT h.peer_id, h.have_mask, h.received_ts FROM SubtitlesHave h
             JOIN Metadata m ON h.metadata_id_fk = m.metadata_id
             WHERE m.publisher_id = ?1 AND m.infohash = ?2
             ORDER BY h.received_ts DESC
             LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(
                params![
                    channel.as_bytes(),
                    info_hash.as_bytes().as_slice(),
                    i64::try_from(self.max_entries).unwrap_or(i64::MAX),
                ],
                |row| {
                    Ok(HaveEntry {
                        peer: permid_column(row, 0)?,
                        have_mask: row.get(1)?,
                        received_ts: row.get(2)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }

    /// Deletes entries older than `limit_ts`, except the publisher's own.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the delete fails
    pub fn cleanup_old(&self, limit_ts: i64) -> Result<usize, SubtitleError> {
        let removed = self.db.lock().execute(
            "DELETE FROM SubtitlesHave WHERE received_ts < ?1 AND peer_id != (
                 SELECT publisher_id FROM Metadata WHERE metadata_id = metadata_id_fk
             )",
            params![limit_ts],
        )?;
        if removed > 0 {
            tracing::debug!(removed, limit_ts, "Expired have-mask entries");
        }
        Ok(removed)
    }
}
