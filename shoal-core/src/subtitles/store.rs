//! Persistent subtitle metadata keyed by `(channel, infohash)`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::SubtitleError;
use super::record::{MetadataRecord, SubtitleInfo};
use crate::events::{CoreEvent, EventBus};
use crate::torrent::{HASH_LEN, InfoHash, Permid};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS Metadata (
        metadata_id INTEGER PRIMARY KEY AUTOINCREMENT,
        publisher_id BLOB NOT NULL,
        infohash BLOB NOT NULL,
        description TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        signature BLOB NOT NULL,
        UNIQUE (publisher_id, infohash)
    );
    CREATE TABLE IF NOT EXISTS Subtitles (
        metadata_id_fk INTEGER NOT NULL
            REFERENCES Metadata(metadata_id) ON DELETE CASCADE,
        subtitle_lang TEXT NOT NULL,
        subtitle_location TEXT,
        checksum BLOB NOT NULL,
        UNIQUE (metadata_id_fk, subtitle_lang)
    );
    CREATE TABLE IF NOT EXISTS SubtitlesHave (
        metadata_id_fk INTEGER NOT NULL
            REFERENCES Metadata(metadata_id) ON DELETE CASCADE,
        peer_id BLOB NOT NULL,
        have_mask INTEGER NOT NULL,
        received_ts INTEGER NOT NULL,
        UNIQUE (metadata_id_fk, peer_id)
    );
    CREATE INDEX IF NOT EXISTS metadata_infohash ON Metadata(infohash);
";

/// Local subtitles grouped by channel, then torrent.
pub type LocalSubtitles = BTreeMap<Permid, BTreeMap<InfoHash, Vec<SubtitleInfo>>>;

/// SQLite connection shared by the metadata and have-mask stores.
pub struct SubtitleDb {
    conn: Mutex<Connection>,
}

impl SubtitleDb {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the file cannot be opened or migrated
    pub fn open(path: &Path) -> Result<Arc<Self>, SubtitleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the schema cannot be created
    pub fn open_in_memory() -> Result<Arc<Self>, SubtitleError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Arc<Self>, SubtitleError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Row id of the metadata record for `(channel, info_hash)`.
pub(crate) fn metadata_id(
    conn: &Connection,
    channel: &Permid,
    info_hash: &InfoHash,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT metadata_id FROM Metadata WHERE publisher_id = ?1 AND infohash = ?2",
        params![channel.as_bytes(), info_hash.as_bytes().as_slice()],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn permid_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Permid> {
    let bytes: Vec<u8> = row.get(index)?;
    Permid::from_slice(&bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Blob, Box::new(e)))
}

pub(crate) fn info_hash_column(row: &Row<'_>, index: usize) -> rusqlite::Result<InfoHash> {
    let bytes: Vec<u8> = row.get(index)?;
    InfoHash::from_slice(&bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Blob, Box::new(e)))
}

fn checksum_column(row: &Row<'_>, index: usize) -> rusqlite::Result<[u8; HASH_LEN]> {
    let bytes: Vec<u8> = row.get(index)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Blob,
            format!("checksum of {} bytes", bytes.len()).into(),
        )
    })
}

fn location(path: Option<&Path>) -> Option<String> {
    path.map(|path| path.to_string_lossy().into_owned())
}

/// Result of [`MetadataStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    /// Stored record is as new or newer
    Unchanged,
}

/// Normalized catalog of rich metadata records.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<SubtitleDb>,
    events: EventBus,
}

impl MetadataStore {
    pub fn new(db: Arc<SubtitleDb>, events: EventBus) -> Self {
        Self { db, events }
    }

    pub fn db(&self) -> &Arc<SubtitleDb> {
        &self.db
    }

    /// Inserts `record`, or replaces the stored one if `record` is strictly newer.
    ///
    /// Subtitles are diffed in the same transaction: common languages get the
    /// new checksum and path, new languages are added, dropped ones deleted.
    /// A common language arriving without a path keeps its local file as long
    /// as the checksum did not change.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the transaction fails
    pub fn insert(&self, record: &MetadataRecord) -> Result<InsertOutcome, SubtitleError> {
        let outcome = {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;

            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT metadata_id, timestamp FROM Metadata
                     WHERE publisher_id = ?1 AND infohash = ?2",
                    params![record.channel.as_bytes(), record.info_hash.as_bytes().as_slice()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let outcome = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO Metadata
                         (publisher_id, infohash, description, timestamp, signature)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            record.channel.as_bytes(),
                            record.info_hash.as_bytes().as_slice(),
                            record.description,
                            record.timestamp,
                            record.signature,
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    for subtitle in record.subtitles.values() {
                        insert_subtitle(&tx, id, subtitle)?;
                    }
                    InsertOutcome::Inserted
                }
                Some((_, stored)) if record.timestamp <= stored => InsertOutcome::Unchanged,
                Some((id, _)) => {
                    tx.execute(
                        "UPDATE Metadata SET description = ?2, timestamp = ?3, signature = ?4
                         WHERE metadata_id = ?1",
                        params![id, record.description, record.timestamp, record.signature],
                    )?;

                    let stored_langs: BTreeSet<String> = {
                        let mut stmt = tx.prepare(
                            "SELECT subtitle_lang FROM Subtitles WHERE metadata_id_fk = ?1",
                        )?;
                        stmt.query_map(params![id], |row| row.get(0))?
                            .collect::<rusqlite::Result<_>>()?
                    };

                    for subtitle in record.subtitles.values() {
                        if stored_langs.contains(&subtitle.lang) {
                            tx.execute(
                                "UPDATE Subtitles SET
                                    subtitle_location = CASE
                                        WHEN ?4 IS NOT NULL THEN ?4
                                        WHEN checksum = ?3 THEN subtitle_location
                                        ELSE NULL
                                    END,
                                    checksum = ?3
                                 WHERE metadata_id_fk = ?1 AND subtitle_lang = ?2",
                                params![
                                    id,
                                    subtitle.lang,
                                    subtitle.checksum.as_slice(),
                                    location(subtitle.path.as_deref()),
                                ],
                            )?;
                        } else {
                            insert_subtitle(&tx, id, subtitle)?;
                        }
                    }
                    for lang in stored_langs
                        .iter()
                        .filter(|lang| !record.subtitles.contains_key(*lang))
                    {
                        tx.execute(
                            "DELETE FROM Subtitles WHERE metadata_id_fk = ?1 AND subtitle_lang = ?2",
                            params![id, lang],
                        )?;
                    }
                    InsertOutcome::Updated
                }
            };

            tx.commit()?;
            outcome
        };

        let channel = record.channel.clone();
        let info_hash = record.info_hash;
        match outcome {
            InsertOutcome::Inserted => {
                tracing::debug!(channel = %channel.short(), %info_hash, "Inserted rich metadata");
                self.events
                    .publish(CoreEvent::MetadataInserted { channel, info_hash });
            }
            InsertOutcome::Updated => {
                tracing::debug!(channel = %channel.short(), %info_hash, "Updated rich metadata");
                self.events
                    .publish(CoreEvent::MetadataUpdated { channel, info_hash });
            }
            InsertOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn get(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
    ) -> Result<Option<MetadataRecord>, SubtitleError> {
        let conn = self.db.lock();
        let header = conn
            .query_row(
                "SELECT metadata_id, publisher_id, infohash, description, timestamp, signature
                 FROM Metadata WHERE publisher_id = ?1 AND infohash = ?2",
                params![channel.as_bytes(), info_hash.as_bytes().as_slice()],
                record_header,
            )
            .optional()?;

        match header {
            Some((id, record)) => Ok(Some(with_subtitles(&conn, id, record)?)),
            None => Ok(None),
        }
    }

    /// All channels' records for one torrent.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn get_all_for_infohash(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Vec<MetadataRecord>, SubtitleError> {
        let conn = self.db.lock();
        let headers: Vec<(i64, MetadataRecord)> = {
            let mut stmt = conn.prepare(
                "SELECT metadata_id, publisher_id, infohash, description, timestamp, signature
                 FROM Metadata WHERE infohash = ?1 ORDER BY metadata_id",
            )?;
            stmt.query_map(params![info_hash.as_bytes().as_slice()], record_header)?
                .collect::<rusqlite::Result<_>>()?
        };

        headers
            .into_iter()
            .map(|(id, record)| Ok(with_subtitles(&conn, id, record)?))
            .collect()
    }

    /// Deletes the record with its subtitles and have entries.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the delete fails
    pub fn delete(&self, channel: &Permid, info_hash: &InfoHash) -> Result<bool, SubtitleError> {
        let deleted = self.db.lock().execute(
            "DELETE FROM Metadata WHERE publisher_id = ?1 AND infohash = ?2",
            params![channel.as_bytes(), info_hash.as_bytes().as_slice()],
        )? > 0;

        if deleted {
            self.events.publish(CoreEvent::MetadataDeleted {
                channel: channel.clone(),
                info_hash: *info_hash,
            });
        }
        Ok(deleted)
    }

    /// Sets the local path of a subtitle. Missing rows are ignored.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the update fails
    pub fn update_subtitle_path(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        lang: &str,
        path: Option<&Path>,
    ) -> Result<(), SubtitleError> {
        let updated = self.db.lock().execute(
            "UPDATE Subtitles SET subtitle_location = ?4
             WHERE subtitle_lang = ?3 AND metadata_id_fk = (
                 SELECT metadata_id FROM Metadata WHERE publisher_id = ?1 AND infohash = ?2
             )",
            params![
                channel.as_bytes(),
                info_hash.as_bytes().as_slice(),
                lang,
                location(path),
            ],
        )?;
        if updated == 0 {
            tracing::trace!(channel = %channel.short(), %info_hash, lang, "No subtitle row to update");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn get_subtitle(
        &self,
        channel: &Permid,
        info_hash: &InfoHash,
        lang: &str,
    ) -> Result<Option<SubtitleInfo>, SubtitleError> {
        Ok(self
            .db
            .lock()
            .query_row(
                "SELECT s.subtitle_lang, s.subtitle_location, s.checksum
                 FROM Subtitles s JOIN Metadata m ON s.metadata_id_fk = m.metadata_id
                 WHERE m.publisher_id = ?1 AND m.infohash = ?2 AND s.subtitle_lang = ?3",
                params![channel.as_bytes(), info_hash.as_bytes().as_slice(), lang],
                |row| subtitle_row(row, 0),
            )
            .optional()?)
    }

    /// Subtitles with a local file, grouped by channel and torrent.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn list_local_subtitles(&self) -> Result<LocalSubtitles, SubtitleError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT m.publisher_id, m.infohash, s.subtitle_lang, s.subtitle_location, s.checksum
             FROM Subtitles s JOIN Metadata m ON s.metadata_id_fk = m.metadata_id
             WHERE s.subtitle_location IS NOT NULL
             ORDER BY s.subtitle_lang",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                permid_column(row, 0)?,
                info_hash_column(row, 1)?,
                subtitle_row(row, 2)?,
            ))
        })?;

        let mut local = LocalSubtitles::new();
        for row in rows {
            let (channel, info_hash, subtitle) = row?;
            local
                .entry(channel)
                .or_default()
                .entry(info_hash)
                .or_default()
                .push(subtitle);
        }
        Ok(local)
    }

    /// Channels that published at least one record.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the query fails
    pub fn all_channels_with_metadata(&self) -> Result<Vec<Permid>, SubtitleError> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT publisher_id FROM Metadata ORDER BY publisher_id")?;
        let channels = stmt
            .query_map([], |row| permid_column(row, 0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(channels)
    }
}

fn insert_subtitle(
    conn: &Connection,
    metadata_id: i64,
    subtitle: &SubtitleInfo,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO Subtitles (metadata_id_fk, subtitle_lang, subtitle_location, checksum)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            metadata_id,
            subtitle.lang,
            location(subtitle.path.as_deref()),
            subtitle.checksum.as_slice(),
        ],
    )?;
    Ok(())
}

fn record_header(row: &Row<'_>) -> rusqlite::Result<(i64, MetadataRecord)> {
    let mut record = MetadataRecord::new(
        permid_column(row, 1)?,
        info_hash_column(row, 2)?,
        &row.get::<_, String>(3)?,
        row.get(4)?,
    );
    record.signature = row.get(5)?;
    Ok((row.get(0)?, record))
}

fn subtitle_row(row: &Row<'_>, first: usize) -> rusqlite::Result<SubtitleInfo> {
    let lang: String = row.get(first)?;
    let path: Option<String> = row.get(first + 1)?;
    Ok(SubtitleInfo::new(
        &lang,
        path.map(PathBuf::from),
        checksum_column(row, first + 2)?,
    ))
}

fn with_subtitles(
    conn: &Connection,
    metadata_id: i64,
    mut record: MetadataRecord,
) -> rusqlite::Result<MetadataRecord> {
    let mut stmt = conn.prepare(
        "SELECT subtitle_lang, subtitle_location, checksum
         FROM Subtitles WHERE metadata_id_fk = ?1",
    )?;
    for subtitle in stmt.query_map(params![metadata_id], |row| subtitle_row(row, 0))? {
        let subtitle = subtitle?;
        record.subtitles.insert(subtitle.lang.clone(), subtitle);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::subtitles::record::subtitle_checksum;

    fn channel(byte: u8) -> Permid {
        Permid::from_slice(&[byte; 32]).unwrap()
    }

    fn record(timestamp: i64, langs: &[&str]) -> MetadataRecord {
        let mut record = MetadataRecord::new(channel(1), InfoHash::new([9; 20]), "film", timestamp);
        for lang in langs {
            record
                .add_subtitle(SubtitleInfo::new(
                    lang,
                    None,
                    subtitle_checksum(format!("{lang}-{timestamp}").as_bytes()),
                ))
                .unwrap();
        }
        record.signature = vec![timestamp as u8; 64];
        record
    }

    fn store() -> MetadataStore {
        MetadataStore::new(SubtitleDb::open_in_memory().unwrap(), EventBus::new())
    }

    fn subtitle_rows(store: &MetadataStore) -> i64 {
        store
            .db()
            .lock()
            .query_row("SELECT COUNT(*) FROM Subtitles", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = store();
        let record = record(10, &["eng", "ita"]);

        assert_eq!(store.insert(&record).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.get(&record.channel, &record.info_hash).unwrap(), Some(record));
        assert_eq!(store.get(&channel(2), &InfoHash::new([9; 20])).unwrap(), None);
    }

    #[test]
    fn test_same_record_twice_is_idempotent() {
        let store = store();
        let record = record(10, &["eng"]);
        let mut events = store.events.subscribe();

        store.insert(&record).unwrap();
        assert_eq!(store.insert(&record).unwrap(), InsertOutcome::Unchanged);

        assert!(matches!(events.try_recv(), Ok(CoreEvent::MetadataInserted { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_newer_record_diffs_subtitles() {
        let store = store();
        store.insert(&record(10, &["eng", "ita"])).unwrap();
        store
            .update_subtitle_path(&channel(1), &InfoHash::new([9; 20]), "ita", Some(Path::new("/subs/ita.srt")))
            .unwrap();

        let newer = record(20, &["ita", "nld"]);
        assert_eq!(store.insert(&newer).unwrap(), InsertOutcome::Updated);

        let stored = store.get(&newer.channel, &newer.info_hash).unwrap().unwrap();
        assert_eq!(stored.timestamp, 20);
        assert_eq!(stored.subtitles.keys().collect::<Vec<_>>(), vec!["ita", "nld"]);
        assert_eq!(stored.subtitles["ita"].checksum, newer.subtitles["ita"].checksum);
        // checksum changed, so the old file no longer applies
        assert_eq!(stored.subtitles["ita"].path, None);
        assert_eq!(subtitle_rows(&store), 2);
    }

    #[test]
    fn test_unchanged_checksum_keeps_local_path() {
        let store = store();
        let first = record(10, &["eng"]);
        store.insert(&first).unwrap();
        store
            .update_subtitle_path(&first.channel, &first.info_hash, "eng", Some(Path::new("/subs/eng.srt")))
            .unwrap();

        let mut newer = first.clone();
        newer.timestamp = 11;
        newer.description = "renamed".to_string();
        store.insert(&newer).unwrap();

        let stored = store.get_subtitle(&first.channel, &first.info_hash, "eng").unwrap().unwrap();
        assert_eq!(stored.path, Some(PathBuf::from("/subs/eng.srt")));
    }

    #[test]
    fn test_older_or_equal_timestamp_is_ignored() {
        let store = store();
        store.insert(&record(10, &["eng"])).unwrap();

        assert_eq!(store.insert(&record(9, &["ita"])).unwrap(), InsertOutcome::Unchanged);
        let stored = store.get(&channel(1), &InfoHash::new([9; 20])).unwrap().unwrap();
        assert_eq!(stored.timestamp, 10);
        assert!(stored.subtitles.contains_key("eng"));
    }

    #[test]
    fn test_delete_cascades() {
        let store = store();
        let record = record(10, &["eng", "ita", "nld"]);
        store.insert(&record).unwrap();
        assert_eq!(subtitle_rows(&store), 3);

        assert!(store.delete(&record.channel, &record.info_hash).unwrap());
        assert_eq!(subtitle_rows(&store), 0);
        assert!(!store.delete(&record.channel, &record.info_hash).unwrap());
    }

    #[test]
    fn test_update_missing_subtitle_is_noop() {
        let store = store();
        store
            .update_subtitle_path(&channel(5), &InfoHash::new([5; 20]), "eng", Some(Path::new("/x")))
            .unwrap();
        store.insert(&record(1, &["eng"])).unwrap();
        store
            .update_subtitle_path(&channel(1), &InfoHash::new([9; 20]), "ita", Some(Path::new("/x")))
            .unwrap();
        assert!(store.list_local_subtitles().unwrap().is_empty());
    }

    #[test]
    fn test_list_local_subtitles() {
        let store = store();
        let first = record(1, &["eng", "ita"]);
        let mut second = MetadataRecord::new(channel(2), InfoHash::new([7; 20]), "other", 1);
        second
            .add_subtitle(SubtitleInfo::new("nld", Some(PathBuf::from("/subs/nld.srt")), [1; 20]))
            .unwrap();
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();
        store
            .update_subtitle_path(&first.channel, &first.info_hash, "ita", Some(Path::new("/subs/ita.srt")))
            .unwrap();

        let local = store.list_local_subtitles().unwrap();
        assert_eq!(local.len(), 2);
        let ours = &local[&channel(1)][&InfoHash::new([9; 20])];
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].lang, "ita");
        assert_eq!(local[&channel(2)][&InfoHash::new([7; 20])][0].lang, "nld");
    }

    #[test]
    fn test_records_for_infohash_and_channels() {
        let store = store();
        let first = record(1, &["eng"]);
        let mut second = first.clone();
        second.channel = channel(3);
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let all = store.get_all_for_infohash(&first.info_hash).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            store.all_channels_with_metadata().unwrap(),
            vec![channel(1), channel(3)]
        );
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("subtitles.db");
        let record = record(4, &["eng"]);
        {
            let store = MetadataStore::new(SubtitleDb::open(&path).unwrap(), EventBus::new());
            store.insert(&record).unwrap();
        }
        let store = MetadataStore::new(SubtitleDb::open(&path).unwrap(), EventBus::new());
        assert_eq!(store.get(&record.channel, &record.info_hash).unwrap(), Some(record));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_stored_timestamp_never_decreases(timestamps in prop::collection::vec(0i64..50, 1..12)) {
            let store = store();
            let mut highest = i64::MIN;
            for timestamp in timestamps {
                store.insert(&record(timestamp, &["eng"])).unwrap();
                highest = highest.max(timestamp);
                let stored = store.get(&channel(1), &InfoHash::new([9; 20])).unwrap().unwrap();
                prop_assert_eq!(stored.timestamp, highest);
            }
        }
    }
}
