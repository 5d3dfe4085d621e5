//! Signed subtitle metadata published by a channel for one torrent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use super::SubtitleError;
use super::languages;
use super::signer::{SignatureVerifier, Signer};
use crate::bencode::Value;
use crate::torrent::{HASH_LEN, InfoHash, Permid, pack_u32_be, sha1_digest, unpack_u32_be};

/// Fields in the rich-metadata tuple carried by channelcast entries.
const WIRE_FIELDS: usize = 6;

/// SHA-1 over the UTF-8 decoding of `content`, invalid sequences replaced.
pub fn subtitle_checksum(content: &[u8]) -> [u8; HASH_LEN] {
    sha1_digest(String::from_utf8_lossy(content).as_bytes())
}

/// One subtitle of a metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleInfo {
    /// ISO 639-2 code
    pub lang: String,
    /// Local file, `None` when only the metadata is known
    pub path: Option<PathBuf>,
    #[serde(serialize_with = "serialize_hex")]
    pub checksum: [u8; HASH_LEN],
}

impl SubtitleInfo {
    pub fn new(lang: &str, path: Option<PathBuf>, checksum: [u8; HASH_LEN]) -> Self {
        Self {
            lang: lang.to_string(),
            path,
            checksum,
        }
    }

    /// Builds the info of a local subtitle file from its content.
    pub fn from_content(lang: &str, path: PathBuf, content: &[u8]) -> Self {
        Self::new(lang, Some(path), subtitle_checksum(content))
    }

    pub fn matches(&self, content: &[u8]) -> bool {
        subtitle_checksum(content) == self.checksum
    }
}

/// Rich metadata of `(channel, info_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    pub channel: Permid,
    pub info_hash: InfoHash,
    pub description: String,
    /// Publisher timestamp; newer records replace older ones
    pub timestamp: i64,
    /// Subtitles keyed by language code, so iteration follows bit order
    pub subtitles: BTreeMap<String, SubtitleInfo>,
    #[serde(serialize_with = "serialize_hex")]
    pub signature: Vec<u8>,
}

impl MetadataRecord {
    pub fn new(channel: Permid, info_hash: InfoHash, description: &str, timestamp: i64) -> Self {
        Self {
            channel,
            info_hash,
            description: description.to_string(),
            timestamp,
            subtitles: BTreeMap::new(),
            signature: Vec::new(),
        }
    }

    /// Adds or replaces a subtitle.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::UnsupportedLanguage` - If the language has no bit
    pub fn add_subtitle(&mut self, subtitle: SubtitleInfo) -> Result<(), SubtitleError> {
        languages::bit(&subtitle.lang)?;
        self.subtitles.insert(subtitle.lang.clone(), subtitle);
        Ok(())
    }

    pub fn subtitle(&self, lang: &str) -> Option<&SubtitleInfo> {
        self.subtitles.get(lang)
    }

    /// Bitmask of the languages this record carries.
    pub fn lang_mask(&self) -> u32 {
        self.subtitles
            .keys()
            .filter_map(|lang| languages::bit(lang).ok())
            .fold(0, |mask, bit| mask | bit)
    }

    /// Checksums in bitmask order.
    pub fn checksums(&self) -> Vec<[u8; HASH_LEN]> {
        self.subtitles.values().map(|subtitle| subtitle.checksum).collect()
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        Value::List(vec![
            Value::bytes(self.channel.as_bytes()),
            Value::bytes(self.info_hash.as_bytes()),
            Value::from(self.description.as_str()),
            Value::Integer(self.timestamp),
            Value::bytes(pack_u32_be(self.lang_mask())),
            self.checksum_list(),
        ])
        .to_bytes()
    }

    pub fn sign(&mut self, signer: &dyn Signer) {
        self.signature = signer.sign(&self.signing_payload());
    }

    /// # Errors
    ///
    /// - `SubtitleError::SignatureInvalid` - If the signature does not match the channel
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<(), SubtitleError> {
        if verifier.verify(&self.channel, &self.signing_payload(), &self.signature) {
            Ok(())
        } else {
            Err(SubtitleError::SignatureInvalid {
                channel: self.channel.short(),
                info_hash: self.info_hash,
            })
        }
    }

    /// Rich-metadata tuple for a channelcast entry; channel and infohash
    /// travel in the entry itself.
    pub fn to_wire(&self, have_mask: u32) -> Value {
        Value::List(vec![
            Value::from(self.description.as_str()),
            Value::Integer(self.timestamp),
            Value::bytes(pack_u32_be(self.lang_mask())),
            self.checksum_list(),
            Value::bytes(&self.signature),
            Value::bytes(pack_u32_be(have_mask)),
        ])
    }

    /// Rebuilds a record from a rich-metadata tuple and its carrier entry.
    ///
    /// Returns the record and the sender's have-mask. Paths are unknown.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Malformed` - If the tuple shape or field types are wrong
    /// - `SubtitleError::InvalidBitmask` - If a mask is not 4 bytes
    pub fn from_wire(
        channel: Permid,
        info_hash: InfoHash,
        value: &Value,
    ) -> Result<(Self, u32), SubtitleError> {
        let fields = value
            .as_list()
            .filter(|fields| fields.len() == WIRE_FIELDS)
            .ok_or_else(|| malformed("rich metadata is not a 6-tuple"))?;

        let description = fields[0]
            .as_bytes()
            .ok_or_else(|| malformed("description is not a string"))?;
        let timestamp = fields[1]
            .as_int()
            .ok_or_else(|| malformed("timestamp is not an integer"))?;
        let lang_mask = mask_field(&fields[2])?;
        let checksums = fields[3]
            .as_list()
            .ok_or_else(|| malformed("checksums is not a list"))?;
        let signature = fields[4]
            .as_bytes()
            .ok_or_else(|| malformed("signature is not a string"))?;
        let have_mask = mask_field(&fields[5])?;

        let codes = languages::codes_of(lang_mask);
        if codes.len() != checksums.len() {
            return Err(malformed("checksum count does not match language mask"));
        }

        let mut record = Self::new(
            channel,
            info_hash,
            &String::from_utf8_lossy(description),
            timestamp,
        );
        for (code, checksum) in codes.into_iter().zip(checksums) {
            let checksum: [u8; HASH_LEN] = checksum
                .as_bytes()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| malformed("checksum is not 20 bytes"))?;
            record
                .subtitles
                .insert(code.to_string(), SubtitleInfo::new(code, None, checksum));
        }
        record.signature = signature.to_vec();

        Ok((record, have_mask))
    }

    fn checksum_list(&self) -> Value {
        Value::List(
            self.checksums()
                .into_iter()
                .map(Value::bytes)
                .collect(),
        )
    }
}

fn mask_field(value: &Value) -> Result<u32, SubtitleError> {
    let bytes = value
        .as_bytes()
        .ok_or_else(|| malformed("bitmask is not a string"))?;
    unpack_u32_be(bytes).map_err(|_| SubtitleError::InvalidBitmask {
        length: bytes.len(),
    })
}

fn malformed(reason: &str) -> SubtitleError {
    SubtitleError::Malformed {
        reason: reason.to_string(),
    }
}

fn serialize_hex<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&hex::encode(bytes))
}
