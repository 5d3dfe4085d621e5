//! GET_METADATA and METADATA message codecs.

use super::MetadataError;
use super::catalog::{SwarmStats, TorrentStatus};
use crate::bencode::{self, Value};
use crate::overlay::{MessageTag, frame};
use crate::torrent::InfoHash;

const METATYPE_TORRENT: &str = "torrent";
const METATYPE_URL: &str = "url";

/// Body of a METADATA message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataPayload {
    /// Raw bencoded torrent file
    Torrent(Vec<u8>),
    /// P2P URL resolvable to a metainfo
    Url(String),
}

/// Decoded METADATA message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub info_hash: InfoHash,
    pub payload: MetadataPayload,
    pub stats: Option<SwarmStats>,
}

/// Encodes a GET_METADATA request for `info_hash`.
pub fn encode_get_metadata(info_hash: &InfoHash) -> Vec<u8> {
    frame(MessageTag::GetMetadata, &Value::bytes(info_hash.as_bytes()))
}

/// # Errors
///
/// - `MetadataError::BadEncoding` - If the body is not bencode
/// - `MetadataError::InvalidInfohash` - If the body is not a 20-byte string
pub fn decode_get_metadata(body: &[u8]) -> Result<InfoHash, MetadataError> {
    let value = bencode::decode(body)?;
    let bytes = value
        .as_bytes()
        .ok_or(MetadataError::InvalidInfohash { length: 0 })?;
    InfoHash::try_from(bytes).map_err(|_| MetadataError::InvalidInfohash {
        length: bytes.len(),
    })
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (metatype, metadata) = match &self.payload {
            MetadataPayload::Torrent(torrent) => (METATYPE_TORRENT, Value::bytes(torrent)),
            MetadataPayload::Url(url) => (METATYPE_URL, Value::from(url.as_str())),
        };

        let mut body = vec![
            ("torrent_hash", Value::bytes(self.info_hash.as_bytes())),
            ("metatype", Value::from(metatype)),
            ("metadata", metadata),
        ];
        if let Some(stats) = &self.stats {
            body.push(("leecher", Value::Integer(stats.leechers)));
            body.push(("seeder", Value::Integer(stats.seeders)));
            body.push(("last_check_time", Value::Integer(stats.last_check)));
            body.push(("status", Value::from(stats.status.as_str())));
        }
        frame(MessageTag::Metadata, &Value::dict(body))
    }

    /// # Errors
    ///
    /// - `MetadataError::BadEncoding` - If the body is not bencode
    /// - `MetadataError::InvalidInfohash` - If `torrent_hash` is not 20 bytes
    /// - `MetadataError::Malformed` - If a required field is missing
    pub fn decode(body: &[u8]) -> Result<Self, MetadataError> {
        let value = bencode::decode(body)?;
        if value.as_dict().is_none() {
            return Err(malformed("message is not a dictionary"));
        }

        let hash = value
            .get(b"torrent_hash")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing torrent_hash"))?;
        let info_hash = InfoHash::try_from(hash)
            .map_err(|_| MetadataError::InvalidInfohash { length: hash.len() })?;

        let metadata = value
            .get(b"metadata")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing metadata"))?;
        let payload = match value.get(b"metatype").and_then(Value::as_str) {
            // Senders before URL support omit the metatype
            None | Some(METATYPE_TORRENT) => MetadataPayload::Torrent(metadata.to_vec()),
            Some(METATYPE_URL) => {
                let url = std::str::from_utf8(metadata).map_err(|_| malformed("url is not utf-8"))?;
                MetadataPayload::Url(url.to_string())
            }
            Some(other) => return Err(malformed(&format!("unknown metatype {other}"))),
        };

        let stats = match (
            value.get(b"seeder").and_then(Value::as_int),
            value.get(b"leecher").and_then(Value::as_int),
        ) {
            (Some(seeders), Some(leechers)) => Some(SwarmStats {
                seeders,
                leechers,
                last_check: value
                    .get(b"last_check_time")
                    .and_then(Value::as_int)
                    .unwrap_or(0),
                status: value
                    .get(b"status")
                    .and_then(Value::as_str)
                    .map(TorrentStatus::parse)
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            info_hash,
            payload,
            stats,
        })
    }

    pub fn payload_len(&self) -> usize {
        match &self.payload {
            MetadataPayload::Torrent(torrent) => torrent.len(),
            MetadataPayload::Url(url) => url.len(),
        }
    }
}

fn malformed(reason: &str) -> MetadataError {
    MetadataError::Malformed {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_metadata_round_trip() {
        let info_hash = InfoHash::new([0xab; 20]);
        let message = encode_get_metadata(&info_hash);

        assert_eq!(message[0], MessageTag::GetMetadata.as_byte());
        assert_eq!(decode_get_metadata(&message[1..]).unwrap(), info_hash);
    }

    #[test]
    fn test_get_metadata_rejects_short_hash() {
        let body = Value::bytes([1u8; 19]).to_bytes();
        assert!(matches!(
            decode_get_metadata(&body),
            Err(MetadataError::InvalidInfohash { length: 19 })
        ));
        assert!(matches!(
            decode_get_metadata(b"i5e"),
            Err(MetadataError::InvalidInfohash { .. })
        ));
        assert!(matches!(
            decode_get_metadata(b"20:short"),
            Err(MetadataError::BadEncoding(_))
        ));
    }

    #[test]
    fn test_metadata_message_with_stats() {
        let message = MetadataMessage {
            info_hash: InfoHash::new([3; 20]),
            payload: MetadataPayload::Url("p2p://tracker.example/announce?n=x".to_string()),
            stats: Some(SwarmStats {
                seeders: 4,
                leechers: 9,
                last_check: 1_700_000_000,
                status: TorrentStatus::Good,
            }),
        };

        let encoded = message.encode();
        assert_eq!(encoded[0], MessageTag::Metadata.as_byte());
        assert_eq!(MetadataMessage::decode(&encoded[1..]).unwrap(), message);
    }

    #[test]
    fn test_metadata_without_metatype_is_torrent() {
        let body = Value::dict([
            ("torrent_hash", Value::bytes([5u8; 20])),
            ("metadata", Value::bytes(b"d4:infode")),
        ])
        .to_bytes();

        let message = MetadataMessage::decode(&body).unwrap();
        assert_eq!(message.payload, MetadataPayload::Torrent(b"d4:infode".to_vec()));
        assert_eq!(message.stats, None);
    }

    #[test]
    fn test_metadata_unknown_metatype() {
        let body = Value::dict([
            ("torrent_hash", Value::bytes([5u8; 20])),
            ("metatype", Value::from("magnet")),
            ("metadata", Value::bytes(b"x")),
        ])
        .to_bytes();

        assert!(matches!(
            MetadataMessage::decode(&body),
            Err(MetadataError::Malformed { .. })
        ));
    }
}
