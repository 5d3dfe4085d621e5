//! Overlay message framing and the single-reactor bridge.
//!
//! Every overlay message is one tag byte followed by a bencoded body. The
//! [`bridge`] actor owns all overlay-side state and dispatches inbound
//! messages by tag.

pub mod bridge;
pub mod commands;
pub mod handle;

pub use bridge::{OverlayContext, OverlayDeps, spawn_overlay};
pub use commands::{OverlayCommand, SubsCallback};
pub use handle::OverlayHandle;

use crate::bencode::{self, BencodeError, Value};
use crate::torrent::{InfoHash, Permid};

/// First protocol version carrying URL-form metadata and digest statistics.
pub const OLPROTO_VER_ELEVENTH: u32 = 11;
/// First protocol version carrying rich metadata and subtitle exchange.
pub const OLPROTO_VER_FOURTEENTH: u32 = 14;
pub const OLPROTO_VER_CURRENT: u32 = OLPROTO_VER_FOURTEENTH;

/// One-byte overlay message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Channelcast = 225,
    Subs = 221,
    GetSubs = 222,
    SocialOverlap = 229,
    GetMetadata = 234,
    Metadata = 235,
}

impl MessageTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            225 => Some(MessageTag::Channelcast),
            221 => Some(MessageTag::Subs),
            222 => Some(MessageTag::GetSubs),
            229 => Some(MessageTag::SocialOverlap),
            234 => Some(MessageTag::GetMetadata),
            235 => Some(MessageTag::Metadata),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Prefixes the bencoding of `body` with `tag`.
pub fn frame(tag: MessageTag, body: &Value) -> Vec<u8> {
    let mut message = vec![tag.as_byte()];
    bencode::encode_into(body, &mut message);
    message
}

/// Splits a raw overlay message into its tag byte and body.
///
/// # Errors
///
/// - `OverlayError::EmptyMessage` - If `message` is empty
pub fn split_frame(message: &[u8]) -> Result<(u8, &[u8]), OverlayError> {
    match message.split_first() {
        Some((tag, body)) => Ok((*tag, body)),
        None => Err(OverlayError::EmptyMessage),
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Outbound path of the overlay connection layer.
pub trait OverlaySender: Send + Sync {
    /// Queues `message` for `peer`.
    ///
    /// # Errors
    ///
    /// - `OverlayError::SendFailed` - If the peer is not connected
    fn send(&self, peer: &Permid, message: Vec<u8>) -> Result<(), OverlayError>;
}

/// One torrent entry of a channelcast gossip message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelcastEntry {
    pub channel: Permid,
    pub info_hash: InfoHash,
    pub name: String,
    pub timestamp: i64,
    /// Subtitle metadata piggybacked by the interceptor
    pub rich_metadata: Option<Value>,
}

impl ChannelcastEntry {
    pub fn to_value(&self) -> Value {
        let mut entry = vec![
            ("publisher_id", Value::bytes(self.channel.as_bytes())),
            ("infohash", Value::bytes(self.info_hash.as_bytes())),
            ("torrentname", Value::from(self.name.as_str())),
            ("timestamp", Value::Integer(self.timestamp)),
        ];
        if let Some(rich_metadata) = &self.rich_metadata {
            entry.push(("rich_metadata", rich_metadata.clone()));
        }
        Value::dict(entry)
    }

    /// # Errors
    ///
    /// - `OverlayError::Malformed` - If a field is missing or invalid
    pub fn from_value(value: &Value) -> Result<Self, OverlayError> {
        let malformed = |reason: &str| OverlayError::Malformed {
            reason: reason.to_string(),
        };

        let channel = value
            .get(b"publisher_id")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing publisher_id"))?;
        let channel = Permid::from_slice(channel).map_err(|e| malformed(&e.to_string()))?;
        let info_hash = value
            .get(b"infohash")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing infohash"))?;
        let info_hash = InfoHash::try_from(info_hash).map_err(|e| malformed(&e.to_string()))?;
        let name = value
            .get(b"torrentname")
            .and_then(Value::as_bytes)
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default();
        let timestamp = value
            .get(b"timestamp")
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("missing timestamp"))?;

        Ok(Self {
            channel,
            info_hash,
            name,
            timestamp,
            rich_metadata: value.get(b"rich_metadata").cloned(),
        })
    }
}

/// Encodes a CHANNELCAST message.
pub fn encode_channelcast(entries: &[ChannelcastEntry]) -> Vec<u8> {
    let body = Value::List(entries.iter().map(ChannelcastEntry::to_value).collect());
    frame(MessageTag::Channelcast, &body)
}

/// Decodes the body of a CHANNELCAST message, skipping invalid entries.
///
/// # Errors
///
/// - `OverlayError::BadEncoding` - If the body is not canonical bencode
/// - `OverlayError::Malformed` - If the body is not a list
pub fn decode_channelcast(body: &[u8]) -> Result<Vec<ChannelcastEntry>, OverlayError> {
    let value = bencode::decode(body)?;
    let entries = value.as_list().ok_or_else(|| OverlayError::Malformed {
        reason: "channelcast is not a list".to_string(),
    })?;

    Ok(entries
        .iter()
        .filter_map(|entry| match ChannelcastEntry::from_value(entry) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!(%error, "Skipping channelcast entry");
                None
            }
        })
        .collect())
}

/// Errors raised by overlay framing and the bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    #[error("Empty overlay message")]
    EmptyMessage,

    #[error("Bad encoding: {0}")]
    BadEncoding(#[from] BencodeError),

    #[error("Malformed overlay message: {reason}")]
    Malformed { reason: String },

    #[error("Send to {peer} failed: {reason}")]
    SendFailed { peer: String, reason: String },

    #[error("Overlay bridge has shut down")]
    EngineShutdown,
}
