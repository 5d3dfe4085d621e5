//! BitTorrent identifiers, metainfo validation and tracker interaction

pub mod metainfo;
pub mod p2p_url;
pub mod tracker;
pub mod wire;

use std::fmt;

use bytes::Bytes;
use rand::Rng;
use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};

pub use metainfo::{FileEntry, FileLayout, Metainfo, MetainfoError};
pub use tracker::{
    AnnounceCycle, AnnounceEvent, HttpTrackerClient, Peer, Rerequester, SuccessLatch,
    TrackerError, TrackerTiers,
};
pub use wire::{pack_u32_be, unpack_u32_be};

/// Length in bytes of infohashes, peer ids and SHA-1 digests.
pub const HASH_LEN: usize = 20;

/// Upper bound on the length of an overlay permid.
pub const MAX_PERMID_LEN: usize = 512;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the canonical bencoding of the info dictionary.
/// Equality and hashing are byte identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; HASH_LEN]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    /// Validates and copies an infohash received from the network.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInfohash` - If `bytes` is not exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TorrentError> {
        let hash: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidInfohash {
                length: bytes.len(),
            })?;
        Ok(Self(hash))
    }

    /// Parses a 40 character hexadecimal infohash.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInfohash` - If the text is not 40 hex digits
    pub fn from_hex(text: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(text.trim()).map_err(|_| TorrentError::InvalidInfohash {
            length: text.len() / 2,
        })?;
        Self::from_slice(&bytes)
    }

    /// Computes the infohash of an already bencoded info dictionary.
    pub fn of_info(info_bytes: &[u8]) -> Self {
        Self(sha1_digest(info_bytes))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = TorrentError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(bytes)
    }
}

/// 20-byte peer identifier sent to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; HASH_LEN]);

impl PeerId {
    pub fn new(id: [u8; HASH_LEN]) -> Self {
        Self(id)
    }

    /// Generates a peer id from an Azureus-style client prefix such as `-SH0100-`.
    ///
    /// The remainder is filled with random alphanumeric bytes.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id = [0u8; HASH_LEN];
        let prefix = client_prefix.as_bytes();
        let prefix_len = prefix.len().min(HASH_LEN);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);

        let mut rng = rand::rng();
        for byte in &mut id[prefix_len..] {
            *byte = rng.sample(rand::distr::Alphanumeric);
        }
        Self(id)
    }

    /// Validates a peer id decoded from a tracker peer dictionary.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidPeerId` - If `bytes` is not 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TorrentError> {
        let id: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidPeerId {
                length: bytes.len(),
            })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Public-key derived identity of an overlay peer.
///
/// Opaque to everything except the `Signer` that verifies signatures
/// against it. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permid(Bytes);

impl Permid {
    /// Validates a permid received from the network.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidPermid` - If the permid is empty or longer than 512 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TorrentError> {
        if bytes.is_empty() || bytes.len() > MAX_PERMID_LEN {
            return Err(TorrentError::InvalidPermid {
                length: bytes.len(),
            });
        }
        Ok(Self(Bytes::copy_from_slice(bytes)))
    }

    /// Permid of a 32-byte public key.
    pub fn from_public_key(key: &[u8; 32]) -> Self {
        Self(Bytes::copy_from_slice(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hexadecimal rendering used in log lines.
    pub fn short(&self) -> String {
        let prefix = &self.0[..self.0.len().min(6)];
        hex::encode(prefix)
    }
}

impl fmt::Debug for Permid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permid({})", self.short())
    }
}

impl fmt::Display for Permid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Serialize for Permid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

/// SHA-1 digest of `data` as a fixed array.
pub fn sha1_digest(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Errors raised when validating identifiers at ingress.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid infohash: expected 20 bytes, got {length}")]
    InvalidInfohash { length: usize },

    #[error("Invalid peer id: expected 20 bytes, got {length}")]
    InvalidPeerId { length: usize },

    #[error("Invalid permid of {length} bytes")]
    InvalidPermid { length: usize },

    #[error("Invalid bitmask: expected 4 bytes, got {length}")]
    InvalidBitmask { length: usize },
}
