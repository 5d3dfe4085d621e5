//! Torrent metainfo validation.
//!
//! Torrents are accepted whole or not at all. The validator keeps the decoded
//! value so that the infohash is always `SHA1(bencode(info))` of exactly what
//! was received, and so the file can be re-serialized byte for byte.

use std::path::PathBuf;

use crate::bencode::{self, BencodeError, Dict, Value};

use super::{HASH_LEN, InfoHash};

/// Validated BitTorrent v1 metainfo.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    info_hash: InfoHash,
    name: String,
    piece_length: u64,
    layout: FileLayout,
    pieces: Vec<[u8; HASH_LEN]>,
    root_hash: Option<[u8; HASH_LEN]>,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    nodes: Vec<(String, u16)>,
    url_list: Vec<String>,
    http_seeds: Vec<String>,
    private: bool,
    raw: Value,
}

/// Single-file XOR multi-file content layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    Single { length: u64 },
    Multi { files: Vec<FileEntry> },
}

/// One file of a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

impl FileEntry {
    /// Relative path of this file below the torrent directory.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// Reasons a metainfo is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetainfoError {
    #[error("Torrent is not valid bencode: {0}")]
    Encoding(#[from] BencodeError),

    #[error("Torrent root is not a dictionary")]
    NotADictionary,

    #[error("Missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Info dictionary has both 'length' and 'files'")]
    AmbiguousLayout,

    #[error("Info dictionary has neither 'length' nor 'files'")]
    MissingLayout,

    #[error("Pieces field of {length} bytes is not a multiple of 20")]
    InvalidPieces { length: usize },

    #[error("Invalid file path: {reason}")]
    InvalidPath { reason: String },

    #[error("Invalid P2P URL: {reason}")]
    InvalidP2pUrl { reason: String },
}

impl Metainfo {
    /// Decodes and validates raw `.torrent` bytes.
    ///
    /// # Errors
    ///
    /// - `MetainfoError::Encoding` - If the bytes are not canonical bencode
    /// - Any other `MetainfoError` - If a structural invariant is violated
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let value = bencode::decode(bytes)?;
        Self::from_value(value)
    }

    /// Validates an already decoded metainfo dictionary.
    ///
    /// # Errors
    ///
    /// - `MetainfoError` - If a structural invariant is violated
    pub fn from_value(raw: Value) -> Result<Self, MetainfoError> {
        let root = raw.as_dict().ok_or(MetainfoError::NotADictionary)?;
        let info_value = root
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField { field: "info" })?;
        let info = info_value.as_dict().ok_or(MetainfoError::InvalidField {
            field: "info",
            reason: "not a dictionary".to_string(),
        })?;

        let name = required_str(info, "name")?;
        if name.is_empty() {
            return Err(invalid("name", "empty"));
        }

        let piece_length = required_int(info, "piece length")?;
        if piece_length <= 0 {
            return Err(invalid("piece length", "must be positive"));
        }

        let layout = parse_layout(info)?;
        let root_hash = parse_root_hash(info)?;
        let pieces = parse_pieces(info, root_hash.is_some())?;
        let private = match info.get(b"private".as_slice()) {
            None => false,
            Some(value) => value.as_int().ok_or_else(|| invalid("private", "not an integer"))? == 1,
        };

        let announce = optional_str(root, "announce")?;
        let announce_list = parse_announce_list(root)?;
        let nodes = parse_nodes(root)?;
        let url_list = parse_url_list(root, "url-list")?;
        let http_seeds = parse_url_list(root, "httpseeds")?;

        let info_hash = InfoHash::of_info(&bencode::encode(info_value));

        Ok(Self {
            info_hash,
            name,
            piece_length: piece_length as u64,
            layout,
            pieces,
            root_hash,
            announce,
            announce_list,
            nodes,
            url_list,
            http_seeds,
            private,
            raw,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn pieces(&self) -> &[[u8; HASH_LEN]] {
        &self.pieces
    }

    pub fn root_hash(&self) -> Option<&[u8; HASH_LEN]> {
        self.root_hash.as_ref()
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn announce_list(&self) -> &[Vec<String>] {
        &self.announce_list
    }

    /// DHT bootstrap nodes as `(host, port)` pairs.
    pub fn nodes(&self) -> &[(String, u16)] {
        &self.nodes
    }

    pub fn url_list(&self) -> &[String] {
        &self.url_list
    }

    pub fn http_seeds(&self) -> &[String] {
        &self.http_seeds
    }

    /// Whether `info.private` is set; private torrents never leave this node.
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Sum of all file lengths.
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            FileLayout::Single { length } => *length,
            FileLayout::Multi { files } => files.iter().map(|file| file.length).sum(),
        }
    }

    /// Tracker tiers: `announce-list` when present and non-empty, otherwise
    /// a single tier holding `announce`.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        self.announce
            .iter()
            .map(|url| vec![url.clone()])
            .collect()
    }

    /// The decoded `info` dictionary.
    pub fn info(&self) -> Option<&Dict> {
        self.raw.get(b"info").and_then(Value::as_dict)
    }

    /// The full decoded metainfo.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Canonical `.torrent` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        bencode::encode(&self.raw)
    }
}

fn invalid(field: &'static str, reason: &str) -> MetainfoError {
    MetainfoError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn required_int(dict: &Dict, field: &'static str) -> Result<i64, MetainfoError> {
    dict.get(field.as_bytes())
        .ok_or(MetainfoError::MissingField { field })?
        .as_int()
        .ok_or_else(|| invalid(field, "not an integer"))
}

fn required_str(dict: &Dict, field: &'static str) -> Result<String, MetainfoError> {
    optional_str(dict, field)?.ok_or(MetainfoError::MissingField { field })
}

fn optional_str(dict: &Dict, field: &'static str) -> Result<Option<String>, MetainfoError> {
    match dict.get(field.as_bytes()) {
        None => Ok(None),
        Some(value) => value
            .as_bytes()
            .map(|bytes| Some(String::from_utf8_lossy(bytes).into_owned()))
            .ok_or_else(|| invalid(field, "not a byte string")),
    }
}

fn parse_layout(info: &Dict) -> Result<FileLayout, MetainfoError> {
    match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
        (Some(_), Some(_)) => Err(MetainfoError::AmbiguousLayout),
        (None, None) => Err(MetainfoError::MissingLayout),
        (Some(length), None) => {
            let length = length
                .as_int()
                .filter(|length| *length >= 0)
                .ok_or_else(|| invalid("length", "not a non-negative integer"))?;
            Ok(FileLayout::Single {
                length: length as u64,
            })
        }
        (None, Some(files)) => {
            let entries = files
                .as_list()
                .ok_or_else(|| invalid("files", "not a list"))?;
            if entries.is_empty() {
                return Err(invalid("files", "empty"));
            }
            let files = entries
                .iter()
                .map(parse_file_entry)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FileLayout::Multi { files })
        }
    }
}

fn parse_file_entry(entry: &Value) -> Result<FileEntry, MetainfoError> {
    let dict = entry
        .as_dict()
        .ok_or_else(|| invalid("files", "entry is not a dictionary"))?;
    let length = required_int(dict, "length")?;
    if length < 0 {
        return Err(invalid("length", "negative file length"));
    }

    let components = dict
        .get(b"path".as_slice())
        .ok_or(MetainfoError::MissingField { field: "path" })?
        .as_list()
        .ok_or_else(|| invalid("path", "not a list"))?;
    if components.is_empty() {
        return Err(MetainfoError::InvalidPath {
            reason: "empty path".to_string(),
        });
    }

    let mut path = Vec::with_capacity(components.len());
    for component in components {
        let bytes = component.as_bytes().ok_or_else(|| MetainfoError::InvalidPath {
            reason: "component is not a byte string".to_string(),
        })?;
        let text = String::from_utf8_lossy(bytes).into_owned();
        if text.is_empty() || text == "." || text == ".." || text.contains('/') {
            return Err(MetainfoError::InvalidPath {
                reason: format!("illegal component '{text}'"),
            });
        }
        path.push(text);
    }

    Ok(FileEntry {
        length: length as u64,
        path,
    })
}

fn parse_root_hash(info: &Dict) -> Result<Option<[u8; HASH_LEN]>, MetainfoError> {
    match info.get(b"root hash".as_slice()) {
        None => Ok(None),
        Some(value) => {
            let bytes = value
                .as_bytes()
                .ok_or_else(|| invalid("root hash", "not a byte string"))?;
            let hash: [u8; HASH_LEN] = bytes
                .try_into()
                .map_err(|_| invalid("root hash", "not 20 bytes"))?;
            Ok(Some(hash))
        }
    }
}

fn parse_pieces(info: &Dict, has_root_hash: bool) -> Result<Vec<[u8; HASH_LEN]>, MetainfoError> {
    let pieces = match info.get(b"pieces".as_slice()) {
        Some(value) => value
            .as_bytes()
            .ok_or_else(|| invalid("pieces", "not a byte string"))?,
        None if has_root_hash => return Ok(Vec::new()),
        None => return Err(MetainfoError::MissingField { field: "pieces" }),
    };

    if pieces.len() % HASH_LEN != 0 {
        if has_root_hash {
            return Ok(Vec::new());
        }
        return Err(MetainfoError::InvalidPieces {
            length: pieces.len(),
        });
    }

    Ok(pieces
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_announce_list(root: &Dict) -> Result<Vec<Vec<String>>, MetainfoError> {
    let Some(value) = root.get(b"announce-list".as_slice()) else {
        return Ok(Vec::new());
    };
    let tiers = value
        .as_list()
        .ok_or_else(|| invalid("announce-list", "not a list"))?;

    let mut parsed = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let urls = tier
            .as_list()
            .ok_or_else(|| invalid("announce-list", "tier is not a list"))?;
        let urls = urls
            .iter()
            .map(|url| {
                url.as_bytes()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .ok_or_else(|| invalid("announce-list", "url is not a byte string"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if !urls.is_empty() {
            parsed.push(urls);
        }
    }
    Ok(parsed)
}

fn parse_nodes(root: &Dict) -> Result<Vec<(String, u16)>, MetainfoError> {
    let Some(value) = root.get(b"nodes".as_slice()) else {
        return Ok(Vec::new());
    };
    let nodes = value.as_list().ok_or_else(|| invalid("nodes", "not a list"))?;

    nodes
        .iter()
        .map(|node| {
            let pair = node
                .as_list()
                .filter(|pair| pair.len() == 2)
                .ok_or_else(|| invalid("nodes", "node is not a [host, port] pair"))?;
            let host = pair[0]
                .as_str()
                .ok_or_else(|| invalid("nodes", "host is not text"))?;
            let port = pair[1]
                .as_int()
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| invalid("nodes", "port out of range"))?;
            Ok((host.to_string(), port))
        })
        .collect()
}

/// `url-list` and `httpseeds` may be a single string or a list of strings.
fn parse_url_list(root: &Dict, field: &'static str) -> Result<Vec<String>, MetainfoError> {
    match root.get(field.as_bytes()) {
        None => Ok(Vec::new()),
        Some(Value::Bytes(bytes)) => Ok(vec![String::from_utf8_lossy(bytes).into_owned()]),
        Some(Value::List(items)) => items
            .iter()
            .map(|item| {
                item.as_bytes()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .ok_or_else(|| invalid(field, "entry is not a byte string"))
            })
            .collect(),
        Some(_) => Err(invalid(field, "not a string or list")),
    }
}
