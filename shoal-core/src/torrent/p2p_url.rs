//! P2P URLs: single-file Merkle torrents expressed as a URL.
//!
//! `p2p://<tracker host>[:port]/<announce path>?n=<name>&l=<length>&s=<piece length>&r=<root hash hex>`
//!
//! The URL carries every field of the info dictionary, so materializing it
//! on the receiving side reproduces the original infohash exactly. Only
//! torrents whose info dictionary holds precisely these four keys and whose
//! tracker speaks HTTP can be expressed this way.

use url::Url;

use crate::bencode::Value;

use super::{HASH_LEN, Metainfo, MetainfoError};

pub const P2P_URL_SCHEME: &str = "p2p";

const URL_INFO_KEYS: [&[u8]; 4] = [b"length", b"name", b"piece length", b"root hash"];

/// Expresses `metainfo` as a P2P URL, if it is URL compatible.
pub fn to_p2p_url(metainfo: &Metainfo) -> Option<String> {
    let info = metainfo.info()?;
    let keys_match = info.len() == URL_INFO_KEYS.len()
        && URL_INFO_KEYS.iter().all(|key| info.contains_key(*key));
    if !keys_match {
        return None;
    }

    let root_hash = metainfo.root_hash()?;
    let length = match metainfo.layout() {
        super::FileLayout::Single { length } => *length,
        super::FileLayout::Multi { .. } => return None,
    };

    let tracker = Url::parse(metainfo.announce()?).ok()?;
    if tracker.scheme() != "http" {
        return None;
    }
    let host = tracker.host_str()?;

    let mut url = Url::parse(&format!("{P2P_URL_SCHEME}://{host}")).ok()?;
    url.set_port(tracker.port()).ok()?;
    url.set_path(tracker.path());
    url.query_pairs_mut()
        .append_pair("n", metainfo.name())
        .append_pair("l", &length.to_string())
        .append_pair("s", &metainfo.piece_length().to_string())
        .append_pair("r", &hex::encode(root_hash));

    Some(url.to_string())
}

/// Materializes a P2P URL into a full metainfo.
///
/// # Errors
///
/// - `MetainfoError::InvalidP2pUrl` - If the URL is malformed or incomplete
pub fn materialize(p2p_url: &str) -> Result<Metainfo, MetainfoError> {
    let url = Url::parse(p2p_url).map_err(|e| url_error(&e.to_string()))?;
    if url.scheme() != P2P_URL_SCHEME {
        return Err(url_error(&format!("unexpected scheme '{}'", url.scheme())));
    }
    let host = url.host_str().ok_or_else(|| url_error("missing tracker host"))?;

    let mut name = None;
    let mut length = None;
    let mut piece_length = None;
    let mut root_hash = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "n" => name = Some(value.into_owned()),
            "l" => length = value.parse::<i64>().ok(),
            "s" => piece_length = value.parse::<i64>().ok(),
            "r" => root_hash = hex::decode(value.as_ref()).ok(),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| url_error("missing name"))?;
    let length = length
        .filter(|length| *length >= 0)
        .ok_or_else(|| url_error("missing or invalid length"))?;
    let piece_length = piece_length
        .filter(|size| *size > 0)
        .ok_or_else(|| url_error("missing or invalid piece length"))?;
    let root_hash = root_hash
        .filter(|hash| hash.len() == HASH_LEN)
        .ok_or_else(|| url_error("missing or invalid root hash"))?;

    let announce = match url.port() {
        Some(port) => format!("http://{host}:{port}{}", url.path()),
        None => format!("http://{host}{}", url.path()),
    };

    let metainfo = Value::dict([
        ("announce", Value::from(announce)),
        (
            "info",
            Value::dict([
                ("name", Value::from(name)),
                ("length", Value::Integer(length)),
                ("piece length", Value::Integer(piece_length)),
                ("root hash", Value::Bytes(root_hash)),
            ]),
        ),
    ]);
    Metainfo::from_value(metainfo)
}

fn url_error(reason: &str) -> MetainfoError {
    MetainfoError::InvalidP2pUrl {
        reason: reason.to_string(),
    }
}
