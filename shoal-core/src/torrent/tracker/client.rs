//! HTTP tracker client implementation with URL building and response parsing

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use super::TrackerError;
use super::types::{AnnounceParams, AnnounceResponse, Peer, ScrapeStats};
use crate::bencode::{self, Dict, Value};
use crate::network::Fetch;
use crate::torrent::{InfoHash, PeerId};

/// Size of one compact peer record: 4 address bytes and a big-endian port.
pub const COMPACT_PEER_LEN: usize = 6;

/// HTTP tracker client.
///
/// Stateless apart from the fetcher; announce state lives in the rerequester.
#[derive(Clone)]
pub struct HttpTrackerClient {
    fetch: Arc<dyn Fetch>,
}

impl HttpTrackerClient {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }

    /// Announces to `tracker` and decodes the reply.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Fetch` - If the HTTP exchange fails
    /// - `TrackerError::BadData` - If the reply is not a usable dictionary
    /// - `TrackerError::Rejected` - If the tracker returned `failure reason`
    pub async fn announce(
        &self,
        tracker: &str,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = Self::build_announce_url(tracker, params);
        tracing::debug!(tracker, event = ?params.event, "Announcing to tracker");

        let body = self.fetch.get(&url).await?;
        Self::parse_announce_response(&body)
    }

    /// Scrapes swarm statistics for `info_hash`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::NoScrapeUrl` - If the announce URL has no scrape form
    /// - `TrackerError::Fetch` - If the HTTP exchange fails
    /// - `TrackerError::BadData` - If the reply lacks the torrent
    pub async fn scrape(
        &self,
        tracker: &str,
        info_hash: &InfoHash,
    ) -> Result<ScrapeStats, TrackerError> {
        let scrape_url = Self::scrape_url(tracker).ok_or_else(|| TrackerError::NoScrapeUrl {
            url: tracker.to_string(),
        })?;
        let url = format!(
            "{scrape_url}{}info_hash={}",
            query_separator(&scrape_url),
            url_encode_bytes(info_hash.as_bytes())
        );

        let body = self.fetch.get(&url).await?;
        Self::parse_scrape_response(&body, info_hash)
    }

    /// Builds the announce URL for `tracker`.
    ///
    /// Binary values are percent-encoded, keeping only RFC 3986 unreserved
    /// characters literal.
    pub fn build_announce_url(tracker: &str, params: &AnnounceParams) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
            url_encode_bytes(params.info_hash.as_bytes()),
            url_encode_bytes(params.peer_id.as_bytes()),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );

        if let Some(last) = &params.last {
            query.push_str(&format!("&last={}", urlencoding::encode(last)));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        if params.want_peers {
            query.push_str("&no_peer_id=1&compact=1");
        } else {
            query.push_str("&numwant=0");
        }
        if let Some(event) = params.event.as_param() {
            query.push_str(&format!("&event={event}"));
        }
        if let Some(ip) = &params.ip {
            query.push_str(&format!("&ip={}", urlencoding::encode(ip)));
        }
        query.push_str(&format!("&key={}", params.key));

        format!("{tracker}{}{query}", query_separator(tracker))
    }

    /// Derives the BEP 48 scrape URL by replacing the final `announce`
    /// path segment with `scrape`.
    pub fn scrape_url(announce_url: &str) -> Option<String> {
        let (base, query) = match announce_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (announce_url, None),
        };
        let slash = base.rfind('/')?;
        let segment = &base[slash + 1..];
        let rest = segment.strip_prefix("announce")?;

        let mut scrape = format!("{}/scrape{rest}", &base[..slash]);
        if let Some(query) = query {
            scrape.push('?');
            scrape.push_str(query);
        }
        Some(scrape)
    }

    /// Parses compact peers: 6-byte blocks of IPv4 address and port.
    ///
    /// # Errors
    ///
    /// - `TrackerError::BadData` - If the length is not a multiple of 6
    pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
        if peer_bytes.len() % COMPACT_PEER_LEN != 0 {
            return Err(TrackerError::BadData {
                reason: format!(
                    "compact peer list of {} bytes is not a multiple of 6",
                    peer_bytes.len()
                ),
            });
        }

        Ok(peer_bytes
            .chunks_exact(COMPACT_PEER_LEN)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer {
                    addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                    peer_id: None,
                }
            })
            .collect())
    }

    /// Parses the dictionary peer form: `[{ip, port, peer id?}]`.
    ///
    /// Entries whose `ip` is a hostname are skipped; they cannot be dialled
    /// without a lookup and trackers only send them by mistake.
    ///
    /// # Errors
    ///
    /// - `TrackerError::BadData` - If an entry is malformed
    pub fn parse_dict_peers(entries: &[Value]) -> Result<Vec<Peer>, TrackerError> {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            let dict = entry.as_dict().ok_or_else(|| bad_data("peer entry is not a dictionary"))?;
            let ip = dict
                .get(b"ip".as_slice())
                .and_then(Value::as_str)
                .ok_or_else(|| bad_data("peer ip is not a string"))?;
            let port = dict
                .get(b"port".as_slice())
                .and_then(Value::as_int)
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port != 0)
                .ok_or_else(|| bad_data("peer port is invalid"))?;
            let peer_id = match dict.get(b"peer id".as_slice()) {
                None => None,
                Some(value) => {
                    let bytes = value.as_bytes().ok_or_else(|| bad_data("peer id is not a string"))?;
                    Some(PeerId::from_slice(bytes).map_err(|e| bad_data(&e.to_string()))?)
                }
            };

            match ip.parse::<IpAddr>() {
                Ok(address) => peers.push(Peer {
                    addr: SocketAddr::new(address, port),
                    peer_id,
                }),
                Err(_) => tracing::debug!(ip, "Skipping tracker peer with hostname address"),
            }
        }
        Ok(peers)
    }

    /// Decodes an announce reply.
    ///
    /// Replies are decoded sloppily: trailing garbage and unsorted keys are
    /// common in the wild.
    ///
    /// # Errors
    ///
    /// - `TrackerError::BadData` - If the reply is not a well-formed dictionary
    /// - `TrackerError::Rejected` - If the tracker returned `failure reason`
    pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
        if body.is_empty() {
            return Err(TrackerError::Trouble {
                reason: "no data from tracker".to_string(),
            });
        }
        let value = bencode::decode_sloppy(body).map_err(|e| bad_data(&e.to_string()))?;
        let dict = value
            .as_dict()
            .ok_or_else(|| bad_data("reply is not a dictionary"))?;

        if let Some(reason) = dict.get(b"failure reason".as_slice()) {
            let reason = reason
                .as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(TrackerError::Rejected { reason });
        }

        let peers = match dict.get(b"peers".as_slice()) {
            None => Vec::new(),
            Some(Value::Bytes(compact)) => Self::parse_compact_peers(compact)?,
            Some(Value::List(entries)) => Self::parse_dict_peers(entries)?,
            Some(_) => return Err(bad_data("peers is neither a string nor a list")),
        };

        let num_peers = non_negative(dict, "num peers").or_else(|| {
            let complete = non_negative(dict, "complete")?;
            let incomplete = non_negative(dict, "incomplete")?;
            Some(complete + incomplete)
        });
        let done_peers = non_negative(dict, "done peers").or_else(|| non_negative(dict, "complete"));

        Ok(AnnounceResponse {
            interval: non_negative(dict, "interval").map(Duration::from_secs),
            min_interval: non_negative(dict, "min interval").map(Duration::from_secs),
            tracker_id: text(dict, "tracker id"),
            last: match dict.get(b"last".as_slice()) {
                Some(Value::Integer(last)) => Some(last.to_string()),
                Some(Value::Bytes(last)) => Some(String::from_utf8_lossy(last).into_owned()),
                _ => None,
            },
            num_peers,
            done_peers,
            peers,
            warning: text(dict, "warning message"),
        })
    }

    /// Decodes a scrape reply and extracts the entry for `info_hash`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::BadData` - If the reply is malformed or lacks the torrent
    /// - `TrackerError::Rejected` - If the tracker returned `failure reason`
    pub fn parse_scrape_response(
        body: &[u8],
        info_hash: &InfoHash,
    ) -> Result<ScrapeStats, TrackerError> {
        let value = bencode::decode_sloppy(body).map_err(|e| bad_data(&e.to_string()))?;
        if let Some(reason) = value.get(b"failure reason").and_then(Value::as_bytes) {
            return Err(TrackerError::Rejected {
                reason: String::from_utf8_lossy(reason).into_owned(),
            });
        }

        let stats = value
            .get(b"files")
            .and_then(|files| files.get(info_hash.as_bytes()))
            .and_then(Value::as_dict)
            .ok_or_else(|| bad_data("scrape reply does not list the torrent"))?;

        Ok(ScrapeStats {
            complete: non_negative(stats, "complete").unwrap_or(0),
            downloaded: non_negative(stats, "downloaded").unwrap_or(0),
            incomplete: non_negative(stats, "incomplete").unwrap_or(0),
        })
    }
}

/// Percent-encodes arbitrary bytes, keeping RFC 3986 unreserved characters.
pub fn url_encode_bytes(bytes: &[u8]) -> String {
    urlencoding::encode_binary(bytes).into_owned()
}

fn query_separator(url: &str) -> char {
    if url.contains('?') { '&' } else { '?' }
}

fn bad_data(reason: &str) -> TrackerError {
    TrackerError::BadData {
        reason: reason.to_string(),
    }
}

fn non_negative(dict: &Dict, key: &str) -> Option<u64> {
    dict.get(key.as_bytes())
        .and_then(Value::as_int)
        .and_then(|value| u64::try_from(value).ok())
}

fn text(dict: &Dict, key: &str) -> Option<String> {
    dict.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}
