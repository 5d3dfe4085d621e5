//! Bounded HTTP GET used for tracker announces and scrapes.
//!
//! Redirects are followed by hand so the total request count is exact:
//! a fetch never issues more than `max_requests` requests. Gzip bodies are
//! decoded by reqwest; a body that fails to decode is reported as corrupt.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::LOCATION;
use url::Url;

use crate::bencode;
use crate::config::HttpConfig;

/// Source of HTTP response bodies.
///
/// Abstracted so tracker logic can be exercised against scripted responses.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches `url` and returns the response body.
    ///
    /// # Errors
    ///
    /// - `FetchError` - If the request fails or the response is unusable
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Errors raised by the HTTP fetcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Unsupported URL scheme in {url}")]
    UnsupportedScheme { url: String },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Too many redirects fetching {url} (limit {limit})")]
    RedirectRecursion { url: String, limit: usize },

    #[error("HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Corrupt response body from {url}")]
    CorruptResponse { url: String },

    #[error("Response from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("Failed to build HTTP client: {reason}")]
    ClientBuild { reason: String },
}

/// reqwest-backed fetcher with a manual redirect cap.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_requests: usize,
    max_body_bytes: usize,
}

impl HttpFetcher {
    /// Creates a fetcher from HTTP configuration.
    ///
    /// # Errors
    ///
    /// - `FetchError::ClientBuild` - If the TLS or connector setup fails
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .build()
            .map_err(|e| FetchError::ClientBuild {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            max_requests: config.max_requests.max(1),
            max_body_bytes: config.max_body_bytes,
        })
    }

    async fn read_body(
        &self,
        url: &Url,
        mut response: reqwest::Response,
    ) -> Result<Vec<u8>, FetchError> {
        let mut body = Vec::new();
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| map_body_error(url, &e))?;
            let Some(chunk) = chunk else {
                return Ok(body);
            };
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let original = parse_http_url(url)?;
        let mut current = original.clone();

        for request_number in 1..=self.max_requests {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| map_send_error(&current, &e))?;

            let status = response.status();
            if matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| FetchError::HttpStatus {
                        url: current.to_string(),
                        status: status.as_u16(),
                    })?;
                let next = current
                    .join(location)
                    .map_err(|e| FetchError::InvalidUrl {
                        url: location.to_string(),
                        reason: e.to_string(),
                    })?;
                if next.scheme() != "http" {
                    return Err(FetchError::UnsupportedScheme {
                        url: next.to_string(),
                    });
                }

                tracing::debug!(
                    from = %current,
                    to = %next,
                    request_number,
                    "Following redirect"
                );
                current = next;
                continue;
            }

            let body = self.read_body(&current, response).await?;
            if status == StatusCode::OK {
                return Ok(body);
            }
            if is_tracker_failure(&body) {
                return Ok(body);
            }
            return Err(FetchError::HttpStatus {
                url: current.to_string(),
                status: status.as_u16(),
            });
        }

        Err(FetchError::RedirectRecursion {
            url: original.to_string(),
            limit: self.max_requests,
        })
    }
}

/// Parses `url` and requires the plain `http` scheme.
///
/// # Errors
///
/// - `FetchError::InvalidUrl` - If `url` does not parse
/// - `FetchError::UnsupportedScheme` - If the scheme is not `http`
pub fn parse_http_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" {
        return Err(FetchError::UnsupportedScheme {
            url: url.to_string(),
        });
    }
    Ok(parsed)
}

/// True when `body` decodes to a dictionary carrying `failure reason`.
///
/// Such bodies are returned even on non-200 statuses so the tracker layer
/// sees the rejection text.
pub fn is_tracker_failure(body: &[u8]) -> bool {
    bencode::decode_sloppy(body)
        .ok()
        .and_then(|value| value.get(b"failure reason").cloned())
        .is_some()
}

fn map_send_error(url: &Url, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

fn map_body_error(url: &Url, error: &reqwest::Error) -> FetchError {
    if error.is_decode() {
        FetchError::CorruptResponse {
            url: url.to_string(),
        }
    } else {
        map_send_error(url, error)
    }
}
