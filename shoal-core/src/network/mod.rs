//! Network plumbing shared by the tracker and overlay engines
//!
//! HTTP fetching for tracker communication and token-bucket pacing for
//! overlay uploads.

pub mod http_fetcher;
pub mod token_bucket;

pub use http_fetcher::{Fetch, FetchError, HttpFetcher, is_tracker_failure, parse_http_url};
pub use token_bucket::TokenBucket;
