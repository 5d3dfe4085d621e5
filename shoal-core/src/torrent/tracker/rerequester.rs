//! Announce loop over tiered trackers.
//!
//! One `Rerequester` exists per torrent. Cycles walk the tiers in order and
//! contact one tracker at a time; each attempt races the HTTP fetch against the
//! request timeout through the shared [`SuccessLatch`], so a cycle yields
//! exactly one result no matter how late the losing side lands. Cycles are
//! serialized: a timer that fires while a cycle runs is skipped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::client::HttpTrackerClient;
use super::key::TrackerKeys;
use super::latch::SuccessLatch;
use super::tiers::TrackerTiers;
use super::types::{
    AnnounceEvent, AnnounceParams, AnnounceResponse, AnnounceSource, PeerSink, ScrapeStats,
};
use super::{ErrorCategory, TrackerError};
use crate::config::TrackerConfig;
use crate::events::{CoreEvent, EventBus};
use crate::network::Fetch;
use crate::torrent::{InfoHash, PeerId};

/// Ratio of swarm size to known peers below which `last` is dropped so the
/// tracker retransmits its full list.
const LAST_RESET_RATIO: f64 = 1.2;

/// Mutable per-torrent announce state.
#[derive(Debug, Clone)]
pub struct AnnounceState {
    /// Tracker that answered the latest successful cycle
    pub last_successful: Option<String>,
    pub last: Option<String>,
    pub tracker_id: Option<String>,
    /// Base of the short check timer
    pub interval: Duration,
    /// Regular announce interval
    pub announce_interval: Duration,
    pub never_succeeded: bool,
    pub stopped: bool,
    pub last_failed: bool,
    /// Most recent error per category within the current cycle
    pub errorcodes: HashMap<ErrorCategory, String>,
}

impl AnnounceState {
    fn new(config: &TrackerConfig) -> Self {
        Self {
            last_successful: None,
            last: None,
            tracker_id: None,
            interval: config.rerequest_interval,
            announce_interval: config.announce_interval,
            never_succeeded: true,
            stopped: false,
            last_failed: false,
            errorcodes: HashMap::new(),
        }
    }

    /// Highest-priority cached error message.
    fn failure_reason(&self) -> String {
        ErrorCategory::PRIORITY
            .iter()
            .find_map(|category| self.errorcodes.get(category).cloned())
            .unwrap_or_else(|| "Problem connecting to tracker - unspecified error".to_string())
    }
}

/// Whether an announce reports the transfer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    Transfer,
    /// Emergency announces carry no upload/download delta
    NoDelta,
}

/// Result of one announce cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceCycle {
    Success {
        tracker: String,
        peers: usize,
        warning: Option<String>,
    },
    Failed {
        reason: String,
    },
    /// Not attempted: stopped, or another cycle was already running
    Skipped,
}

/// Per-torrent announce driver.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Rerequester {
    inner: Arc<Inner>,
}

struct Inner {
    info_hash: InfoHash,
    peer_id: PeerId,
    config: TrackerConfig,
    client: HttpTrackerClient,
    source: Arc<dyn AnnounceSource>,
    sink: Arc<dyn PeerSink>,
    events: EventBus,
    state: Mutex<AnnounceState>,
    tiers: Mutex<TrackerTiers>,
    keys: Mutex<TrackerKeys>,
    latch: SuccessLatch,
    cycle: tokio::sync::Mutex<()>,
    stop_signal: Notify,
}

/// Collaborators of a rerequester.
pub struct RerequesterDeps {
    pub fetch: Arc<dyn Fetch>,
    pub source: Arc<dyn AnnounceSource>,
    pub sink: Arc<dyn PeerSink>,
    pub events: EventBus,
}

impl Rerequester {
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        tiers: TrackerTiers,
        config: TrackerConfig,
        deps: RerequesterDeps,
    ) -> Self {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                info_hash,
                peer_id,
                state: Mutex::new(AnnounceState::new(&config)),
                config,
                client: HttpTrackerClient::new(deps.fetch),
                source: deps.source,
                sink: deps.sink,
                events: deps.events,
                tiers: Mutex::new(tiers),
                keys: Mutex::new(TrackerKeys::new(&peer_id, now_nanos)),
                latch: SuccessLatch::new(),
                cycle: tokio::sync::Mutex::new(()),
                stop_signal: Notify::new(),
            }),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.inner.info_hash
    }

    /// Snapshot of the announce state.
    pub fn state(&self) -> AnnounceState {
        self.inner.state.lock().clone()
    }

    /// Snapshot of the tracker tiers in current contact order.
    pub fn tiers(&self) -> TrackerTiers {
        self.inner.tiers.lock().clone()
    }

    /// Runs one announce cycle, waiting for a running cycle to finish first.
    pub async fn announce(&self, event: AnnounceEvent) -> AnnounceCycle {
        let _cycle = self.inner.cycle.lock().await;
        self.run_cycle(event, Report::Transfer).await
    }

    /// Runs one announce cycle unless another is in progress.
    pub async fn try_announce(&self, event: AnnounceEvent) -> AnnounceCycle {
        self.try_run(event, Report::Transfer).await
    }

    async fn try_run(&self, event: AnnounceEvent, report: Report) -> AnnounceCycle {
        let Ok(_cycle) = self.inner.cycle.try_lock() else {
            tracing::debug!(info_hash = %self.inner.info_hash, "Announce already running, skipping");
            return AnnounceCycle::Skipped;
        };
        self.run_cycle(event, report).await
    }

    /// Sends the stopped event and ends periodic announcing.
    pub async fn stop(&self) -> AnnounceCycle {
        let cycle = self.announce(AnnounceEvent::Stopped).await;
        self.inner.stop_signal.notify_one();
        cycle
    }

    /// Scrapes the last successful tracker, or the first supported one.
    ///
    /// # Errors
    ///
    /// - `TrackerError::NoTrackers` - If no supported tracker exists
    /// - Any `TrackerError` from the scrape exchange
    pub async fn scrape(&self) -> Result<ScrapeStats, TrackerError> {
        let tracker = {
            let state = self.inner.state.lock();
            let tiers = self.inner.tiers.lock();
            state
                .last_successful
                .clone()
                .or_else(|| tiers.first_supported().map(str::to_string))
        };
        let tracker = tracker.ok_or(TrackerError::NoTrackers)?;
        self.inner.client.scrape(&tracker, &self.inner.info_hash).await
    }

    /// Starts the timer loop: an initial `started` announce, then the short
    /// check timer and the regular announce timer until stopped.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_timers().await })
    }

    async fn run_timers(self) {
        self.try_announce(AnnounceEvent::Started).await;

        let mut next_check = Instant::now() + self.check_period();
        let mut next_announce = Instant::now() + self.announce_delay();

        loop {
            if self.inner.state.lock().stopped {
                break;
            }

            tokio::select! {
                _ = self.inner.stop_signal.notified() => break,
                _ = tokio::time::sleep_until(next_check) => {
                    self.check().await;
                    next_check = Instant::now() + self.check_period();
                }
                _ = tokio::time::sleep_until(next_announce) => {
                    self.regular().await;
                    next_announce = Instant::now() + self.announce_delay();
                }
            }
        }
        tracing::debug!(info_hash = %self.inner.info_hash, "Announce timers stopped");
    }

    /// Emergency announce when paused and starved of peers.
    async fn check(&self) {
        if self.inner.state.lock().stopped {
            return;
        }
        let source = &self.inner.source;
        if source.is_paused() && source.known_peers() < self.inner.config.min_peers {
            tracing::info!(
                info_hash = %self.inner.info_hash,
                known_peers = source.known_peers(),
                "Too few peers while paused, announcing early"
            );
            self.try_run(AnnounceEvent::Query, Report::NoDelta).await;
        }
    }

    async fn regular(&self) {
        if self.inner.state.lock().stopped || self.inner.source.is_paused() {
            return;
        }
        self.try_announce(AnnounceEvent::Query).await;
    }

    fn check_period(&self) -> Duration {
        let interval = self.inner.state.lock().interval;
        (interval / 2).max(Duration::from_secs(1))
    }

    fn announce_delay(&self) -> Duration {
        let state = self.inner.state.lock();
        if state.never_succeeded {
            self.inner.config.retry_interval
        } else {
            state.announce_interval
        }
    }

    async fn run_cycle(&self, event: AnnounceEvent, report: Report) -> AnnounceCycle {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return AnnounceCycle::Skipped;
            }
            if event == AnnounceEvent::Stopped {
                state.stopped = true;
            }
            state.errorcodes.clear();
        }
        self.inner.latch.reset();

        let ip = resolve_ip(self.inner.config.ip.as_deref()).await;
        let candidates = self.inner.tiers.lock().candidates();
        if candidates.is_empty() {
            self.inner.record_error(&TrackerError::NoTrackers);
        }

        for (tier, position, tracker) in candidates {
            let params = self.params(event, report, &tracker, ip.clone());
            match self.attempt(&tracker, params).await {
                Some(response) => {
                    if position != 0 {
                        self.inner.tiers.lock().promote(tier, &tracker);
                    }
                    {
                        let mut state = self.inner.state.lock();
                        state.last_successful = Some(tracker.clone());
                        state.last_failed = false;
                        state.never_succeeded = false;
                    }
                    let warning = response.warning.clone();
                    let peers = self.inner.apply_response(&tracker, response);
                    tracing::debug!(
                        info_hash = %self.inner.info_hash,
                        tracker,
                        peers,
                        "Announce succeeded"
                    );
                    return AnnounceCycle::Success {
                        tracker,
                        peers,
                        warning,
                    };
                }
                None => {
                    let mut state = self.inner.state.lock();
                    if state.last_successful.as_deref() == Some(tracker.as_str()) {
                        state.last_failed = true;
                    }
                }
            }
        }

        self.inner.latch.give_up();
        self.fail()
    }

    fn fail(&self) -> AnnounceCycle {
        let reason = {
            let mut state = self.inner.state.lock();
            state.last_failed = true;
            state.failure_reason()
        };
        tracing::warn!(info_hash = %self.inner.info_hash, %reason, "Announce failed");
        self.inner.events.publish(CoreEvent::TrackerFailure {
            info_hash: self.inner.info_hash,
            reason: reason.clone(),
        });
        AnnounceCycle::Failed { reason }
    }

    fn params(
        &self,
        event: AnnounceEvent,
        report: Report,
        tracker: &str,
        ip: Option<String>,
    ) -> AnnounceParams {
        let mut stats = self.inner.source.transfer_stats();
        if report == Report::NoDelta {
            stats.uploaded = 0;
            stats.downloaded = 0;
        }
        let want_peers = self.inner.source.known_peers() < self.inner.config.max_peers;
        let key = self.inner.keys.lock().key_for(tracker).to_string();
        let state = self.inner.state.lock();

        AnnounceParams {
            info_hash: self.inner.info_hash,
            peer_id: self.inner.peer_id,
            port: self.inner.config.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            last: state.last.clone(),
            tracker_id: state.tracker_id.clone(),
            want_peers,
            ip,
            key,
        }
    }

    /// Contacts one tracker; `Some` only when this attempt won its generation.
    async fn attempt(&self, tracker: &str, params: AnnounceParams) -> Option<AnnounceResponse> {
        let generation = self.inner.latch.set();

        let fetch_inner = Arc::clone(&self.inner);
        let fetch_tracker = tracker.to_string();
        let fetch_task = tokio::spawn(async move {
            match fetch_inner.client.announce(&fetch_tracker, &params).await {
                Ok(response) => {
                    if fetch_inner.latch.trip(generation, true) {
                        fetch_inner.latch.unwait(generation);
                        Some(response)
                    } else {
                        // Timed out already; keep the data, skip the cycle result
                        fetch_inner.apply_response(&fetch_tracker, response);
                        None
                    }
                }
                Err(error) => {
                    if fetch_inner.latch.trip(generation, false) {
                        tracing::debug!(tracker = %fetch_tracker, %error, "Tracker attempt failed");
                        fetch_inner.record_error(&error);
                        fetch_inner.latch.unwait(generation);
                    }
                    None
                }
            }
        });

        let timeout_inner = Arc::clone(&self.inner);
        let timeout = self.inner.config.timeout;
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timeout_inner.latch.trip(generation, false) {
                timeout_inner.record_error(&TrackerError::Trouble {
                    reason: "timeout exceeded".to_string(),
                });
                timeout_inner.latch.unwait(generation);
            }
        });

        self.inner.latch.wait().await;
        timeout_task.abort();

        if self.inner.latch.is_success() {
            fetch_task.await.ok().flatten()
        } else {
            None
        }
    }
}

impl Inner {
    fn record_error(&self, error: &TrackerError) {
        self.state
            .lock()
            .errorcodes
            .insert(error.category(), error.to_string());
    }

    /// Folds a tracker reply into the announce state and hands its peers to
    /// the sink. Returns the number of peers delivered.
    fn apply_response(&self, tracker: &str, response: AnnounceResponse) -> usize {
        if let Some(message) = &response.warning {
            tracing::warn!(info_hash = %self.info_hash, tracker, message, "Warning from tracker");
            self.events.publish(CoreEvent::TrackerWarning {
                info_hash: self.info_hash,
                tracker: tracker.to_string(),
                message: message.clone(),
            });
        }

        let mut peers = response.peers;
        peers.shuffle(&mut rand::rng());
        let known = self.source.known_peers() + peers.len();

        {
            let mut state = self.state.lock();
            if let Some(min_interval) = response.min_interval {
                state.interval = min_interval;
            }
            if let Some(interval) = response.interval {
                state.announce_interval = interval.max(response.min_interval.unwrap_or_default());
            }
            if response.tracker_id.is_some() {
                state.tracker_id = response.tracker_id;
            }
            state.last = response.last;

            if let Some(num_peers) = response.num_peers {
                let active = num_peers.saturating_sub(response.done_peers.unwrap_or(0));
                if (known as f64) * LAST_RESET_RATIO < active as f64 {
                    state.last = None;
                }
            }
        }

        let delivered = peers.len();
        if delivered > 0 {
            self.sink.connect(peers);
        }
        delivered
    }
}

/// Resolves the configured external address to an IPv4 literal.
async fn resolve_ip(configured: Option<&str>) -> Option<String> {
    let host = configured?;
    if host.parse::<IpAddr>().is_ok() {
        return Some(host.to_string());
    }

    match tokio::net::lookup_host((host, 0)).await {
        Ok(addresses) => addresses
            .map(|address| address.ip())
            .find(IpAddr::is_ipv4)
            .map(|ip| ip.to_string()),
        Err(error) => {
            tracing::debug!(host, %error, "Could not resolve announce ip");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::bencode::Value;
    use crate::network::FetchError;
    use crate::torrent::tracker::{Peer, TransferStats};

    enum Script {
        Reply(Vec<u8>),
        Hang,
        Fail,
    }

    /// Fetcher answering per tracker host.
    struct ScriptedFetch {
        scripts: Map<&'static str, Script>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedFetch {
        fn new(scripts: Vec<(&'static str, Script)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.into_iter().collect(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetch {
        async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.lock().push(url.to_string());
            let script = self
                .scripts
                .iter()
                .find(|(host, _)| url.starts_with(**host))
                .map(|(_, script)| script);
            match script {
                Some(Script::Reply(body)) => Ok(body.clone()),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Some(Script::Fail) | None => Err(FetchError::Transport {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    struct StubSource {
        known: usize,
        paused: bool,
    }

    impl AnnounceSource for StubSource {
        fn transfer_stats(&self) -> TransferStats {
            TransferStats {
                uploaded: 1,
                downloaded: 2,
                left: 3,
            }
        }

        fn known_peers(&self) -> usize {
            self.known
        }

        fn is_paused(&self) -> bool {
            self.paused
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        peers: Mutex<Vec<Peer>>,
        calls: AtomicUsize,
    }

    impl PeerSink for CollectingSink {
        fn connect(&self, peers: Vec<Peer>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.peers.lock().extend(peers);
        }
    }

    fn ok_reply() -> Vec<u8> {
        Value::dict([
            ("interval", Value::Integer(1200)),
            ("min interval", Value::Integer(600)),
            ("tracker id", Value::from("tid")),
            ("peers", Value::bytes(b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x05\x1a\xe1")),
        ])
        .to_bytes()
    }

    fn rerequester(
        fetch: Arc<ScriptedFetch>,
        tiers: Vec<Vec<&str>>,
        known: usize,
    ) -> (Rerequester, Arc<CollectingSink>, EventBus) {
        rerequester_with(fetch, tiers, StubSource { known, paused: false })
    }

    fn rerequester_with(
        fetch: Arc<ScriptedFetch>,
        tiers: Vec<Vec<&str>>,
        source: StubSource,
    ) -> (Rerequester, Arc<CollectingSink>, EventBus) {
        let sink = Arc::new(CollectingSink::default());
        let events = EventBus::new();
        let tiers = TrackerTiers::ordered(
            tiers
                .into_iter()
                .map(|tier| tier.into_iter().map(str::to_string).collect())
                .collect(),
        );
        let config = TrackerConfig {
            timeout: Duration::from_secs(15),
            ..TrackerConfig::default()
        };
        let rerequester = Rerequester::new(
            InfoHash::new([0x11; 20]),
            PeerId::new(*b"-SH0100-000000000000"),
            tiers,
            config,
            RerequesterDeps {
                fetch,
                source: Arc::new(source),
                sink: sink.clone(),
                events: events.clone(),
            },
        );
        (rerequester, sink, events)
    }

    #[tokio::test]
    async fn test_successful_announce_updates_state() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(ok_reply()))]);
        let (rerequester, sink, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 0);

        let cycle = rerequester.announce(AnnounceEvent::Started).await;
        assert_eq!(
            cycle,
            AnnounceCycle::Success {
                tracker: "http://t0/announce".to_string(),
                peers: 2,
                warning: None,
            }
        );

        let state = rerequester.state();
        assert!(!state.never_succeeded);
        assert_eq!(state.announce_interval, Duration::from_secs(1200));
        assert_eq!(state.interval, Duration::from_secs(600));
        assert_eq!(state.tracker_id.as_deref(), Some("tid"));
        assert_eq!(sink.peers.lock().len(), 2);

        let requests = fetch.requests();
        assert!(requests[0].contains("&event=started"));
        assert!(requests[0].contains("&compact=1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_promotes_tracker() {
        let fetch = ScriptedFetch::new(vec![
            ("http://t0", Script::Hang),
            ("http://t1", Script::Reply(ok_reply())),
            ("http://t2", Script::Reply(ok_reply())),
        ]);
        let (rerequester, _, _) = rerequester(
            fetch.clone(),
            vec![vec!["http://t0/announce", "http://t1/announce", "http://t2/announce"]],
            0,
        );

        let cycle = rerequester.announce(AnnounceEvent::Started).await;
        assert!(matches!(cycle, AnnounceCycle::Success { ref tracker, .. } if tracker == "http://t1/announce"));
        assert_eq!(
            rerequester.tiers().tiers()[0],
            vec![
                "http://t1/announce".to_string(),
                "http://t0/announce".to_string(),
                "http://t2/announce".to_string(),
            ]
        );

        // Next cycle starts with the promoted tracker
        rerequester.announce(AnnounceEvent::Query).await;
        let requests = fetch.requests();
        assert!(requests[2].starts_with("http://t1/announce"));
    }

    #[tokio::test]
    async fn test_all_trackers_failing_reports_priority_reason() {
        let rejected = Value::dict([("failure reason", Value::from("banned client"))]).to_bytes();
        let fetch = ScriptedFetch::new(vec![
            ("http://t0", Script::Fail),
            ("http://t1", Script::Reply(rejected)),
        ]);
        let (rerequester, sink, events) =
            rerequester(fetch, vec![vec!["http://t0/announce"], vec!["http://t1/announce"]], 0);
        let mut subscriber = events.subscribe();

        let cycle = rerequester.announce(AnnounceEvent::Started).await;
        assert_eq!(
            cycle,
            AnnounceCycle::Failed {
                reason: "Rejected by tracker - banned client".to_string()
            }
        );

        let state = rerequester.state();
        assert!(state.last_failed);
        assert!(state.never_succeeded);
        assert_eq!(state.errorcodes.len(), 2);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            CoreEvent::TrackerFailure { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_schemes_are_skipped() {
        let fetch = ScriptedFetch::new(vec![("http://t1", Script::Reply(ok_reply()))]);
        let (rerequester, _, _) =
            rerequester(fetch.clone(), vec![vec!["udp://t0:80", "http://t1/announce"]], 0);

        let cycle = rerequester.announce(AnnounceEvent::Started).await;
        assert!(matches!(cycle, AnnounceCycle::Success { .. }));
        assert_eq!(fetch.requests().len(), 1);
        assert_eq!(rerequester.tiers().tiers()[0][0], "http://t1/announce");
    }

    #[tokio::test]
    async fn test_stop_suppresses_further_announces() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(ok_reply()))]);
        let (rerequester, _, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 0);

        rerequester.stop().await;
        assert!(fetch.requests()[0].contains("&event=stopped"));
        assert!(rerequester.state().stopped);

        assert_eq!(
            rerequester.announce(AnnounceEvent::Query).await,
            AnnounceCycle::Skipped
        );
        assert_eq!(fetch.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_enough_peers_requests_numwant_zero() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(ok_reply()))]);
        let (rerequester, _, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 50);

        rerequester.announce(AnnounceEvent::Query).await;
        let request = &fetch.requests()[0];
        assert!(request.contains("&numwant=0"));
        assert!(!request.contains("compact"));
        assert!(!request.contains("event="));
    }

    #[tokio::test]
    async fn test_last_cleared_when_swarm_outgrows_known_peers() {
        let reply = Value::dict([
            ("interval", Value::Integer(1800)),
            ("last", Value::Integer(9)),
            ("num peers", Value::Integer(100)),
            ("done peers", Value::Integer(10)),
            ("peers", Value::bytes(b"")),
        ])
        .to_bytes();
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(reply))]);
        let (rerequester, _, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 5);

        rerequester.announce(AnnounceEvent::Query).await;
        assert_eq!(rerequester.state().last, None);
    }

    #[tokio::test]
    async fn test_last_kept_when_known_peers_suffice() {
        let reply = Value::dict([
            ("last", Value::Integer(9)),
            ("num peers", Value::Integer(10)),
            ("peers", Value::bytes(b"")),
        ])
        .to_bytes();
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(reply))]);
        let (rerequester, _, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 20);

        rerequester.announce(AnnounceEvent::Query).await;
        assert_eq!(rerequester.state().last.as_deref(), Some("9"));

        rerequester.announce(AnnounceEvent::Query).await;
        assert!(fetch.requests()[1].contains("&last=9"));
    }

    #[tokio::test]
    async fn test_failure_of_last_successful_tracker_moves_to_next_tier() {
        let fetch = ScriptedFetch::new(vec![
            ("http://t0", Script::Reply(ok_reply())),
            ("http://t1", Script::Reply(ok_reply())),
        ]);
        let (rerequester, _, _) = rerequester(
            fetch.clone(),
            vec![vec!["http://t0/announce"], vec!["http://t1/announce"]],
            0,
        );
        rerequester.announce(AnnounceEvent::Started).await;
        assert_eq!(rerequester.state().last_successful.as_deref(), Some("http://t0/announce"));

        // t0 now refuses connections; t1 still answers
        let failing = ScriptedFetch::new(vec![("http://t1", Script::Reply(ok_reply()))]);
        let (second, sink, _) = self::rerequester(
            failing.clone(),
            vec![vec!["http://t0/announce"], vec!["http://t1/announce"]],
            0,
        );
        *second.inner.state.lock() = rerequester.state();
        let cycle = second.announce(AnnounceEvent::Query).await;

        assert!(matches!(cycle, AnnounceCycle::Success { ref tracker, .. } if tracker == "http://t1/announce"));
        assert_eq!(failing.requests().len(), 2);
        assert_eq!(sink.peers.lock().len(), 2);

        let state = second.state();
        assert!(!state.last_failed);
        assert_eq!(state.last_successful.as_deref(), Some("http://t1/announce"));
    }

    #[tokio::test]
    async fn test_warning_is_surfaced_but_succeeds() {
        let reply = Value::dict([
            ("warning message", Value::from("tracker moving soon")),
            ("peers", Value::bytes(b"")),
        ])
        .to_bytes();
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(reply))]);
        let (rerequester, _, events) = rerequester(fetch, vec![vec!["http://t0/announce"]], 0);
        let mut subscriber = events.subscribe();

        let cycle = rerequester.announce(AnnounceEvent::Query).await;
        assert!(matches!(
            cycle,
            AnnounceCycle::Success { warning: Some(ref message), .. } if message == "tracker moving soon"
        ));
        assert!(matches!(
            subscriber.recv().await.unwrap(),
            CoreEvent::TrackerWarning { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_skipped() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(ok_reply()))]);
        let (rerequester, _, _) = rerequester(fetch, vec![vec!["http://t0/announce"]], 0);

        let _running = rerequester.inner.cycle.lock().await;
        assert_eq!(
            rerequester.try_announce(AnnounceEvent::Query).await,
            AnnounceCycle::Skipped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_announce_reports_no_transfer_delta() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Reply(ok_reply()))]);
        let (rerequester, _, _) = rerequester_with(
            fetch.clone(),
            vec![vec!["http://t0/announce"]],
            StubSource {
                known: 1,
                paused: true,
            },
        );

        let handle = rerequester.start();
        // min interval 600 puts the check timer at t=300
        tokio::time::sleep(Duration::from_secs(305)).await;

        let requests = fetch.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("&uploaded=1&downloaded=2&left=3"));
        assert!(requests[0].contains("&event=started"));
        assert!(requests[1].contains("&uploaded=0&downloaded=0&left=3"));
        assert!(!requests[1].contains("event="));

        rerequester.stop().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_loop_retries_until_first_success() {
        let fetch = ScriptedFetch::new(vec![("http://t0", Script::Fail)]);
        let (rerequester, _, _) = rerequester(fetch.clone(), vec![vec!["http://t0/announce"]], 0);

        let handle = rerequester.start();
        tokio::time::sleep(Duration::from_secs(125)).await;
        // Started at t=0, retries at t=60 and t=120
        assert_eq!(fetch.requests().len(), 3);

        rerequester.stop().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
