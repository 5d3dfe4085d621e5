//! Integration tests for the HTTP fetcher and tracker rerequester.
//!
//! A minimal in-process HTTP server answers every request with a scripted
//! raw response, so redirect handling, status codes and peer parsing run
//! over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use shoal_core::bencode::Value;
use shoal_core::config::ShoalConfig;
use shoal_core::events::{CoreEvent, EventBus};
use shoal_core::network::{Fetch, FetchError, HttpFetcher};
use shoal_core::torrent::tracker::{
    AnnounceCycle, AnnounceEvent, AnnounceSource, Peer, PeerSink, Rerequester, RerequesterDeps,
    TrackerTiers, TransferStats,
};
use shoal_core::torrent::{InfoHash, PeerId};
use shoal_core::{ErrorKind, ShoalError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Responder = dyn Fn(&str) -> Vec<u8> + Send + Sync;

/// Scripted HTTP server counting the requests it served.
struct MockHttpServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl MockHttpServer {
    async fn start(respond: impl Fn(&str) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let counter = requests.clone();
        let seen = paths.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let respond = respond.clone();
                let counter = counter.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&request);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().push(path.clone());

                    let _ = stream.write_all(&respond(&path)).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            addr,
            requests,
            paths,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut raw = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n", body.len());
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    let mut raw = raw.into_bytes();
    raw.extend_from_slice(body);
    raw
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&ShoalConfig::default().http).unwrap()
}

#[tokio::test]
async fn test_redirect_loop_stops_after_ten_requests() {
    let hops = Arc::new(AtomicUsize::new(0));
    let server = MockHttpServer::start(move |_| {
        let hop = hops.fetch_add(1, Ordering::SeqCst);
        response("301 Moved Permanently", &[("Location", &format!("/hop{hop}"))], b"")
    })
    .await;

    let result = fetcher().get(&server.url("/announce")).await;

    assert!(matches!(result, Err(FetchError::RedirectRecursion { limit: 10, .. })));
    assert_eq!(server.request_count(), 10);
    assert_eq!(ShoalError::from(result.unwrap_err()).kind(), ErrorKind::RedirectRecursion);
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let server = MockHttpServer::start(|path| match path {
        "/old" => response("302 Found", &[("Location", "/new")], b""),
        _ => response("200 OK", &[], b"d8:intervali60ee"),
    })
    .await;

    let body = fetcher().get(&server.url("/old")).await.unwrap();

    assert_eq!(body, b"d8:intervali60ee");
    assert_eq!(*server.paths.lock(), vec!["/old".to_string(), "/new".to_string()]);
}

#[tokio::test]
async fn test_error_status_keeps_tracker_failure_body() {
    let failure = Value::dict([("failure reason", Value::from("torrent not registered"))]).to_bytes();
    let failure_body = failure.clone();
    let server = MockHttpServer::start(move |path| match path {
        "/failing" => response("400 Bad Request", &[], &failure_body),
        _ => response("500 Internal Server Error", &[], b"<html>oops</html>"),
    })
    .await;

    assert_eq!(fetcher().get(&server.url("/failing")).await.unwrap(), failure);
    assert!(matches!(
        fetcher().get(&server.url("/broken")).await,
        Err(FetchError::HttpStatus { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_corrupt_gzip_body() {
    let server = MockHttpServer::start(|_| {
        response("200 OK", &[("Content-Encoding", "gzip")], b"definitely not gzip")
    })
    .await;

    let result = fetcher().get(&server.url("/announce")).await;

    assert!(matches!(result, Err(FetchError::CorruptResponse { .. })));
}

struct Leeching;

impl AnnounceSource for Leeching {
    fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            uploaded: 0,
            downloaded: 0,
            left: 40_000,
        }
    }

    fn known_peers(&self) -> usize {
        0
    }

    fn is_paused(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct PeerLog {
    peers: Mutex<Vec<Peer>>,
}

impl PeerSink for PeerLog {
    fn connect(&self, peers: Vec<Peer>) {
        self.peers.lock().extend(peers);
    }
}

fn rerequester(tiers: TrackerTiers, sink: Arc<PeerLog>, events: EventBus) -> Rerequester {
    let config = ShoalConfig::default();
    let deps = RerequesterDeps {
        fetch: Arc::new(HttpFetcher::new(&config.http).unwrap()),
        source: Arc::new(Leeching),
        sink,
        events,
    };
    Rerequester::new(
        InfoHash::new([0x42; 20]),
        PeerId::generate(config.tracker.client_prefix),
        tiers,
        config.tracker,
        deps,
    )
}

fn compact_reply() -> Vec<u8> {
    Value::dict([
        ("interval", Value::Integer(1800)),
        (
            "peers",
            Value::bytes(b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x05\x1a\xe1"),
        ),
    ])
    .to_bytes()
}

#[tokio::test]
async fn test_announce_delivers_compact_peers_and_promotes_tracker() {
    let server = MockHttpServer::start(|path| {
        if path.starts_with("/down/") {
            response("503 Service Unavailable", &[], b"busy")
        } else {
            response("200 OK", &[], &compact_reply())
        }
    })
    .await;
    let down = server.url("/down/announce");
    let up = server.url("/up/announce");
    let sink = Arc::new(PeerLog::default());
    let rerequester = rerequester(
        TrackerTiers::ordered(vec![vec![down.clone(), up.clone()]]),
        sink.clone(),
        EventBus::new(),
    );

    let cycle = rerequester.announce(AnnounceEvent::Started).await;

    assert!(matches!(cycle, AnnounceCycle::Success { ref tracker, peers: 2, .. } if *tracker == up));
    let addrs: Vec<String> = sink.peers.lock().iter().map(|peer| peer.addr.to_string()).collect();
    assert_eq!(addrs, vec!["127.0.0.1:6881", "192.168.1.5:6881"]);
    assert_eq!(rerequester.tiers().tiers()[0], vec![up, down]);
    assert!(server.paths.lock().iter().any(|path| path.contains("event=started")));
}

#[tokio::test]
async fn test_rejected_announce_is_reported() {
    let server = MockHttpServer::start(|_| {
        let body = Value::dict([("failure reason", Value::from("banned client"))]).to_bytes();
        response("200 OK", &[], &body)
    })
    .await;
    let events = EventBus::new();
    let mut subscriber = events.subscribe();
    let rerequester = rerequester(
        TrackerTiers::ordered(vec![vec![server.url("/announce")]]),
        Arc::new(PeerLog::default()),
        events,
    );

    let cycle = rerequester.announce(AnnounceEvent::Started).await;

    assert!(matches!(cycle, AnnounceCycle::Failed { ref reason } if reason.contains("banned client")));
    assert!(matches!(
        subscriber.recv().await.unwrap(),
        CoreEvent::TrackerFailure { .. }
    ));
}

#[tokio::test]
async fn test_scrape_reads_swarm_counts() {
    let info_hash = InfoHash::new([0x42; 20]);
    let server = MockHttpServer::start(move |path| {
        assert!(path.starts_with("/scrape?info_hash="));
        let stats = Value::dict([
            ("complete", Value::Integer(5)),
            ("downloaded", Value::Integer(10)),
            ("incomplete", Value::Integer(3)),
        ]);
        let files = Value::Dict([(info_hash.as_bytes().to_vec(), stats)].into_iter().collect());
        response("200 OK", &[], &Value::dict([("files", files)]).to_bytes())
    })
    .await;
    let rerequester = rerequester(
        TrackerTiers::ordered(vec![vec![server.url("/announce")]]),
        Arc::new(PeerLog::default()),
        EventBus::new(),
    );

    let stats = rerequester.scrape().await.unwrap();

    assert_eq!((stats.complete, stats.downloaded, stats.incomplete), (5, 10, 3));
}
