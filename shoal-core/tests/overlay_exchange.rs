//! Two overlay nodes wired back to back through their public handles.
//!
//! Each node's sender forwards framed messages into the other node's bridge,
//! so torrent and subtitle exchanges run through the full inbound dispatch.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use shoal_core::bencode::Value;
use shoal_core::config::ShoalConfig;
use shoal_core::events::{CoreEvent, EventBus};
use shoal_core::metadata::{
    MemoryCatalog, SwarmStats, TorrentCatalog, TorrentRecord, collected_file_name,
};
use shoal_core::overlay::{
    ChannelcastEntry, OLPROTO_VER_CURRENT, OverlayContext, OverlayDeps, OverlayError,
    OverlayHandle, OverlaySender, spawn_overlay,
};
use shoal_core::storage::DiskManager;
use shoal_core::subtitles::{Ed25519Signer, Ed25519Verifier, Signer, VoteTable, languages};
use shoal_core::torrent::{Metainfo, Permid};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Forwards everything sent to `remote` into its bridge as coming from `local`.
struct Link {
    local: Permid,
    remote: Permid,
    target: OnceLock<OverlayHandle>,
}

impl OverlaySender for Link {
    fn send(&self, peer: &Permid, message: Vec<u8>) -> Result<(), OverlayError> {
        let Some(handle) = self.target.get().filter(|_| *peer == self.remote).cloned() else {
            return Err(OverlayError::SendFailed {
                peer: peer.short(),
                reason: "not linked".to_string(),
            });
        };
        let from = self.local.clone();
        tokio::spawn(async move {
            let _ = handle.deliver(from, OLPROTO_VER_CURRENT, message).await;
        });
        Ok(())
    }
}

struct Node {
    _temp_dir: tempfile::TempDir,
    config: ShoalConfig,
    permid: Permid,
    handle: OverlayHandle,
    catalog: Arc<MemoryCatalog>,
    events: broadcast::Receiver<CoreEvent>,
}

async fn node(seed: u8, link: Arc<Link>) -> Node {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = ShoalConfig::for_testing(temp_dir.path());
    let signer = Arc::new(Ed25519Signer::from_seed([seed; 32]));
    let permid = signer.permid();
    let catalog = Arc::new(MemoryCatalog::new());
    let events = EventBus::new();
    let subscriber = events.subscribe();

    let deps = OverlayDeps {
        catalog: catalog.clone(),
        sender: link,
        signer,
        verifier: Arc::new(Ed25519Verifier),
        votes: Arc::new(VoteTable::default()),
        disk: Arc::new(DiskManager::new(0)),
        events,
    };
    let ctx = OverlayContext::open(config.clone(), deps).await.unwrap();

    Node {
        _temp_dir: temp_dir,
        config,
        permid,
        handle: spawn_overlay(ctx),
        catalog,
        events: subscriber,
    }
}

/// Builds nodes A and B linked to each other.
async fn linked_pair() -> (Node, Node) {
    let permid_a = Ed25519Signer::from_seed([1; 32]).permid();
    let permid_b = Ed25519Signer::from_seed([2; 32]).permid();
    let a_to_b = Arc::new(Link {
        local: permid_a.clone(),
        remote: permid_b.clone(),
        target: OnceLock::new(),
    });
    let b_to_a = Arc::new(Link {
        local: permid_b,
        remote: permid_a,
        target: OnceLock::new(),
    });

    let a = node(1, a_to_b.clone()).await;
    let b = node(2, b_to_a.clone()).await;
    let _ = a_to_b.target.set(b.handle.clone());
    let _ = b_to_a.target.set(a.handle.clone());
    (a, b)
}

async fn next_event(
    events: &mut broadcast::Receiver<CoreEvent>,
    wanted: impl Fn(&CoreEvent) -> bool,
) -> CoreEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_subtitle_travels_between_nodes() {
    let (a, mut b) = linked_pair().await;
    let info_hash = shoal_core::torrent::InfoHash::new([7; 20]);
    let content = b"1\n00:00:01,000 --> 00:00:02,000\nHello\n".to_vec();

    let record = a
        .handle
        .publish_subtitle(info_hash, "eng", content.clone(), Some("A film".to_string()))
        .await
        .unwrap();
    assert_eq!(record.channel, a.permid);

    let entry = ChannelcastEntry {
        channel: a.permid.clone(),
        info_hash,
        name: "A film".to_string(),
        timestamp: record.timestamp,
        rich_metadata: None,
    };
    let channelcast = a
        .handle
        .prepare_channelcast(vec![entry], OLPROTO_VER_CURRENT)
        .await
        .unwrap();
    b.handle
        .deliver(a.permid.clone(), OLPROTO_VER_CURRENT, channelcast)
        .await
        .unwrap();

    let eng = languages::bit("eng").unwrap();
    let mut deliveries = b
        .handle
        .request_subtitles(a.permid.clone(), info_hash, eng)
        .await
        .unwrap();

    let delivery = timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.languages(), vec!["eng"]);

    let CoreEvent::SubtitleReceived { path, lang, .. } = next_event(&mut b.events, |event| {
        matches!(event, CoreEvent::SubtitleReceived { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(lang, "eng");
    assert!(path.starts_with(&b.config.subtitles.subs_dir));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), content);
}

#[tokio::test]
async fn test_torrent_is_collected_from_peer() {
    let (a, mut b) = linked_pair().await;
    let torrent = Value::dict([
        ("announce", Value::from("http://tracker.example/announce")),
        (
            "info",
            Value::dict([
                ("name", Value::from("shared.mkv")),
                ("piece length", Value::Integer(16384)),
                ("length", Value::Integer(20000)),
                ("pieces", Value::bytes([0x5a; 40])),
            ]),
        ),
    ])
    .to_bytes();
    let info_hash = Metainfo::from_bytes(&torrent).unwrap().info_hash();

    let file_name = collected_file_name(&info_hash);
    tokio::fs::write(a.config.metadata.collected_dir.join(&file_name), &torrent)
        .await
        .unwrap();
    a.catalog.insert(TorrentRecord {
        info_hash,
        name: "shared.mkv".to_string(),
        file_name: Some(file_name),
        source: "local".to_string(),
        stats: SwarmStats::default(),
        inserted_at: 0,
        sources_seen: 0,
    });

    assert!(b.handle.request_torrent(a.permid.clone(), info_hash).await.unwrap());

    let CoreEvent::TorrentCollected { path, from, .. } = next_event(&mut b.events, |event| {
        matches!(event, CoreEvent::TorrentCollected { info_hash: collected, .. } if *collected == info_hash)
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(from, a.permid);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), torrent);
    assert!(b.catalog.contains(&info_hash));
    assert!(!b.handle.request_torrent(a.permid.clone(), info_hash).await.unwrap());
}
