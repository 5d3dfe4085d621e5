//! Typed core events on a broadcast bus.
//!
//! Stores and engines publish what changed; observers subscribe and never
//! reach back into the publisher. Publishing never blocks and succeeds even
//! when nobody listens.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::torrent::{InfoHash, Permid};

const DEFAULT_CAPACITY: usize = 256;

/// Resource-exhaustion signals surfaced to the user once per transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Activity {
    /// The drive holding `drive` refused a write
    DiskFull { drive: PathBuf },
}

/// Events emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CoreEvent {
    Activity(Activity),
    TrackerWarning {
        info_hash: InfoHash,
        tracker: String,
        message: String,
    },
    TrackerFailure {
        info_hash: InfoHash,
        reason: String,
    },
    TorrentCollected {
        info_hash: InfoHash,
        path: PathBuf,
        from: Permid,
    },
    TorrentEvicted {
        info_hash: InfoHash,
    },
    MetadataInserted {
        channel: Permid,
        info_hash: InfoHash,
    },
    MetadataUpdated {
        channel: Permid,
        info_hash: InfoHash,
    },
    MetadataDeleted {
        channel: Permid,
        info_hash: InfoHash,
    },
    SubtitleReceived {
        channel: Permid,
        info_hash: InfoHash,
        lang: String,
        path: PathBuf,
    },
}

/// Cloneable handle on the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event` to current subscribers.
    pub fn publish(&self, event: CoreEvent) {
        tracing::trace!(?event, "Publishing core event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
