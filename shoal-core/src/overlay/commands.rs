//! Command definitions for the overlay bridge actor.

use tokio::sync::{mpsc, oneshot};

use super::ChannelcastEntry;
use crate::metadata::{DigestEntry, MetadataError};
use crate::subtitles::{MetadataRecord, SubsDelivery, SubtitleError};
use crate::torrent::{InfoHash, Permid};

/// Where subtitle deliveries for one request go; `None` for background fetches.
pub type SubsCallback = Option<mpsc::UnboundedSender<SubsDelivery>>;

/// Commands processed by the overlay bridge, one at a time, in arrival order.
pub enum OverlayCommand {
    /// A framed message received from `peer`.
    Inbound {
        peer: Permid,
        selversion: u32,
        message: Vec<u8>,
    },
    /// Ask `peer` for the torrent file of `info_hash`.
    RequestTorrent {
        peer: Permid,
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<bool, MetadataError>>,
    },
    /// Fetch subtitles of a channel's record from the best peers.
    RequestSubtitles {
        channel: Permid,
        info_hash: InfoHash,
        mask: u32,
        responder: oneshot::Sender<Result<mpsc::UnboundedReceiver<SubsDelivery>, SubtitleError>>,
    },
    /// Add a subtitle to the local channel.
    PublishSubtitle {
        info_hash: InfoHash,
        lang: String,
        content: Vec<u8>,
        description: Option<String>,
        responder: oneshot::Sender<Result<MetadataRecord, SubtitleError>>,
    },
    /// Attach rich metadata and frame a CHANNELCAST for a peer.
    PrepareChannelcast {
        entries: Vec<ChannelcastEntry>,
        selversion: u32,
        responder: oneshot::Sender<Result<Vec<u8>, SubtitleError>>,
    },
    /// Recently collected torrents for gossip.
    Digest {
        limit: usize,
        selversion: u32,
        responder: oneshot::Sender<Vec<DigestEntry>>,
    },
    /// Clear paths of missing or corrupt local subtitles.
    VerifySubtitles {
        responder: oneshot::Sender<Result<usize, SubtitleError>>,
    },
    /// Drain pending commands and stop.
    Shutdown { responder: oneshot::Sender<()> },
}
