//! Handle for communicating with the overlay bridge actor.

use tokio::sync::{mpsc, oneshot};

use super::commands::OverlayCommand;
use super::{ChannelcastEntry, OverlayError};
use crate::metadata::{DigestEntry, MetadataError};
use crate::subtitles::{MetadataRecord, SubsDelivery, SubtitleError};
use crate::torrent::{InfoHash, Permid};

/// Cloneable async front of the overlay bridge.
///
/// Every method fails with `OverlayError::EngineShutdown` once the bridge
/// has stopped.
#[derive(Clone)]
pub struct OverlayHandle {
    sender: mpsc::Sender<OverlayCommand>,
}

impl OverlayHandle {
    pub fn new(sender: mpsc::Sender<OverlayCommand>) -> Self {
        Self { sender }
    }

    /// Hands a message received from `peer` to the bridge.
    ///
    /// Messages of one caller are processed in the order they are delivered.
    ///
    /// # Errors
    ///
    /// - `OverlayError::EngineShutdown` - If the bridge has stopped
    pub async fn deliver(
        &self,
        peer: Permid,
        selversion: u32,
        message: Vec<u8>,
    ) -> Result<(), OverlayError> {
        self.send(OverlayCommand::Inbound {
            peer,
            selversion,
            message,
        })
        .await
    }

    /// Asks `peer` for a torrent file; false if it is already collected.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Overlay` - If sending fails or the bridge has stopped
    pub async fn request_torrent(
        &self,
        peer: Permid,
        info_hash: InfoHash,
    ) -> Result<bool, MetadataError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::RequestTorrent {
            peer,
            info_hash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)?
    }

    /// Requests subtitles in the languages of `mask`.
    ///
    /// Deliveries arrive on the returned receiver as languages are stored.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If peers cannot be selected
    /// - `SubtitleError::Overlay` - If no peer could be asked or the bridge has stopped
    pub async fn request_subtitles(
        &self,
        channel: Permid,
        info_hash: InfoHash,
        mask: u32,
    ) -> Result<mpsc::UnboundedReceiver<SubsDelivery>, SubtitleError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::RequestSubtitles {
            channel,
            info_hash,
            mask,
            responder,
        })
        .await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)?
    }

    /// Publishes a subtitle on the local channel.
    ///
    /// # Errors
    ///
    /// - Any error of [`crate::subtitles::SubtitleSupport::publish_subtitle`]
    /// - `SubtitleError::Overlay` - If the bridge has stopped
    pub async fn publish_subtitle(
        &self,
        info_hash: InfoHash,
        lang: &str,
        content: Vec<u8>,
        description: Option<String>,
    ) -> Result<MetadataRecord, SubtitleError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::PublishSubtitle {
            info_hash,
            lang: lang.to_string(),
            content,
            description,
            responder,
        })
        .await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)?
    }

    /// Frames a CHANNELCAST for a peer speaking `selversion`.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If metadata cannot be read
    /// - `SubtitleError::Overlay` - If the bridge has stopped
    pub async fn prepare_channelcast(
        &self,
        entries: Vec<ChannelcastEntry>,
        selversion: u32,
    ) -> Result<Vec<u8>, SubtitleError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::PrepareChannelcast {
            entries,
            selversion,
            responder,
        })
        .await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)?
    }

    /// # Errors
    ///
    /// - `OverlayError::EngineShutdown` - If the bridge has stopped
    pub async fn digest(&self, limit: usize, selversion: u32) -> Result<Vec<DigestEntry>, OverlayError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::Digest {
            limit,
            selversion,
            responder,
        })
        .await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)
    }

    /// Returns how many local subtitle rows were cleared.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Database` - If the store cannot be read
    /// - `SubtitleError::Overlay` - If the bridge has stopped
    pub async fn verify_subtitles(&self) -> Result<usize, SubtitleError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::VerifySubtitles { responder }).await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)?
    }

    /// Stops the bridge after it drained pending commands.
    ///
    /// # Errors
    ///
    /// - `OverlayError::EngineShutdown` - If the bridge had already stopped
    pub async fn shutdown(&self) -> Result<(), OverlayError> {
        let (responder, rx) = oneshot::channel();
        self.send(OverlayCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| OverlayError::EngineShutdown)
    }

    async fn send(&self, command: OverlayCommand) -> Result<(), OverlayError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| OverlayError::EngineShutdown)
    }
}
