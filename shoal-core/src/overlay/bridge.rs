//! Overlay bridge actor.
//!
//! One task owns the metadata exchange, the subtitle handler and the rich
//! metadata interceptor. Inbound messages, local requests and timers are
//! all serialized through its select loop, so none of the components needs
//! internal locking.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep_until, timeout};

use super::commands::{OverlayCommand, SubsCallback};
use super::handle::OverlayHandle;
use super::{
    MessageTag, OLPROTO_VER_FOURTEENTH, OverlayError, OverlaySender, decode_channelcast,
    encode_channelcast, split_frame, unix_now,
};
use crate::ShoalError;
use crate::config::ShoalConfig;
use crate::events::EventBus;
use crate::metadata::{CollectedTorrents, MetadataExchange, TorrentCatalog};
use crate::storage::DiskManager;
use crate::subtitles::{
    GetSubsMessage, HaveMaskStore, MetadataStore, RichMetadataInterceptor, SignatureVerifier,
    Signer, SubsDelivery, SubtitleDb, SubtitleError, SubtitleHandler, SubtitleSupport, VoteSource,
};
use crate::torrent::{InfoHash, Permid};

/// External collaborators of the overlay bridge.
pub struct OverlayDeps {
    pub catalog: Arc<dyn TorrentCatalog>,
    pub sender: Arc<dyn OverlaySender>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub votes: Arc<dyn VoteSource>,
    pub disk: Arc<DiskManager>,
    pub events: EventBus,
}

/// Everything the bridge task owns.
pub struct OverlayContext {
    config: ShoalConfig,
    exchange: MetadataExchange,
    handler: SubtitleHandler<SubsCallback>,
    subtitles: SubtitleSupport,
    interceptor: RichMetadataInterceptor,
}

impl OverlayContext {
    /// Registers the storage directories, opens the subtitle database and
    /// wires the components together.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Storage` - If a directory cannot be created
    /// - `ShoalError::Subtitle` - If the subtitle database cannot be opened
    pub async fn open(config: ShoalConfig, deps: OverlayDeps) -> Result<Self, ShoalError> {
        deps.disk
            .register(&config.metadata.collected_dir, config.disk.torrents.clone())
            .await?;
        deps.disk
            .register(&config.subtitles.subs_dir, config.disk.subtitles.clone())
            .await?;

        let db = SubtitleDb::open(&config.subtitles.database_path)?;
        let store = MetadataStore::new(db.clone(), deps.events.clone());
        let have = HaveMaskStore::with_limit(db, config.subtitles.max_have_entries);

        let collected = CollectedTorrents::new(deps.disk.clone(), config.metadata.collected_dir.clone());
        let exchange = MetadataExchange::new(
            config.metadata.clone(),
            deps.catalog,
            collected,
            deps.sender.clone(),
            deps.events.clone(),
        );
        let handler = SubtitleHandler::new(&config.subtitles, deps.sender, std_now());
        let interceptor =
            RichMetadataInterceptor::new(store.clone(), have.clone(), deps.verifier, deps.votes);
        let subtitles = SubtitleSupport::new(
            &config.subtitles,
            store,
            have,
            deps.disk,
            deps.signer,
            deps.events,
        );

        tracing::info!(
            permid = %subtitles.permid().short(),
            database = %config.subtitles.database_path.display(),
            "Overlay context ready"
        );
        Ok(Self {
            config,
            exchange,
            handler,
            subtitles,
            interceptor,
        })
    }
}

/// Spawns the bridge task and returns a handle to it.
pub fn spawn_overlay(ctx: OverlayContext) -> OverlayHandle {
    let (sender, receiver) = mpsc::channel(ctx.config.overlay.command_buffer.max(1));
    tokio::spawn(run_actor_loop(OverlayBridge::new(ctx), receiver));
    OverlayHandle::new(sender)
}

async fn run_actor_loop(mut bridge: OverlayBridge, mut receiver: mpsc::Receiver<OverlayCommand>) {
    let timers = &bridge.ctx.config;
    let mut metadata_tick = interval(timers.metadata.upload_tick);
    let cleanup_period = timers.subtitles.cleanup_period;
    let mut request_cleanup = interval_at(Instant::now() + cleanup_period, cleanup_period);
    let have_period = timers.subtitles.have_cleanup_interval;
    let mut have_cleanup = interval(have_period);
    for timer in [&mut metadata_tick, &mut request_cleanup, &mut have_cleanup] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        let wakeup = bridge.subs_wakeup;
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else { break };
                if !bridge.handle_command(command).await {
                    bridge.drain(&mut receiver).await;
                    break;
                }
            }
            _ = metadata_tick.tick() => bridge.metadata_tick().await,
            _ = sleep_until(wakeup.map_or_else(Instant::now, Instant::from_std)), if wakeup.is_some() => {
                bridge.pump_subtitles();
            }
            _ = request_cleanup.tick() => bridge.cleanup_requests(),
            _ = have_cleanup.tick() => bridge.cleanup_have_masks(),
        }
    }

    tracing::info!("Overlay bridge stopped");
}

fn std_now() -> std::time::Instant {
    Instant::now().into_std()
}

struct OverlayBridge {
    ctx: OverlayContext,
    subs_wakeup: Option<std::time::Instant>,
    shutdown: Vec<oneshot::Sender<()>>,
}

impl OverlayBridge {
    fn new(ctx: OverlayContext) -> Self {
        Self {
            ctx,
            subs_wakeup: None,
            shutdown: Vec::new(),
        }
    }

    /// Returns false once a shutdown was requested.
    async fn handle_command(&mut self, command: OverlayCommand) -> bool {
        match command {
            OverlayCommand::Inbound {
                peer,
                selversion,
                message,
            } => {
                self.handle_inbound(&peer, selversion, &message).await;
            }
            OverlayCommand::RequestTorrent {
                peer,
                info_hash,
                responder,
            } => {
                let result = self.ctx.exchange.request_torrent(&peer, info_hash);
                let _ = responder.send(result);
            }
            OverlayCommand::RequestSubtitles {
                channel,
                info_hash,
                mask,
                responder,
            } => {
                let result = self.request_subtitles(channel, info_hash, mask);
                let _ = responder.send(result);
            }
            OverlayCommand::PublishSubtitle {
                info_hash,
                lang,
                content,
                description,
                responder,
            } => {
                let result = self
                    .ctx
                    .subtitles
                    .publish_subtitle(&info_hash, &lang, &content, description.as_deref())
                    .await;
                let _ = responder.send(result);
            }
            OverlayCommand::PrepareChannelcast {
                mut entries,
                selversion,
                responder,
            } => {
                let result = self
                    .ctx
                    .interceptor
                    .add_rich_metadata(&mut entries, selversion)
                    .map(|_| encode_channelcast(&entries));
                let _ = responder.send(result);
            }
            OverlayCommand::Digest {
                limit,
                selversion,
                responder,
            } => {
                let _ = responder.send(self.ctx.exchange.digest(limit, selversion));
            }
            OverlayCommand::VerifySubtitles { responder } => {
                let _ = responder.send(self.ctx.subtitles.verify_local_subtitles().await);
            }
            OverlayCommand::Shutdown { responder } => {
                self.shutdown.push(responder);
                return false;
            }
        }
        true
    }

    /// Processes commands queued before shutdown, bounded by the grace period.
    async fn drain(&mut self, receiver: &mut mpsc::Receiver<OverlayCommand>) {
        receiver.close();
        let grace = self.ctx.config.overlay.shutdown_grace;
        let drained = timeout(grace, async {
            while let Some(command) = receiver.recv().await {
                self.handle_command(command).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(?grace, "Shutdown grace elapsed, dropping pending overlay commands");
        }

        for responder in self.shutdown.drain(..) {
            let _ = responder.send(());
        }
    }

    async fn handle_inbound(&mut self, peer: &Permid, selversion: u32, message: &[u8]) {
        let (tag, body) = match split_frame(message) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::debug!(peer = %peer.short(), %error, "Dropping overlay message");
                return;
            }
        };

        let result = match MessageTag::from_byte(tag) {
            Some(MessageTag::GetMetadata) => self
                .ctx
                .exchange
                .handle_get_metadata(peer, body, selversion)
                .await
                .map(|_| ())
                .map_err(ShoalError::from),
            Some(MessageTag::Metadata) => self
                .ctx
                .exchange
                .handle_metadata(peer, body, selversion)
                .await
                .map(|_| ())
                .map_err(ShoalError::from),
            Some(MessageTag::GetSubs) if selversion >= OLPROTO_VER_FOURTEENTH => {
                self.handle_get_subs(peer, body).await.map_err(ShoalError::from)
            }
            Some(MessageTag::Subs) if selversion >= OLPROTO_VER_FOURTEENTH => {
                self.handle_subs(peer, body).await.map_err(ShoalError::from)
            }
            Some(MessageTag::Channelcast) => self
                .handle_channelcast(peer, body, selversion)
                .map_err(ShoalError::from),
            Some(tag) => {
                tracing::trace!(peer = %peer.short(), ?tag, selversion, "Ignoring overlay message");
                Ok(())
            }
            None => {
                tracing::debug!(peer = %peer.short(), tag, "Unknown overlay message tag");
                Ok(())
            }
        };

        if let Err(error) = result {
            tracing::debug!(peer = %peer.short(), tag, %error, "Dropping overlay message");
        }
    }

    async fn handle_get_subs(&mut self, peer: &Permid, body: &[u8]) -> Result<(), SubtitleError> {
        let request = GetSubsMessage::decode(body)?;
        let response = self.ctx.subtitles.serve(&request).await?;
        if response.is_empty() {
            tracing::debug!(
                peer = %peer.short(),
                info_hash = %request.info_hash,
                "No requested subtitle available locally"
            );
            return Ok(());
        }
        self.subs_wakeup = self.ctx.handler.enqueue_response(peer, &response, std_now());
        Ok(())
    }

    async fn handle_subs(&mut self, peer: &Permid, body: &[u8]) -> Result<(), SubtitleError> {
        let Some(subs) = self.ctx.handler.receive_subs(peer, body)? else {
            return Ok(());
        };
        let stored = self.ctx.subtitles.persist(&subs).await;
        for (callback, delivery) in self.ctx.handler.deliver(&subs.channel, &subs.info_hash, stored) {
            notify(callback, delivery);
        }
        Ok(())
    }

    fn handle_channelcast(&mut self, peer: &Permid, body: &[u8], selversion: u32) -> Result<(), OverlayError> {
        let entries = decode_channelcast(body)?;
        let requests = self
            .ctx
            .interceptor
            .handle_rich_metadata(peer, &entries, selversion, unix_now());
        for request in requests {
            if let Err(error) = self.send_request(&request, None) {
                tracing::debug!(
                    channel = %request.channel.short(),
                    info_hash = %request.info_hash,
                    %error,
                    "Could not fetch subscribed subtitles"
                );
            }
        }
        Ok(())
    }

    /// Delivers languages already on disk right away and asks peers for the rest.
    fn request_subtitles(
        &mut self,
        channel: Permid,
        info_hash: InfoHash,
        mask: u32,
    ) -> Result<mpsc::UnboundedReceiver<SubsDelivery>, SubtitleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = self.ctx.subtitles.local_have_mask(&channel, &info_hash)? & mask;
        if local != 0 {
            notify(
                Some(tx.clone()),
                SubsDelivery {
                    channel: channel.clone(),
                    info_hash,
                    mask: local,
                },
            );
        }

        let missing = mask & !local;
        if missing != 0 {
            let request = GetSubsMessage {
                channel,
                info_hash,
                mask: missing,
            };
            self.send_request(&request, Some(tx))?;
        }
        Ok(rx)
    }

    /// Sends `request` to the first selected peer that accepts it.
    fn send_request(&mut self, request: &GetSubsMessage, callback: SubsCallback) -> Result<(), SubtitleError> {
        let peers = self
            .ctx
            .subtitles
            .request_plan(&request.channel, &request.info_hash, request.mask)?;

        let mut last_error = None;
        for peer in &peers {
            match self.ctx.handler.send_request(peer, request, callback.clone(), std_now()) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!(peer = %peer.short(), %error, "GET_SUBS failed, trying next peer");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SubtitleError::Overlay(OverlayError::SendFailed {
                peer: request.channel.short(),
                reason: "no peer to ask".to_string(),
            })
        }))
    }

    async fn metadata_tick(&mut self) {
        match self.ctx.exchange.tick(Instant::now()).await {
            Ok(Some(info_hash)) => tracing::trace!(%info_hash, "Uploaded torrent"),
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "Torrent upload failed"),
        }
    }

    fn pump_subtitles(&mut self) {
        self.subs_wakeup = self.ctx.handler.pump(std_now());
    }

    fn cleanup_requests(&mut self) {
        let expired = self.ctx.handler.cleanup(std_now());
        if expired > 0 {
            tracing::debug!(expired, "Expired subtitle requests");
        }
    }

    fn cleanup_have_masks(&mut self) {
        let ttl = i64::try_from(self.ctx.config.subtitles.have_ttl.as_secs()).unwrap_or(i64::MAX);
        let limit_ts = unix_now().saturating_sub(ttl);
        match self.ctx.subtitles.have().cleanup_old(limit_ts) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Removed stale have-masks"),
            Err(error) => tracing::warn!(%error, "Have-mask cleanup failed"),
        }
    }
}

fn notify(callback: SubsCallback, delivery: SubsDelivery) {
    if let Some(tx) = callback {
        // The requester may have stopped listening.
        let _ = tx.send(delivery);
    }
}
