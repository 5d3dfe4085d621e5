//! Subtitle message handling: outgoing requests, response filtering and
//! paced SUBS uploads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::coalesce::CoalesceTable;
use super::languages;
use super::messages::{GetSubsMessage, SubsMessage};
use super::SubtitleError;
use crate::config::SubtitlesConfig;
use crate::network::TokenBucket;
use crate::overlay::OverlaySender;
use crate::torrent::{InfoHash, Permid};

const KIB: f64 = 1024.0;

/// Languages that arrived for a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsDelivery {
    pub channel: Permid,
    pub info_hash: InfoHash,
    pub mask: u32,
}

impl SubsDelivery {
    pub fn languages(&self) -> Vec<&'static str> {
        languages::codes_of(self.mask)
    }
}

struct QueuedUpload {
    peer: Permid,
    message: Vec<u8>,
}

/// Owns the coalesce table and the SUBS upload queue.
///
/// `C` is whatever the caller wants handed back when languages arrive.
pub struct SubtitleHandler<C> {
    sender: Arc<dyn OverlaySender>,
    requests: CoalesceTable<C>,
    /// `None` when uploads are disabled
    bucket: Option<TokenBucket>,
    queue: VecDeque<QueuedUpload>,
    next_upload_time: Option<Instant>,
    max_subtitle_size: usize,
    message_budget: usize,
    request_validity: Duration,
}

impl<C: Clone> SubtitleHandler<C> {
    pub fn new(config: &SubtitlesConfig, sender: Arc<dyn OverlaySender>, now: Instant) -> Self {
        let bucket = (config.upload_rate_kib > 0 && config.max_subs_message_size_kib > 0).then(|| {
            TokenBucket::new(
                f64::from(config.max_subs_message_size_kib),
                f64::from(config.upload_rate_kib),
                now,
            )
        });
        if bucket.is_none() {
            tracing::info!("Subtitle uploads disabled");
        }

        Self {
            sender,
            requests: CoalesceTable::new(),
            bucket,
            queue: VecDeque::new(),
            next_upload_time: None,
            max_subtitle_size: config.max_subtitle_size,
            message_budget: config.max_subs_message_size_kib as usize * 1024,
            request_validity: config.request_validity,
        }
    }

    /// Sends `request` to `peer` and records it as outstanding.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::Overlay` - If the message could not be queued for `peer`
    pub fn send_request(
        &mut self,
        peer: &Permid,
        request: &GetSubsMessage,
        callback: C,
        now: Instant,
    ) -> Result<(), SubtitleError> {
        self.sender.send(peer, request.encode())?;
        self.requests
            .add(&request.channel, request.info_hash, request.mask, callback, now);
        tracing::debug!(
            peer = %peer.short(),
            channel = %request.channel.short(),
            info_hash = %request.info_hash,
            languages = ?request.languages(),
            "Requested subtitles"
        );
        Ok(())
    }

    /// Decodes a SUBS body and keeps only what may be delivered.
    ///
    /// Languages nobody is waiting for are dropped, and so is every subtitle
    /// that would push the message over the per-message budget. Returns
    /// `None` when nothing is left.
    ///
    /// # Errors
    ///
    /// - Any decoding error of [`SubsMessage::decode`]
    pub fn receive_subs(
        &self,
        from: &Permid,
        body: &[u8],
    ) -> Result<Option<SubsMessage>, SubtitleError> {
        let mut subs = SubsMessage::decode(body, self.max_subtitle_size)?;
        let outstanding = self.requests.outstanding(&subs.channel, &subs.info_hash);

        let mut used = 0usize;
        subs.contents.retain(|lang, content| {
            let requested = languages::bit(lang).is_ok_and(|bit| outstanding & bit != 0);
            if !requested {
                tracing::debug!(peer = %from.short(), lang, "Dropping unrequested subtitle");
                return false;
            }
            if used + content.len() > self.message_budget {
                tracing::debug!(peer = %from.short(), lang, size = content.len(), "Subtitle exceeds message budget");
                return false;
            }
            used += content.len();
            true
        });

        Ok((!subs.is_empty()).then_some(subs))
    }

    /// Settles outstanding requests with the languages that were stored.
    pub fn deliver(
        &mut self,
        channel: &Permid,
        info_hash: &InfoHash,
        stored_mask: u32,
    ) -> Vec<(C, SubsDelivery)> {
        self.requests
            .on_response(channel, info_hash, stored_mask)
            .into_iter()
            .map(|(callback, mask)| {
                (
                    callback,
                    SubsDelivery {
                        channel: channel.clone(),
                        info_hash: *info_hash,
                        mask,
                    },
                )
            })
            .collect()
    }

    /// Queues `subs` for `peer` and uploads what the bucket allows.
    ///
    /// Returns when the upload loop wants to run next, if anything is left.
    pub fn enqueue_response(&mut self, peer: &Permid, subs: &SubsMessage, now: Instant) -> Option<Instant> {
        let Some(bucket) = &self.bucket else {
            tracing::debug!(peer = %peer.short(), "Subtitle uploads disabled, dropping response");
            return self.next_upload_time;
        };
        if subs.is_empty() {
            return self.next_upload_time;
        }

        let message = subs.encode();
        let size_kib = message.len() as f64 / KIB;
        if size_kib > bucket.capacity() {
            tracing::debug!(
                peer = %peer.short(),
                info_hash = %subs.info_hash,
                size_kib,
                "SUBS message larger than the upload bucket, dropping"
            );
            return self.next_upload_time;
        }

        self.queue.push_back(QueuedUpload {
            peer: peer.clone(),
            message,
        });
        self.pump(now)
    }

    /// Sends queued responses while the bucket has tokens.
    ///
    /// Returns the next wakeup, or `None` once the queue is empty.
    pub fn pump(&mut self, now: Instant) -> Option<Instant> {
        if self.next_upload_time.is_some_and(|next| next > now) {
            return self.next_upload_time;
        }
        self.next_upload_time = None;

        let Some(bucket) = self.bucket.as_mut() else {
            self.queue.clear();
            return None;
        };

        while let Some(upload) = self.queue.front() {
            let size_kib = upload.message.len() as f64 / KIB;
            if !bucket.consume(size_kib, now) {
                let delay = bucket.seconds_until(size_kib, now);
                let next = now + Duration::from_secs_f64(delay);
                self.next_upload_time = Some(next);
                return Some(next);
            }

            if let Some(upload) = self.queue.pop_front() {
                match self.sender.send(&upload.peer, upload.message) {
                    Ok(()) => {
                        tracing::debug!(peer = %upload.peer.short(), size_kib, "Sent subtitles");
                    }
                    Err(error) => {
                        tracing::debug!(peer = %upload.peer.short(), %error, "Failed to send subtitles");
                    }
                }
            }
        }
        None
    }

    /// Expires requests older than the validity window.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        self.requests.cleanup(now, self.request_validity)
    }

    pub fn outstanding(&self, channel: &Permid, info_hash: &InfoHash) -> u32 {
        self.requests.outstanding(channel, info_hash)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn next_upload_time(&self) -> Option<Instant> {
        self.next_upload_time
    }
}
