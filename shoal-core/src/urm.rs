//! Upload-rate maximizer.
//!
//! Keeps the aggregate upload of all torrents near a configured cap. It
//! starts a queued low-priority torrent when upload stays under the cap,
//! stops the least important torrent it started when upload stays over it,
//! and redistributes reserved per-torrent upload rates every tick.
//!
//! The maximizer decides; the caller applies the returned [`UrmAction`]s.

use std::time::Instant;

use serde::Serialize;

use crate::config::UrmConfig;
use crate::torrent::InfoHash;

/// Lifecycle state of a torrent as the maximizer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UrmTorrentState {
    /// Waiting to be started
    Queued,
    /// Downloading or seeding
    Active,
    /// Verifying data on disk
    Checking,
    Stopped,
}

/// Snapshot of one torrent for a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrmTorrent {
    pub info_hash: InfoHash,
    pub state: UrmTorrentState,
    /// Higher is more important
    pub priority: i32,
    /// Started by the maximizer rather than by the user
    pub started_by_urm: bool,
    /// Measured upload rate in KiB/s
    pub upload_rate_kib: f64,
    /// Currently reserved upload rate in KiB/s
    pub reserved_rate_kib: f64,
}

impl UrmTorrent {
    /// Uses (nearly) all of its reservation.
    fn wants_more(&self) -> bool {
        self.upload_rate_kib + 1.0 >= self.reserved_rate_kib
    }
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UrmAction {
    Start { info_hash: InfoHash },
    Stop { info_hash: InfoHash },
    SetReservedRate { info_hash: InfoHash, rate_kib: f64 },
}

/// Hysteresis state across ticks.
#[derive(Debug)]
pub struct UploadRateMaximizer {
    config: UrmConfig,
    under_since: Option<Instant>,
    over_since: Option<Instant>,
}

impl UploadRateMaximizer {
    pub fn new(config: UrmConfig) -> Self {
        Self {
            config,
            under_since: None,
            over_since: None,
        }
    }

    pub fn config(&self) -> &UrmConfig {
        &self.config
    }

    /// Runs one control step over `torrents`.
    pub fn tick(&mut self, now: Instant, torrents: &[UrmTorrent]) -> Vec<UrmAction> {
        if !self.config.enabled || self.config.max_upload_rate_kib == 0 {
            return Vec::new();
        }
        if torrents
            .iter()
            .any(|torrent| torrent.state == UrmTorrentState::Checking)
        {
            tracing::trace!("Torrent checking data, upload-rate maximizer idle");
            self.under_since = None;
            self.over_since = None;
            return Vec::new();
        }

        let cap = f64::from(self.config.max_upload_rate_kib);
        let min_rate = f64::from(self.config.min_rate_kib);
        let total: f64 = active(torrents).map(|torrent| torrent.upload_rate_kib).sum();

        let mut actions = Vec::new();
        if let Some(action) = self.hysteresis(now, torrents, total, cap, min_rate) {
            actions.push(action);
        }
        actions.extend(self.reserve(torrents, cap, min_rate));
        actions
    }

    fn hysteresis(
        &mut self,
        now: Instant,
        torrents: &[UrmTorrent],
        total: f64,
        cap: f64,
        min_rate: f64,
    ) -> Option<UrmAction> {
        let hysteresis = self.config.hysteresis;

        if total + min_rate < cap {
            self.over_since = None;
            let since = *self.under_since.get_or_insert(now);
            if now.saturating_duration_since(since) <= hysteresis {
                return None;
            }
            self.under_since = None;
            let candidate = torrents
                .iter()
                .filter(|torrent| torrent.state == UrmTorrentState::Queued)
                .max_by_key(|torrent| torrent.priority)?;
            tracing::info!(info_hash = %candidate.info_hash, total, cap, "Upload under cap, starting torrent");
            return Some(UrmAction::Start {
                info_hash: candidate.info_hash,
            });
        }
        self.under_since = None;

        if total > cap {
            let since = *self.over_since.get_or_insert(now);
            if now.saturating_duration_since(since) <= hysteresis {
                return None;
            }
            self.over_since = None;
            let victim = active(torrents)
                .filter(|torrent| torrent.started_by_urm)
                .min_by_key(|torrent| torrent.priority)?;
            tracing::info!(info_hash = %victim.info_hash, total, cap, "Upload over cap, stopping torrent");
            return Some(UrmAction::Stop {
                info_hash: victim.info_hash,
            });
        }
        self.over_since = None;
        None
    }

    /// Redistributes reserved rates over active torrents.
    fn reserve(&self, torrents: &[UrmTorrent], cap: f64, min_rate: f64) -> Vec<UrmAction> {
        let mut reserved: Vec<(&UrmTorrent, f64)> = active(torrents)
            .map(|torrent| (torrent, torrent.reserved_rate_kib.max(min_rate)))
            .collect();
        if reserved.is_empty() {
            return Vec::new();
        }

        // Raise torrents saturating their reservation with the slack
        let slack = cap - reserved.iter().map(|(_, rate)| rate).sum::<f64>();
        let wanting = reserved.iter().filter(|(torrent, _)| torrent.wants_more()).count();
        if slack > 0.0 && wanting > 0 {
            let share = slack / wanting as f64;
            for (torrent, rate) in &mut reserved {
                if torrent.wants_more() {
                    *rate += share;
                }
            }
        }

        // Recover any deficit with a flat reduction
        let deficit = reserved.iter().map(|(_, rate)| rate).sum::<f64>() - cap;
        if deficit > 0.0 {
            let flat = deficit / reserved.len() as f64;
            for (_, rate) in &mut reserved {
                *rate = (*rate - flat).max(min_rate);
            }
        }

        if self.config.prioritize_local {
            prioritize_local(&mut reserved, min_rate);
        }

        reserved
            .into_iter()
            .filter(|(torrent, rate)| (torrent.reserved_rate_kib - rate).abs() > f64::EPSILON)
            .map(|(torrent, rate)| UrmAction::SetReservedRate {
                info_hash: torrent.info_hash,
                rate_kib: rate,
            })
            .collect()
    }
}

/// Moves bandwidth from maximizer-started torrents to user torrents that
/// saturate their reservation.
fn prioritize_local(reserved: &mut [(&UrmTorrent, f64)], min_rate: f64) {
    let wanted: f64 = reserved
        .iter()
        .filter(|(torrent, _)| !torrent.started_by_urm && torrent.wants_more())
        .map(|_| min_rate)
        .sum();
    if wanted <= 0.0 {
        return;
    }

    let mut taken = 0.0;
    for (torrent, rate) in reserved.iter_mut() {
        if taken >= wanted {
            break;
        }
        if torrent.started_by_urm && *rate > min_rate {
            let take = (*rate - min_rate).min(wanted - taken);
            *rate -= take;
            taken += take;
        }
    }
    if taken <= 0.0 {
        return;
    }

    let receivers = reserved
        .iter()
        .filter(|(torrent, _)| !torrent.started_by_urm && torrent.wants_more())
        .count() as f64;
    for (torrent, rate) in reserved.iter_mut() {
        if !torrent.started_by_urm && torrent.wants_more() {
            *rate += taken / receivers;
        }
    }
}

fn active(torrents: &[UrmTorrent]) -> impl Iterator<Item = &UrmTorrent> {
    torrents
        .iter()
        .filter(|torrent| torrent.state == UrmTorrentState::Active)
}
