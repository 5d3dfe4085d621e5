//! Picks peers to ask for subtitles.

use super::have::HaveEntry;
use crate::torrent::Permid;

/// Orders the peers worth asking for `requested` languages.
///
/// Peers holding more of the requested languages come first, ties broken by
/// the most recent advertisement. The channel publisher is always the last
/// resort and takes the final slot of the `max_peers` budget.
pub fn select_peers(
    entries: &[HaveEntry],
    publisher: &Permid,
    requested: u32,
    max_peers: usize,
) -> Vec<Permid> {
    if max_peers == 0 || requested == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<&HaveEntry> = entries
        .iter()
        .filter(|entry| entry.peer != *publisher && entry.have_mask & requested != 0)
        .collect();
    candidates.sort_by(|a, b| {
        let overlap = |entry: &HaveEntry| (entry.have_mask & requested).count_ones();
        overlap(b)
            .cmp(&overlap(a))
            .then(b.received_ts.cmp(&a.received_ts))
    });

    let mut peers: Vec<Permid> = candidates
        .into_iter()
        .take(max_peers - 1)
        .map(|entry| entry.peer.clone())
        .collect();
    peers.push(publisher.clone());
    peers
}
