//! Tiered tracker lists with success promotion.

use rand::seq::SliceRandom;

/// Schemes this build can announce to.
const SUPPORTED_SCHEMES: [&str; 1] = ["http"];

/// Ordered tiers of equivalent trackers.
///
/// Members of a tier are shuffled once at load. A tracker that answers is
/// moved to the head of its tier so the next cycle starts with it.
/// Unsupported trackers keep their position but are never contacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerTiers {
    tiers: Vec<Vec<String>>,
}

impl TrackerTiers {
    /// Builds tiers from metainfo order, shuffling inside each tier.
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let mut rng = rand::rng();
        let mut tiers: Vec<Vec<String>> = tiers.into_iter().filter(|tier| !tier.is_empty()).collect();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }
        Self { tiers }
    }

    /// Builds tiers preserving the given order exactly.
    pub fn ordered(tiers: Vec<Vec<String>>) -> Self {
        Self {
            tiers: tiers.into_iter().filter(|tier| !tier.is_empty()).collect(),
        }
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Contact order for one cycle as `(tier, position, url)`, unsupported
    /// schemes excluded.
    pub fn candidates(&self) -> Vec<(usize, usize, String)> {
        self.tiers
            .iter()
            .enumerate()
            .flat_map(|(tier_index, tier)| {
                tier.iter()
                    .enumerate()
                    .filter(|(_, url)| is_supported(url))
                    .map(move |(position, url)| (tier_index, position, url.clone()))
            })
            .collect()
    }

    /// Moves `url` to the head of `tier`, if it is still a member.
    pub fn promote(&mut self, tier: usize, url: &str) {
        let Some(members) = self.tiers.get_mut(tier) else {
            return;
        };
        if let Some(position) = members.iter().position(|member| member == url) {
            if position != 0 {
                let tracker = members.remove(position);
                members.insert(0, tracker);
            }
        }
    }

    /// First supported tracker, used for scrapes.
    pub fn first_supported(&self) -> Option<&str> {
        self.tiers
            .iter()
            .flatten()
            .find(|url| is_supported(url))
            .map(String::as_str)
    }
}

/// Whether this build can talk to the tracker at `url`.
pub fn is_supported(url: &str) -> bool {
    url.split_once("://")
        .is_some_and(|(scheme, _)| SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn test_shuffle_keeps_membership() {
        let tiers = TrackerTiers::new(vec![urls(&["http://a", "http://b", "http://c"]), vec![]]);
        assert_eq!(tiers.tiers().len(), 1);

        let mut members = tiers.tiers()[0].clone();
        members.sort();
        assert_eq!(members, urls(&["http://a", "http://b", "http://c"]));
    }

    #[test]
    fn test_promotion_moves_to_head() {
        let mut tiers = TrackerTiers::ordered(vec![urls(&["http://t0", "http://t1", "http://t2"])]);
        tiers.promote(0, "http://t1");
        assert_eq!(tiers.tiers()[0], urls(&["http://t1", "http://t0", "http://t2"]));

        // Unknown tier or tracker is ignored
        tiers.promote(3, "http://t1");
        tiers.promote(0, "http://gone");
        assert_eq!(tiers.tiers()[0], urls(&["http://t1", "http://t0", "http://t2"]));
    }

    #[test]
    fn test_candidates_skip_unsupported_but_keep_positions() {
        let tiers = TrackerTiers::ordered(vec![
            urls(&["udp://u:80", "http://a/announce"]),
            urls(&["http://b/announce"]),
        ]);
        assert_eq!(
            tiers.candidates(),
            vec![
                (0, 1, "http://a/announce".to_string()),
                (1, 0, "http://b/announce".to_string()),
            ]
        );
        assert_eq!(tiers.tiers()[0][0], "udp://u:80");
        assert_eq!(tiers.first_supported(), Some("http://a/announce"));
    }

    #[test]
    fn test_scheme_support() {
        assert!(is_supported("http://tracker/announce"));
        assert!(is_supported("HTTP://tracker/announce"));
        assert!(!is_supported("udp://tracker:6969"));
        assert!(!is_supported("https://tracker/announce"));
        assert!(!is_supported("tracker/announce"));
    }
}
