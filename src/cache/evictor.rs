//! Eviction policy: decides which unreferenced cache entries go first, and how
//! far the primary index cache is shrunk under memory pressure.
//!
//! Two orders are supported:
//! - Largest first (sheds the biggest consumers fastest; used by the index cache)
//! - Least recently used

use std::collections::BinaryHeap;

use crate::config::percent_of;

/// Order in which unreferenced entries are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOrder {
    LargestFirst,
    LeastRecentlyUsed,
}

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<K> {
    pub key: K,
    pub size: usize,
    pub score: i128,
}

// Higher score = higher eviction priority (should be evicted first).
impl<K> PartialEq for EvictionCandidate<K> {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl<K> Eq for EvictionCandidate<K> {}

impl<K> PartialOrd for EvictionCandidate<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for EvictionCandidate<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.cmp(&other.score)
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    order: EvictionOrder,
}

impl Evictor {
    pub fn new(order: EvictionOrder) -> Self {
        Self { order }
    }

    /// Compute eviction priority from an entry's size and last access tick.
    pub fn compute_priority(&self, size: usize, last_access: u64) -> i128 {
        match self.order {
            EvictionOrder::LargestFirst => size as i128,
            EvictionOrder::LeastRecentlyUsed => -(last_access as i128),
        }
    }

    /// Pick victims until evicting them brings `current_size` to `target_size`.
    ///
    /// `candidates` yields `(key, size, last_access)` for unreferenced entries
    /// only. Returns keys ordered by eviction priority (highest first). If the
    /// candidates cannot free enough, all of them are returned.
    pub fn select_victims<K>(
        &self,
        candidates: impl Iterator<Item = (K, usize, u64)>,
        current_size: usize,
        target_size: usize,
    ) -> Vec<K> {
        if current_size <= target_size {
            return Vec::new();
        }

        let mut heap: BinaryHeap<EvictionCandidate<K>> = candidates
            .map(|(key, size, last_access)| EvictionCandidate {
                score: self.compute_priority(size, last_access),
                key,
                size,
            })
            .collect();

        let mut victims = Vec::new();
        let mut remaining = current_size;
        while remaining > target_size {
            match heap.pop() {
                Some(candidate) => {
                    remaining = remaining.saturating_sub(candidate.size);
                    victims.push(candidate.key);
                }
                None => break,
            }
        }
        victims
    }
}

/// Byte targets derived from the two memory-pressure watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub urgent: i64,
    pub high: i64,
}

impl Watermarks {
    /// Watermarks as percentages of `capacity`.
    pub fn new(capacity: i64, urgent_pct: i64, high_pct: i64) -> Self {
        Self {
            urgent: percent_of(capacity, urgent_pct),
            high: percent_of(capacity, high_pct),
        }
    }

    /// Target of the urgent stage, or `None` if `size` is at or below it.
    pub fn urgent_target(&self, size: i64) -> Option<i64> {
        (size > self.urgent).then_some(self.urgent)
    }

    /// Target of the damped high stage, or `None` if `size` is at or below it.
    ///
    /// Shrinks to `max(size * damping%, high)` so repeated calls under steady
    /// pressure make progress without all landing on the same threshold.
    pub fn high_target(&self, size: i64, damping_pct: i64) -> Option<i64> {
        (size > self.high).then(|| percent_of(size, damping_pct).max(self.high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_first_order() {
        let evictor = Evictor::new(EvictionOrder::LargestFirst);
        let candidates = vec![("a", 10, 0), ("b", 300, 1), ("c", 50, 2)];

        let victims = evictor.select_victims(candidates.into_iter(), 360, 100);
        assert_eq!(victims, vec!["b"]);
    }

    #[test]
    fn test_lru_order() {
        let evictor = Evictor::new(EvictionOrder::LeastRecentlyUsed);
        let candidates = vec![("new", 10, 9), ("old", 10, 1), ("mid", 10, 5)];

        let victims = evictor.select_victims(candidates.into_iter(), 30, 10);
        assert_eq!(victims, vec!["old", "mid"]);
    }

    #[test]
    fn test_not_enough_candidates_returns_all() {
        let evictor = Evictor::new(EvictionOrder::LargestFirst);
        let victims = evictor.select_victims(vec![(1, 5, 0), (2, 5, 0)].into_iter(), 100, 0);
        assert_eq!(victims.len(), 2);
    }

    #[test]
    fn test_below_target_selects_nothing() {
        let evictor = Evictor::new(EvictionOrder::LargestFirst);
        let victims = evictor.select_victims(vec![(1, 5, 0)].into_iter(), 5, 10);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_watermark_targets() {
        let wm = Watermarks::new(1000, 85, 75);
        assert_eq!(wm.urgent, 850);
        assert_eq!(wm.high, 750);

        assert_eq!(wm.urgent_target(900), Some(850));
        assert_eq!(wm.urgent_target(850), None);

        // 90% of 840 = 756 > 750
        assert_eq!(wm.high_target(840, 90), Some(756));
        // 90% of 800 = 720 < 750, clamp to high
        assert_eq!(wm.high_target(800, 90), Some(750));
        assert_eq!(wm.high_target(700, 90), None);
    }
}
