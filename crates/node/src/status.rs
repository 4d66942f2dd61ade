//! The per-node cache of observed block heights.

use std::time::{Duration, Instant};

/// A height as reported to callers, tagged with its freshness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed<T> {
    /// The value was read from the node just now.
    Fresh(T),
    /// The node did not answer (or answered with something lower than previously seen); the value
    /// is the last one seen, `age` ago.
    Stale { value: T, age: Duration },
    /// The node has never answered.
    Unknown,
}

impl<T: Copy> Observed<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Self::Fresh(value) | Self::Stale { value, .. } => Some(*value),
            Self::Unknown => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// The heights of one node: best block and finalized block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub highest_block: Observed<u64>,
    pub highest_finalized: Observed<u64>,
}

impl NodeStatus {
    /// `(highest_block, highest_finalized)` with freshness dropped.
    pub fn heights(&self) -> (Option<u64>, Option<u64>) {
        (self.highest_block.value(), self.highest_finalized.value())
    }

    pub fn is_fresh(&self) -> bool {
        self.highest_block.is_fresh() && self.highest_finalized.is_fresh()
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedHeight {
    height: u64,
    observed_at: Instant,
}

/// Last known heights of a node's database. Values only ever grow: an unknown or lower
/// observation never replaces what is cached. A purged database starts from a fresh cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusCache {
    highest_block: Option<CachedHeight>,
    highest_finalized: Option<CachedHeight>,
}

impl StatusCache {
    /// Merges one observation (`None` where a leg could not be read) and returns what should be
    /// reported for it.
    pub fn record(
        &mut self,
        highest_block: Option<u64>,
        highest_finalized: Option<u64>,
    ) -> NodeStatus {
        self.record_at(highest_block, highest_finalized, Instant::now())
    }

    fn record_at(
        &mut self,
        highest_block: Option<u64>,
        highest_finalized: Option<u64>,
        now: Instant,
    ) -> NodeStatus {
        NodeStatus {
            highest_block: merge(&mut self.highest_block, highest_block, now),
            highest_finalized: merge(&mut self.highest_finalized, highest_finalized, now),
        }
    }

    pub fn highest_block(&self) -> Option<u64> {
        self.highest_block.map(|cached| cached.height)
    }

    pub fn highest_finalized(&self) -> Option<u64> {
        self.highest_finalized.map(|cached| cached.height)
    }
}

fn merge(cached: &mut Option<CachedHeight>, observed: Option<u64>, now: Instant) -> Observed<u64> {
    match (observed, *cached) {
        (Some(height), Some(previous)) if height < previous.height => Observed::Stale {
            value: previous.height,
            age: now.saturating_duration_since(previous.observed_at),
        },
        (Some(height), _) => {
            *cached = Some(CachedHeight {
                height,
                observed_at: now,
            });
            Observed::Fresh(height)
        }
        (None, Some(previous)) => Observed::Stale {
            value: previous.height,
            age: now.saturating_duration_since(previous.observed_at),
        },
        (None, None) => Observed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_reads_are_answered_from_cache() {
        let start = Instant::now();
        let mut cache = StatusCache::default();

        let status = cache.record_at(Some(10), Some(8), start);
        assert!(status.is_fresh());
        assert_eq!(status.heights(), (Some(10), Some(8)));

        let later = start + Duration::from_secs(3);
        let status = cache.record_at(None, Some(9), later);
        assert_eq!(
            status.highest_block,
            Observed::Stale {
                value: 10,
                age: Duration::from_secs(3)
            }
        );
        assert_eq!(status.highest_finalized, Observed::Fresh(9));
        assert!(!status.is_fresh());
    }

    #[test]
    fn reported_heights_never_decrease() {
        let start = Instant::now();
        let mut cache = StatusCache::default();
        let observations = [
            (Some(5), Some(3)),
            (None, None),
            (Some(2), Some(1)),
            (Some(7), None),
            (Some(6), Some(6)),
        ];

        let mut last = (0, 0);
        for (step, (best, finalized)) in observations.into_iter().enumerate() {
            let now = start + Duration::from_secs(step as u64);
            let (best, finalized) = cache.record_at(best, finalized, now).heights();
            let (best, finalized) = (best.unwrap(), finalized.unwrap());
            assert!(best >= last.0 && finalized >= last.1, "step {step}");
            last = (best, finalized);
        }
        assert_eq!(last, (7, 6));
        assert_eq!(cache.highest_block(), Some(7));
        assert_eq!(cache.highest_finalized(), Some(6));
    }

    #[test]
    fn nothing_is_known_before_the_first_answer() {
        let mut cache = StatusCache::default();
        let status = cache.record(None, None);
        assert_eq!(status.highest_block, Observed::Unknown);
        assert_eq!(status.heights(), (None, None));
    }
}
