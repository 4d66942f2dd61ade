//! Convergence conditions of the cluster waits.

use std::time::Duration;

use chainrunner_config::WaitConfiguration;

/// How the finalized heights of the awaited nodes are judged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FinalizationMode {
    /// Every awaited node has finalized at least `old_finalized + finalized_delta`.
    #[default]
    Absolute,
    /// As [`FinalizationMode::Absolute`], and additionally every awaited node is within
    /// `catchup_delta` blocks of the highest finalized block among the other nodes.
    CatchUp { catchup_delta: u64 },
}

/// Time budget and polling interval of a wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            interval: Duration::from_secs(1),
        }
    }
}

impl From<&WaitConfiguration> for WaitOptions {
    fn from(configuration: &WaitConfiguration) -> Self {
        Self {
            timeout: configuration.timeout(),
            interval: configuration.interval(),
        }
    }
}

/// Decides whether the nodes at `targets` have finalized far enough. `finalized` holds the
/// finalized height of every node of the cluster, indexed by node; `None` is an unknown height.
///
/// A target with an unknown height is never satisfied. In catch-up mode nodes with unknown
/// heights do not count towards the peers' maximum, and a target without any known peer only
/// has to reach the floor.
pub fn finalization_reached(
    finalized: &[Option<u64>],
    targets: &[usize],
    floor: u64,
    mode: FinalizationMode,
) -> bool {
    targets.iter().all(|&target| {
        let Some(height) = finalized.get(target).copied().flatten() else {
            return false;
        };
        if height < floor {
            return false;
        }
        match mode {
            FinalizationMode::Absolute => true,
            FinalizationMode::CatchUp { catchup_delta } => {
                let peers_max = finalized
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != target)
                    .filter_map(|(_, height)| *height)
                    .max();
                peers_max.is_none_or(|peers_max| height.saturating_add(catchup_delta) >= peers_max)
            }
        }
    })
}

/// `true` when every node at `targets` has imported a block at `height` or above.
pub fn imported_reached(best: &[Option<u64>], targets: &[usize], height: u64) -> bool {
    targets
        .iter()
        .all(|&target| best.get(target).copied().flatten().is_some_and(|best| best >= height))
}
