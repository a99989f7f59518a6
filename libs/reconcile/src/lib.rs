//! Capacity convergence primitives.
//!
//! Helpers for converging the number of running Elasticsearch tasks to the
//! configured cluster size. Key concepts:
//!
//! - **Desired count**: how many tasks the operator asked for.
//! - **Current count**: how many tasks the cluster state knows about.
//! - **Convergence**: offers grow the cluster, the reaper shrinks it.
//!
//! # Invariants
//!
//! - All functions are pure and deterministic given the same inputs
//! - Kill plans never exceed the number of tasks that exist

use std::collections::BTreeSet;
use std::time::Duration;

/// Capacity status of the cluster relative to its desired size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityStatus {
    /// Current count matches desired count.
    Converged,

    /// Fewer tasks than desired; new offers should be accepted.
    Under { missing: usize },

    /// More tasks than desired; the reaper should kill the excess.
    Over { excess: usize },
}

impl CapacityStatus {
    /// Classify a current task count against a desired count.
    ///
    /// A negative desired count is treated as "no tasks wanted".
    pub fn of(current: usize, desired: i64) -> Self {
        let excess = excess_count(current, desired);
        if excess > 0 {
            return Self::Over { excess };
        }

        let desired = usize::try_from(desired).unwrap_or(0);
        match desired.saturating_sub(current) {
            0 => Self::Converged,
            missing => Self::Under { missing },
        }
    }

    /// Returns true if the cluster has exactly the desired number of tasks.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if no more tasks should be launched.
    pub fn is_fulfilled(&self) -> bool {
        !matches!(self, Self::Under { .. })
    }
}

/// Number of tasks to kill so that `current` converges to `desired`.
///
/// `excess = current - desired`, clamped to `[0, current]`.
pub fn excess_count(current: usize, desired: i64) -> usize {
    let current_i = i64::try_from(current).unwrap_or(i64::MAX);
    let excess = current_i.saturating_sub(desired);
    if excess <= 0 {
        return 0;
    }
    usize::try_from(excess).unwrap_or(usize::MAX).min(current)
}

/// Select `count` victims from the tail of a listing.
///
/// The last element is selected first. The listing order is whatever the
/// caller's store returned; no recency ordering is implied.
pub fn select_from_tail<T>(items: &[T], count: usize) -> Vec<&T> {
    items.iter().rev().take(count).collect()
}

/// Smallest non-negative ordinal not present in `used`.
///
/// `{}` gives 0, `{0, 2}` gives 1, `{0, 1}` gives 2.
pub fn lowest_free_ordinal<I>(used: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let used: BTreeSet<u32> = used.into_iter().collect();
    let mut candidate = 0u32;
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// Default interval between reaper passes.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);
