//! Placement ranking for job dispatch.
//!
//! Pure functions; the registry gathers live counts and calls into here.

use crate::registration::ServiceRegistration;

/// A registration together with its live job counts for one job type.
#[derive(Debug, Clone)]
pub struct PlacementCandidate {
    pub registration: ServiceRegistration,
    /// `RUNNING` jobs of the requested type on this host.
    pub running: i64,
    /// `QUEUED` jobs of the requested type on this host.
    pub queued: i64,
}

impl PlacementCandidate {
    pub fn active(&self) -> i64 {
        self.running + self.queued
    }
}

/// Order candidates best-first.
///
/// Fewest running jobs wins, then fewest queued plus running. Remaining
/// ties keep the input order, which callers supply in registration
/// insertion order.
pub fn rank_candidates(mut candidates: Vec<PlacementCandidate>) -> Vec<PlacementCandidate> {
    // sort_by_key is stable
    candidates.sort_by_key(|c| (c.running, c.active()));
    candidates
}

/// Whether a host with `active_jobs` may take one more job.
///
/// Hosts that never registered a capacity are unbounded.
pub fn has_capacity(active_jobs: i64, max_concurrent_jobs: Option<u32>) -> bool {
    match max_concurrent_jobs {
        Some(max) => active_jobs < i64::from(max),
        None => true,
    }
}

/// Arithmetic mean of the given values, `None` for an empty input.
pub fn mean(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let total: i128 = values.iter().map(|v| i128::from(*v)).sum();
    Some((total / values.len() as i128) as i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
