//! Host matching against task-group filters.
//!
//! The matcher walks candidate hosts in a shuffled order, evaluates the
//! filter per host and records a result code for each, stopping once
//! enough hosts matched. It is stateless between calls; the only side
//! effect is the Placing marker the pool sets on matched hosts.

use std::collections::HashMap;

use regatta_core::{Constraint, Resources};

/// Filter describing what a task group needs from a host.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    /// Minimum scalar resources the host must offer.
    pub minimum: Resources,
    /// Number of dynamic ports needed.
    pub num_ports: u32,
    /// Scheduling constraint, if any.
    pub constraint: Option<Constraint>,
    /// Max hosts to match; 0 means unlimited.
    pub max_hosts: u32,
}

impl HostFilter {
    /// Effective limit on the number of matched hosts.
    pub fn effective_host_limit(&self) -> u32 {
        if self.max_hosts == 0 {
            u32::MAX
        } else {
            self.max_hosts
        }
    }
}

/// Per-host outcome of a filter evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterResult {
    Match,
    MismatchConstraints,
    MismatchResources,
    MismatchStatus,
    MismatchMaxHostLimit,
}

impl FilterResult {
    /// Histogram key.
    pub fn name(&self) -> &'static str {
        match self {
            FilterResult::Match => "match",
            FilterResult::MismatchConstraints => "mismatch_constraints",
            FilterResult::MismatchResources => "mismatch_resources",
            FilterResult::MismatchStatus => "mismatch_status",
            FilterResult::MismatchMaxHostLimit => "mismatch_max_host_limit",
        }
    }
}

/// Accumulates per-result counts across one matching walk.
#[derive(Debug, Default)]
pub struct MatchStats {
    counts: HashMap<&'static str, u32>,
    matched: u32,
}

impl MatchStats {
    pub fn record(&mut self, result: FilterResult) {
        *self.counts.entry(result.name()).or_insert(0) += 1;
        if result == FilterResult::Match {
            self.matched += 1;
        }
    }

    pub fn matched(&self) -> u32 {
        self.matched
    }

    /// Whether the walk already matched enough hosts for the filter.
    pub fn has_enough_hosts(&self, filter: &HostFilter) -> bool {
        self.matched >= filter.effective_host_limit()
    }

    pub fn into_counts(self) -> HashMap<&'static str, u32> {
        self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_hosts_means_unlimited() {
        let filter = HostFilter::default();
        assert_eq!(filter.effective_host_limit(), u32::MAX);

        let filter = HostFilter {
            max_hosts: 3,
            ..Default::default()
        };
        assert_eq!(filter.effective_host_limit(), 3);
    }

    #[test]
    fn stats_track_matches_against_limit() {
        let filter = HostFilter {
            max_hosts: 2,
            ..Default::default()
        };
        let mut stats = MatchStats::default();

        stats.record(FilterResult::MismatchResources);
        assert!(!stats.has_enough_hosts(&filter));

        stats.record(FilterResult::Match);
        stats.record(FilterResult::Match);
        assert!(stats.has_enough_hosts(&filter));

        let counts = stats.into_counts();
        assert_eq!(counts["match"], 2);
        assert_eq!(counts["mismatch_resources"], 1);
    }
}
