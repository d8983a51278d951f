//! Per-host aggregate of held offers.
//!
//! A host's offers share a single state: either all of them are available
//! to the matcher (Ready) or none are. Transitions are driven by the
//! offer pool under the host's own mutex.

use std::collections::HashMap;

use serde::Serialize;

use regatta_core::{HostOffer, Resources};

use crate::matcher::{FilterResult, HostFilter};

/// State of all offers on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Offers available to the matcher.
    Ready,
    /// Being considered by a placement round.
    Placing,
    /// Resources reserved for a stateful task.
    Reserved,
    /// Held back from matching by an operator.
    Held,
    /// Host is being decommissioned; no new work.
    Draining,
}

/// Aggregated view of one host's held offers.
#[derive(Debug, Clone)]
pub struct HostSummary {
    pub hostname: String,
    pub agent_id: String,
    pub state: HostState,
    offers: HashMap<String, HostOffer>,
    /// Unix ms when the oldest currently-held offer arrived.
    oldest_offer_ms: u64,
}

impl HostSummary {
    pub fn new(hostname: &str, agent_id: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            agent_id: agent_id.to_string(),
            state: HostState::Ready,
            offers: HashMap::new(),
            oldest_offer_ms: 0,
        }
    }

    /// Merge an offer in, stamping the hold clock.
    pub fn add_offer(&mut self, offer: HostOffer, now_ms: u64) {
        if self.offers.is_empty() || self.oldest_offer_ms == 0 {
            self.oldest_offer_ms = now_ms;
        }
        self.offers.insert(offer.id.clone(), offer);
    }

    /// Remove one offer by id. Returns whether it existed.
    pub fn remove_offer(&mut self, offer_id: &str) -> bool {
        let existed = self.offers.remove(offer_id).is_some();
        if self.offers.is_empty() {
            self.oldest_offer_ms = 0;
        }
        existed
    }

    /// Drain all offers, e.g. when they are consumed by a launch or
    /// declined back to the cluster manager.
    pub fn take_offers(&mut self) -> Vec<HostOffer> {
        self.oldest_offer_ms = 0;
        self.offers.drain().map(|(_, o)| o).collect()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Combined scalar resources across held offers.
    pub fn total_resources(&self) -> Resources {
        self.offers
            .values()
            .fold(Resources::ZERO, |acc, o| acc.add(&o.resources))
    }

    /// All offered ports, deduplicated across offers.
    pub fn available_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.offers.values().flat_map(|o| o.ports.clone()).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Merged attribute map across offers (later offers win on conflict).
    pub fn attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        for offer in self.offers.values() {
            attrs.extend(offer.attributes.clone());
        }
        attrs
    }

    /// Age of the oldest held offer.
    pub fn oldest_offer_age_ms(&self, now_ms: u64) -> u64 {
        if self.oldest_offer_ms == 0 {
            0
        } else {
            now_ms.saturating_sub(self.oldest_offer_ms)
        }
    }

    /// Evaluate a filter against this host without mutating state.
    pub fn try_match(&self, filter: &HostFilter) -> FilterResult {
        if self.state != HostState::Ready {
            return FilterResult::MismatchStatus;
        }
        if let Some(constraint) = &filter.constraint {
            if !constraint.matches(&self.attributes()) {
                return FilterResult::MismatchConstraints;
            }
        }
        if !filter.minimum.fits_in(&self.total_resources()) {
            return FilterResult::MismatchResources;
        }
        if (self.available_ports().len() as u32) < filter.num_ports {
            return FilterResult::MismatchResources;
        }
        FilterResult::Match
    }

    /// Ready -> Placing; the host leaves the matcher's view.
    pub fn claim(&mut self) {
        self.state = HostState::Placing;
    }

    /// Placing -> Ready; offers become matchable again.
    pub fn release(&mut self) {
        if self.state == HostState::Placing {
            self.state = HostState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regatta_core::Constraint;

    fn make_offer(id: &str, cpu: f64, ports: Vec<u16>) -> HostOffer {
        HostOffer {
            id: id.to_string(),
            hostname: "h1".to_string(),
            agent_id: "agent-1".to_string(),
            resources: Resources::new(cpu, cpu * 100.0, 0.0, 0.0),
            ports,
            attributes: HashMap::from([("zone".to_string(), "a".to_string())]),
            expiry: 0,
        }
    }

    fn filter(cpu: f64, num_ports: u32) -> HostFilter {
        HostFilter {
            minimum: Resources::new(cpu, 0.0, 0.0, 0.0),
            num_ports,
            constraint: None,
            max_hosts: 0,
        }
    }

    #[test]
    fn offers_merge_and_sum() {
        let mut summary = HostSummary::new("h1", "agent-1");
        summary.add_offer(make_offer("o1", 2.0, vec![100, 101]), 1_000);
        summary.add_offer(make_offer("o2", 3.0, vec![101, 102]), 2_000);

        assert_eq!(summary.offer_count(), 2);
        assert_eq!(summary.total_resources().cpu, 5.0);
        assert_eq!(summary.available_ports(), vec![100, 101, 102]);
        assert_eq!(summary.oldest_offer_age_ms(5_000), 4_000);
    }

    #[test]
    fn match_requires_ready_state() {
        let mut summary = HostSummary::new("h1", "agent-1");
        summary.add_offer(make_offer("o1", 4.0, vec![100]), 0);

        assert_eq!(summary.try_match(&filter(1.0, 0)), FilterResult::Match);

        summary.claim();
        assert_eq!(summary.state, HostState::Placing);
        assert_eq!(summary.try_match(&filter(1.0, 0)), FilterResult::MismatchStatus);

        summary.release();
        assert_eq!(summary.try_match(&filter(1.0, 0)), FilterResult::Match);
    }

    #[test]
    fn match_checks_resources_and_ports() {
        let mut summary = HostSummary::new("h1", "agent-1");
        summary.add_offer(make_offer("o1", 2.0, vec![100]), 0);

        assert_eq!(
            summary.try_match(&filter(4.0, 0)),
            FilterResult::MismatchResources
        );
        assert_eq!(
            summary.try_match(&filter(1.0, 2)),
            FilterResult::MismatchResources
        );
    }

    #[test]
    fn match_evaluates_constraints() {
        let mut summary = HostSummary::new("h1", "agent-1");
        summary.add_offer(make_offer("o1", 4.0, vec![]), 0);

        let mut f = filter(1.0, 0);
        f.constraint = Some(Constraint::HostLabel {
            key: "zone".into(),
            value: "a".into(),
        });
        assert_eq!(summary.try_match(&f), FilterResult::Match);

        f.constraint = Some(Constraint::HostLabel {
            key: "zone".into(),
            value: "b".into(),
        });
        assert_eq!(summary.try_match(&f), FilterResult::MismatchConstraints);
    }

    #[test]
    fn remove_last_offer_resets_hold_clock() {
        let mut summary = HostSummary::new("h1", "agent-1");
        summary.add_offer(make_offer("o1", 2.0, vec![]), 1_000);
        assert!(summary.remove_offer("o1"));
        assert!(summary.is_empty());
        assert_eq!(summary.oldest_offer_age_ms(10_000), 0);
        assert!(!summary.remove_offer("o1"));
    }
}
