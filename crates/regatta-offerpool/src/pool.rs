//! The offer pool.
//!
//! Holds unused cluster-manager offers bucketed by host, exposes them to
//! the matcher, and declines offers whose hold time expired. Host entries
//! protect themselves with their own mutex; the host map is read-mostly.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{epoch_millis, HostOffer, Resources};

use crate::matcher::{FilterResult, HostFilter, MatchStats};
use crate::summary::{HostState, HostSummary};

/// A host matched for placement, with everything the engine needs to
/// bind tasks onto it.
#[derive(Debug, Clone)]
pub struct ClaimedHost {
    pub hostname: String,
    pub agent_id: String,
    pub resources: Resources,
    pub ports: Vec<u16>,
    pub attributes: HashMap<String, String>,
}

/// Invoked with offers that are being returned to the cluster manager.
pub type DeclineListener = Arc<dyn Fn(Vec<HostOffer>) + Send + Sync>;

pub struct OfferPool {
    hosts: RwLock<HashMap<String, Arc<Mutex<HostSummary>>>>,
    offer_hold: Duration,
    pruning_period: Duration,
    metrics: Arc<SchedulerMetrics>,
    decline_listener: RwLock<Option<DeclineListener>>,
}

impl OfferPool {
    pub fn new(
        offer_hold: Duration,
        pruning_period: Duration,
        metrics: Arc<SchedulerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts: RwLock::new(HashMap::new()),
            offer_hold,
            pruning_period,
            metrics,
            decline_listener: RwLock::new(None),
        })
    }

    /// Wire the CM decline path. Set once at startup.
    pub fn set_decline_listener(&self, listener: DeclineListener) {
        *self.decline_listener.write().unwrap() = Some(listener);
    }

    // ── Intake ─────────────────────────────────────────────────────

    /// Bucket incoming offers by hostname and merge them into summaries.
    pub fn add_offers(&self, offers: Vec<HostOffer>) {
        let now = epoch_millis();
        let mut hosts = self.hosts.write().unwrap();
        for offer in offers {
            let summary = hosts
                .entry(offer.hostname.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(HostSummary::new(&offer.hostname, &offer.agent_id)))
                });
            summary.lock().unwrap().add_offer(offer, now);
            self.metrics.offers_added_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a single offer, wherever it is held.
    ///
    /// Returns true if the offer was found. An emptied host entry is
    /// dropped unless a placement round is holding it.
    pub fn rescind_offer(&self, offer_id: &str) -> bool {
        let mut hosts = self.hosts.write().unwrap();
        let mut emptied: Option<String> = None;
        let mut found = false;
        for (hostname, summary) in hosts.iter() {
            let mut s = summary.lock().unwrap();
            if s.remove_offer(offer_id) {
                found = true;
                self.metrics
                    .offers_rescinded_total
                    .fetch_add(1, Ordering::Relaxed);
                if s.is_empty() && s.state != HostState::Placing {
                    emptied = Some(hostname.clone());
                }
                break;
            }
        }
        if let Some(hostname) = emptied {
            hosts.remove(&hostname);
            debug!(host = %hostname, "host entry dropped after rescind");
        }
        found
    }

    // ── Matching ───────────────────────────────────────────────────

    /// Match hosts against a filter, moving matched hosts Ready ->
    /// Placing. Returns the claimed hosts and the per-result histogram.
    pub fn claim_for_place(
        &self,
        filter: &HostFilter,
    ) -> (Vec<ClaimedHost>, HashMap<&'static str, u32>) {
        let candidates: Vec<(String, Arc<Mutex<HostSummary>>)> = {
            let hosts = self.hosts.read().unwrap();
            hosts
                .iter()
                .map(|(h, s)| (h.clone(), Arc::clone(s)))
                .collect()
        };
        // Pseudo-randomized walk so one hot host is not hammered.
        let mut shuffled = candidates;
        shuffled.shuffle(&mut rand::thread_rng());

        let mut stats = MatchStats::default();
        let mut claimed = Vec::new();
        for (_, summary) in shuffled {
            if stats.has_enough_hosts(filter) {
                stats.record(FilterResult::MismatchMaxHostLimit);
                continue;
            }
            let mut s = summary.lock().unwrap();
            let result = s.try_match(filter);
            stats.record(result);
            if result == FilterResult::Match {
                s.claim();
                claimed.push(ClaimedHost {
                    hostname: s.hostname.clone(),
                    agent_id: s.agent_id.clone(),
                    resources: s.total_resources(),
                    ports: s.available_ports(),
                    attributes: s.attributes(),
                });
            }
        }
        (claimed, stats.into_counts())
    }

    /// Return claimed hosts to the matcher: Placing -> Ready.
    pub fn release_host_offers(&self, hostnames: &[String]) {
        let hosts = self.hosts.read().unwrap();
        for hostname in hostnames {
            if let Some(summary) = hosts.get(hostname) {
                summary.lock().unwrap().release();
            }
        }
    }

    /// Consume the offers backing a successful launch. The host entry is
    /// dropped; fresh offers for it will arrive from the CM.
    pub fn consume_host_offers(&self, hostnames: &[String]) {
        let mut hosts = self.hosts.write().unwrap();
        for hostname in hostnames {
            if hosts.remove(hostname).is_some() {
                debug!(host = %hostname, "offers consumed by launch");
            }
        }
    }

    // ── Draining & pruning ─────────────────────────────────────────

    /// Operator path: stop matching a host ahead of decommission.
    pub fn start_drain(&self, hostname: &str) {
        let hosts = self.hosts.read().unwrap();
        if let Some(summary) = hosts.get(hostname) {
            let mut s = summary.lock().unwrap();
            s.state = HostState::Draining;
            info!(host = %hostname, "host draining");
        }
    }

    /// Tracker notification that a host runs no more tasks. Completes an
    /// in-progress drain by declining the host's remaining offers; a
    /// no-op for hosts that are not draining.
    pub fn mark_host_drained(&self, hostname: &str) {
        let drained = {
            let mut hosts = self.hosts.write().unwrap();
            match hosts.get(hostname) {
                Some(summary) if summary.lock().unwrap().state == HostState::Draining => {
                    hosts.remove(hostname)
                }
                _ => {
                    debug!(host = %hostname, "host empty; not draining");
                    return;
                }
            }
        };
        if let Some(summary) = drained {
            let offers = summary.lock().unwrap().take_offers();
            info!(host = %hostname, offers = offers.len(), "host drained");
            if !offers.is_empty() {
                if let Some(listener) = self.decline_listener.read().unwrap().clone() {
                    listener(offers);
                }
            }
        }
    }

    /// Decline offers held longer than `offer_hold` on hosts not in
    /// Placing. Returns the number of offers pruned.
    pub fn prune(&self) -> usize {
        let now = epoch_millis();
        let hold_ms = self.offer_hold.as_millis() as u64;
        let mut pruned_offers = Vec::new();

        {
            let mut hosts = self.hosts.write().unwrap();
            let expired: Vec<String> = hosts
                .iter()
                .filter(|(_, summary)| {
                    let s = summary.lock().unwrap();
                    s.state != HostState::Placing && s.oldest_offer_age_ms(now) >= hold_ms
                })
                .map(|(hostname, _)| hostname.clone())
                .collect();

            for hostname in expired {
                if let Some(summary) = hosts.remove(&hostname) {
                    let offers = summary.lock().unwrap().take_offers();
                    warn!(host = %hostname, offers = offers.len(), "pruning aged offers");
                    pruned_offers.extend(offers);
                }
            }
        }

        let count = pruned_offers.len();
        if count > 0 {
            self.metrics
                .offers_pruned_total
                .fetch_add(count as u64, Ordering::Relaxed);
            if let Some(listener) = self.decline_listener.read().unwrap().clone() {
                listener(pruned_offers);
            }
        }
        count
    }

    /// Run the pruner until shutdown.
    pub async fn run_pruner(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_secs = self.pruning_period.as_secs(),
            hold_secs = self.offer_hold.as_secs(),
            "offer pruner started"
        );
        let mut interval = tokio::time::interval(self.pruning_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pruned = self.prune();
                    if pruned > 0 {
                        debug!(pruned, "offer pruner pass");
                    }
                }
                _ = shutdown.changed() => {
                    info!("offer pruner shutting down");
                    break;
                }
            }
        }
    }

    // ── Stats ──────────────────────────────────────────────────────

    pub fn host_count(&self) -> usize {
        self.hosts.read().unwrap().len()
    }

    pub fn hosts_in_state(&self, state: HostState) -> usize {
        let hosts = self.hosts.read().unwrap();
        hosts
            .values()
            .filter(|s| s.lock().unwrap().state == state)
            .count()
    }

    /// Combined capacity of all currently held offers.
    pub fn total_capacity(&self) -> Resources {
        let hosts = self.hosts.read().unwrap();
        hosts.values().fold(Resources::ZERO, |acc, s| {
            acc.add(&s.lock().unwrap().total_resources())
        })
    }

    /// Current state of a host, if known.
    pub fn host_state(&self, hostname: &str) -> Option<HostState> {
        let hosts = self.hosts.read().unwrap();
        hosts.get(hostname).map(|s| s.lock().unwrap().state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_pool(hold: Duration) -> Arc<OfferPool> {
        OfferPool::new(hold, Duration::from_secs(60), SchedulerMetrics::new())
    }

    fn make_offer(id: &str, host: &str, cpu: f64) -> HostOffer {
        HostOffer {
            id: id.to_string(),
            hostname: host.to_string(),
            agent_id: format!("agent-{host}"),
            resources: Resources::new(cpu, cpu * 100.0, 0.0, 0.0),
            ports: vec![100, 101],
            attributes: HashMap::new(),
            expiry: 0,
        }
    }

    fn cpu_filter(cpu: f64) -> HostFilter {
        HostFilter {
            minimum: Resources::new(cpu, 0.0, 0.0, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn add_and_claim_round_trip() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![
            make_offer("o1", "h1", 4.0),
            make_offer("o2", "h2", 2.0),
        ]);
        assert_eq!(pool.host_count(), 2);

        let (claimed, counts) = pool.claim_for_place(&cpu_filter(3.0));
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].hostname, "h1");
        assert_eq!(counts["match"], 1);
        assert_eq!(counts["mismatch_resources"], 1);
        assert_eq!(pool.host_state("h1"), Some(HostState::Placing));

        // A second claim sees no Ready host with enough capacity.
        let (claimed, counts) = pool.claim_for_place(&cpu_filter(3.0));
        assert!(claimed.is_empty());
        assert_eq!(counts["mismatch_status"], 1);

        // Release puts the host back.
        pool.release_host_offers(&["h1".to_string()]);
        assert_eq!(pool.host_state("h1"), Some(HostState::Ready));
        let (claimed, _) = pool.claim_for_place(&cpu_filter(3.0));
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn max_hosts_limits_matches() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![
            make_offer("o1", "h1", 4.0),
            make_offer("o2", "h2", 4.0),
            make_offer("o3", "h3", 4.0),
        ]);

        let filter = HostFilter {
            minimum: Resources::new(1.0, 0.0, 0.0, 0.0),
            max_hosts: 2,
            ..Default::default()
        };
        let (claimed, counts) = pool.claim_for_place(&filter);
        assert_eq!(claimed.len(), 2);
        assert_eq!(counts["mismatch_max_host_limit"], 1);
    }

    #[test]
    fn rescind_restores_prior_state() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![make_offer("o1", "h1", 4.0)]);

        assert!(pool.rescind_offer("o1"));
        assert_eq!(pool.host_count(), 0);
        assert!(!pool.rescind_offer("o1"));
    }

    #[test]
    fn consume_drops_host_entry() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![make_offer("o1", "h1", 4.0)]);
        pool.claim_for_place(&cpu_filter(1.0));

        pool.consume_host_offers(&["h1".to_string()]);
        assert_eq!(pool.host_count(), 0);
    }

    #[test]
    fn draining_host_is_not_matchable() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![make_offer("o1", "h1", 4.0)]);

        pool.start_drain("h1");
        let (claimed, counts) = pool.claim_for_place(&cpu_filter(1.0));
        assert!(claimed.is_empty());
        assert_eq!(counts["mismatch_status"], 1);
    }

    #[test]
    fn drain_completion_declines_remaining_offers() {
        let pool = make_pool(Duration::from_secs(300));
        let declined = Arc::new(AtomicUsize::new(0));
        let declined_clone = declined.clone();
        pool.set_decline_listener(Arc::new(move |offers| {
            declined_clone.fetch_add(offers.len(), Ordering::SeqCst);
        }));
        pool.add_offers(vec![make_offer("o1", "h1", 4.0)]);

        // Empty-host notification on a healthy host changes nothing.
        pool.mark_host_drained("h1");
        assert_eq!(pool.host_count(), 1);
        assert_eq!(declined.load(Ordering::SeqCst), 0);

        // Once draining, the same notification releases the host.
        pool.start_drain("h1");
        pool.mark_host_drained("h1");
        assert_eq!(pool.host_count(), 0);
        assert_eq!(declined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pruner_declines_aged_offers_but_spares_placing() {
        let pool = make_pool(Duration::ZERO);
        let declined = Arc::new(AtomicUsize::new(0));
        let declined_clone = declined.clone();
        pool.set_decline_listener(Arc::new(move |offers| {
            declined_clone.fetch_add(offers.len(), Ordering::SeqCst);
        }));

        pool.add_offers(vec![
            make_offer("o1", "h1", 4.0),
            make_offer("o2", "h2", 4.0),
        ]);
        // Claim h1 and h2, then release only h2: h1 stays Placing.
        let (claimed, _) = pool.claim_for_place(&cpu_filter(1.0));
        assert_eq!(claimed.len(), 2);
        pool.release_host_offers(&["h2".to_string()]);

        // Hold time is zero: everything not Placing is pruned.
        let pruned = pool.prune();
        assert_eq!(pruned, 1);
        assert_eq!(declined.load(Ordering::SeqCst), 1);
        assert_eq!(pool.host_count(), 1);
        assert_eq!(pool.host_state("h1"), Some(HostState::Placing));
    }

    #[test]
    fn total_capacity_sums_offers() {
        let pool = make_pool(Duration::from_secs(300));
        pool.add_offers(vec![
            make_offer("o1", "h1", 4.0),
            make_offer("o2", "h2", 2.0),
        ]);
        assert_eq!(pool.total_capacity().cpu, 6.0);
    }
}
