//! Process-wide scheduler counters.
//!
//! Lock-free counters bumped by the tracker on every state transition and
//! by the pipeline components on notable events (launches, matches,
//! rescinds). Rendered into the Prometheus text exposition format for the
//! `/metrics` route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::TaskState;

/// Per-state gauges plus pipeline event counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Tasks currently in each state, indexed by `TaskState::ALL` order.
    state_gauges: [AtomicU64; 16],
    pub transitions_total: AtomicU64,
    pub invalid_transitions_total: AtomicU64,
    pub gangs_admitted_total: AtomicU64,
    pub placements_total: AtomicU64,
    pub placement_retries_total: AtomicU64,
    pub launches_total: AtomicU64,
    pub launch_failures_total: AtomicU64,
    pub offers_added_total: AtomicU64,
    pub offers_rescinded_total: AtomicU64,
    pub offers_pruned_total: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gauge(&self, state: TaskState) -> &AtomicU64 {
        let idx = TaskState::ALL.iter().position(|s| *s == state).unwrap_or(0);
        &self.state_gauges[idx]
    }

    /// Record a state transition: decrement `from`, increment `to`.
    pub fn record_transition(&self, from: TaskState, to: TaskState) {
        let g = self.gauge(from);
        // Saturating decrement; gauges must never wrap.
        let _ = g.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.gauge(to).fetch_add(1, Ordering::Relaxed);
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task entering its first state.
    pub fn record_enter(&self, state: TaskState) {
        self.gauge(state).fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task leaving the tracker from its final state.
    pub fn record_exit(&self, state: TaskState) {
        let g = self.gauge(state);
        let _ = g.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn tasks_in_state(&self, state: TaskState) -> u64 {
        self.gauge(state).load(Ordering::Relaxed)
    }
}

/// Render the counters into Prometheus text format.
pub fn render_prometheus(m: &SchedulerMetrics) -> String {
    let mut out = String::new();

    out.push_str("# HELP regatta_tasks Number of tracked tasks per state.\n");
    out.push_str("# TYPE regatta_tasks gauge\n");
    for state in TaskState::ALL {
        out.push_str(&format!(
            "regatta_tasks{{state=\"{}\"}} {}\n",
            state.name(),
            m.tasks_in_state(state)
        ));
    }

    let counters: [(&str, &AtomicU64, &str); 10] = [
        ("regatta_transitions_total", &m.transitions_total, "Total task state transitions."),
        ("regatta_invalid_transitions_total", &m.invalid_transitions_total, "Rejected illegal transitions."),
        ("regatta_gangs_admitted_total", &m.gangs_admitted_total, "Gangs moved pending to ready."),
        ("regatta_placements_total", &m.placements_total, "Gangs bound to a host."),
        ("regatta_placement_retries_total", &m.placement_retries_total, "Gangs returned to ready after a placement round."),
        ("regatta_launches_total", &m.launches_total, "Launch requests accepted by the cluster manager."),
        ("regatta_launch_failures_total", &m.launch_failures_total, "Launch requests rejected by the cluster manager."),
        ("regatta_offers_added_total", &m.offers_added_total, "Host offers added to the pool."),
        ("regatta_offers_rescinded_total", &m.offers_rescinded_total, "Host offers rescinded by the cluster manager."),
        ("regatta_offers_pruned_total", &m.offers_pruned_total, "Host offers declined after exceeding hold time."),
    ];
    for (name, counter, help) in counters {
        out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
        out.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
    }

    out
}
