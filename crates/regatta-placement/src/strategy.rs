//! Pluggable placement strategies.
//!
//! A strategy picks one host for a gang out of the candidates the matcher
//! claimed. `batch` takes the first candidate and places immediately;
//! `scored` ranks candidates by a weighted bin-packing score and is
//! willing to spend extra rounds looking for a better host.

use std::sync::Arc;

use regatta_core::config::PlacementStrategyKind;
use regatta_core::{Gang, Resources};
use regatta_offerpool::ClaimedHost;

pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the chosen host among the candidates, if any is usable.
    fn place_gang(&self, gang: &Gang, hosts: &[ClaimedHost]) -> Option<usize>;

    /// How many candidate hosts one matching round should claim.
    fn fanout(&self) -> u32;

    /// Whether the engine should keep looking for a better host across
    /// rounds (bounded by the per-type max-rounds config).
    fn multi_round(&self) -> bool;
}

/// First candidate wins. The workhorse for batch workloads where
/// placement latency beats placement quality.
pub struct BatchStrategy;

impl PlacementStrategy for BatchStrategy {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn place_gang(&self, _gang: &Gang, hosts: &[ClaimedHost]) -> Option<usize> {
        if hosts.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    fn fanout(&self) -> u32 {
        1
    }

    fn multi_round(&self) -> bool {
        false
    }
}

/// Weighted bin-packing: prefer the host that will be fullest after the
/// gang lands, so large offers stay whole for large gangs.
pub struct ScoredStrategy;

impl ScoredStrategy {
    /// Projected utilization of `host` after placing `demand`, 0..=100.
    fn score(demand: &Resources, host: &ClaimedHost) -> f64 {
        let mut total = 0.0;
        let mut dims = 0u32;
        for (need, have) in [
            (demand.cpu, host.resources.cpu),
            (demand.mem_mb, host.resources.mem_mb),
            (demand.disk_mb, host.resources.disk_mb),
            (demand.gpu, host.resources.gpu),
        ] {
            if have > 0.0 {
                total += (need / have).min(1.0) * 100.0;
                dims += 1;
            }
        }
        if dims == 0 {
            0.0
        } else {
            total / f64::from(dims)
        }
    }
}

impl PlacementStrategy for ScoredStrategy {
    fn name(&self) -> &'static str {
        "scored"
    }

    fn place_gang(&self, gang: &Gang, hosts: &[ClaimedHost]) -> Option<usize> {
        let demand = gang.demand();
        hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (i, Self::score(&demand, h)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
    }

    fn fanout(&self) -> u32 {
        5
    }

    fn multi_round(&self) -> bool {
        true
    }
}

/// Resolve the configured strategy.
pub fn strategy_for(kind: PlacementStrategyKind) -> Arc<dyn PlacementStrategy> {
    match kind {
        PlacementStrategyKind::Batch => Arc::new(BatchStrategy),
        PlacementStrategyKind::Scored => Arc::new(ScoredStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use regatta_core::{new_cm_task_id, TaskDesc, TaskSpec, TaskType};

    fn make_gang(cpu: f64, mem: f64) -> Gang {
        let mut spec = TaskSpec::default();
        spec.resources.scalar = Resources::new(cpu, mem, 0.0, 0.0);
        Gang::of(vec![TaskDesc {
            id: "j-0".into(),
            job_id: "j".into(),
            instance_idx: 0,
            task_type: TaskType::Batch,
            respool_id: "leaf".into(),
            priority: 1,
            preemptible: true,
            spec,
            cm_task_id: new_cm_task_id("j-0"),
        }])
    }

    fn make_host(name: &str, cpu: f64, mem: f64) -> ClaimedHost {
        ClaimedHost {
            hostname: name.to_string(),
            agent_id: format!("agent-{name}"),
            resources: Resources::new(cpu, mem, 0.0, 0.0),
            ports: vec![],
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn batch_takes_first_host() {
        let strategy = BatchStrategy;
        let gang = make_gang(1.0, 100.0);
        let hosts = vec![make_host("h1", 8.0, 800.0), make_host("h2", 2.0, 200.0)];

        assert_eq!(strategy.place_gang(&gang, &hosts), Some(0));
        assert_eq!(strategy.place_gang(&gang, &[]), None);
        assert!(!strategy.multi_round());
    }

    #[test]
    fn scored_prefers_tightest_fit() {
        let strategy = ScoredStrategy;
        let gang = make_gang(2.0, 200.0);
        // h2 would be ~100% utilized, h1 only 25%.
        let hosts = vec![make_host("h1", 8.0, 800.0), make_host("h2", 2.0, 200.0)];

        assert_eq!(strategy.place_gang(&gang, &hosts), Some(1));
    }

    #[test]
    fn strategy_lookup_matches_config() {
        assert_eq!(strategy_for(PlacementStrategyKind::Batch).name(), "batch");
        assert_eq!(strategy_for(PlacementStrategyKind::Scored).name(), "scored");
    }
}
