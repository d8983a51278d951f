//! Fair-share entitlement calculation.
//!
//! Dominant-resource-fairness flavored, computed per dimension and per
//! tree level:
//!
//! 1. Each child first gets its guaranteed reservation, scaled down
//!    proportionally when siblings over-subscribe the parent.
//! 2. The remainder is distributed by share weight among children still
//!    demanding, clamped by their limits.
//! 3. Recurse with each child's entitlement as its capacity.
//!
//! A preemptible pool only keeps as much of its reservation as it demands;
//! a non-preemptible pool keeps its full scaled reservation as slack.

use std::collections::HashMap;

use regatta_core::{PoolId, ResourceKind, Resources};

const EPSILON: f64 = 1e-9;

/// Immutable view of one pool taken at the start of a scheduling tick.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub id: PoolId,
    pub reservation: Resources,
    pub limit: Resources,
    pub share_weight: f64,
    pub preemptible: bool,
    /// Allocation plus pending demand (leaves); subtree sum (inner nodes).
    pub demand: Resources,
    pub children: Vec<PoolId>,
}

/// Compute entitlements for the whole tree rooted at `root_id`.
///
/// `capacity` is the cluster capacity assigned to the root. The result is
/// idempotent: it reads the snapshots and mutates nothing else.
pub fn compute_entitlements(
    root_id: &PoolId,
    snapshots: &HashMap<PoolId, PoolSnapshot>,
    capacity: Resources,
) -> HashMap<PoolId, Resources> {
    let mut result = HashMap::new();
    if snapshots.contains_key(root_id) {
        result.insert(root_id.clone(), capacity);
        distribute(root_id, capacity, snapshots, &mut result);
    }
    result
}

fn distribute(
    node_id: &PoolId,
    available: Resources,
    snapshots: &HashMap<PoolId, PoolSnapshot>,
    result: &mut HashMap<PoolId, Resources>,
) {
    let Some(node) = snapshots.get(node_id) else {
        return;
    };
    if node.children.is_empty() {
        return;
    }

    let children: Vec<&PoolSnapshot> = node
        .children
        .iter()
        .filter_map(|id| snapshots.get(id))
        .collect();

    let mut entitlements: Vec<Resources> = vec![Resources::ZERO; children.len()];

    for kind in ResourceKind::ALL {
        let avail = available.get(kind);
        let total_reserved: f64 = children.iter().map(|c| c.reservation.get(kind)).sum();
        let scale = if total_reserved > avail && total_reserved > EPSILON {
            avail / total_reserved
        } else {
            1.0
        };

        // Phase 1: guaranteed reservations.
        let mut given = 0.0;
        for (i, child) in children.iter().enumerate() {
            let reserved = child.reservation.get(kind) * scale;
            let share = if child.preemptible {
                reserved.min(child.demand.get(kind))
            } else {
                reserved
            };
            let share = share.min(child.limit.get(kind));
            entitlements[i].set(kind, share);
            given += share;
        }

        // Phase 2: distribute the remainder by weight among demanding pools.
        let mut remainder = (avail - given).max(0.0);
        while remainder > EPSILON {
            let claimants: Vec<usize> = children
                .iter()
                .enumerate()
                .filter(|(i, c)| {
                    let cap = c.demand.get(kind).min(c.limit.get(kind));
                    cap - entitlements[*i].get(kind) > EPSILON
                })
                .map(|(i, _)| i)
                .collect();
            if claimants.is_empty() {
                break;
            }
            let total_weight: f64 = claimants.iter().map(|i| children[*i].share_weight).sum();
            if total_weight <= EPSILON {
                break;
            }

            let mut distributed = 0.0;
            for i in &claimants {
                let child = children[*i];
                let cap = child.demand.get(kind).min(child.limit.get(kind));
                let want = cap - entitlements[*i].get(kind);
                let offer = remainder * child.share_weight / total_weight;
                let grant = want.min(offer);
                let new_val = entitlements[*i].get(kind) + grant;
                entitlements[*i].set(kind, new_val);
                distributed += grant;
            }
            if distributed <= EPSILON {
                break;
            }
            remainder -= distributed;
        }
    }

    for (i, child) in children.iter().enumerate() {
        result.insert(child.id.clone(), entitlements[i]);
        distribute(&child.id, entitlements[i], snapshots, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        id: &str,
        reservation: f64,
        limit: f64,
        weight: f64,
        demand: f64,
        children: &[&str],
    ) -> PoolSnapshot {
        PoolSnapshot {
            id: id.to_string(),
            reservation: Resources::new(reservation, 0.0, 0.0, 0.0),
            limit: Resources::new(limit, 0.0, 0.0, 0.0),
            share_weight: weight,
            preemptible: true,
            demand: Resources::new(demand, 0.0, 0.0, 0.0),
            children: children.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn tree(pools: Vec<PoolSnapshot>) -> HashMap<PoolId, PoolSnapshot> {
        pools.into_iter().map(|p| (p.id.clone(), p)).collect()
    }

    #[test]
    fn zero_demand_yields_zero_entitlement() {
        let snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["a"]),
            snapshot("a", 5.0, 10.0, 1.0, 0.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        assert_eq!(ents["a"].cpu, 0.0);
    }

    #[test]
    fn reservation_satisfied_before_weight_split() {
        let snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["a", "b"]),
            snapshot("a", 6.0, 10.0, 1.0, 8.0, &[]),
            snapshot("b", 4.0, 10.0, 1.0, 4.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        // a: 6 reserved; b: 4 reserved. Nothing left over.
        assert!((ents["a"].cpu - 6.0).abs() < 1e-6);
        assert!((ents["b"].cpu - 4.0).abs() < 1e-6);
    }

    #[test]
    fn remainder_split_by_weight() {
        let snapshots = tree(vec![
            snapshot("root", 12.0, 12.0, 1.0, 0.0, &["a", "b"]),
            snapshot("a", 2.0, 12.0, 2.0, 12.0, &[]),
            snapshot("b", 2.0, 12.0, 1.0, 12.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(12.0, 0.0, 0.0, 0.0));
        // Phase 1 gives each its 2.0 reservation; remaining 8 split 2:1.
        assert!((ents["a"].cpu - (2.0 + 16.0 / 3.0)).abs() < 1e-6);
        assert!((ents["b"].cpu - (2.0 + 8.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn limit_clamps_entitlement() {
        let snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["a", "b"]),
            snapshot("a", 1.0, 3.0, 1.0, 10.0, &[]),
            snapshot("b", 1.0, 10.0, 1.0, 10.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        // a is capped at its limit; b soaks up the rest of the demand.
        assert!((ents["a"].cpu - 3.0).abs() < 1e-6);
        assert!((ents["b"].cpu - 7.0).abs() < 1e-6);
    }

    #[test]
    fn oversubscribed_reservations_scale_down() {
        let snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["a", "b"]),
            snapshot("a", 8.0, 10.0, 1.0, 10.0, &[]),
            snapshot("b", 8.0, 10.0, 1.0, 10.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        // 16 reserved against 10 available: each scaled to 5.
        assert!((ents["a"].cpu - 5.0).abs() < 1e-6);
        assert!((ents["b"].cpu - 5.0).abs() < 1e-6);
    }

    #[test]
    fn non_preemptible_pool_keeps_slack() {
        let mut snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["a", "b"]),
            snapshot("a", 6.0, 10.0, 1.0, 0.0, &[]),
            snapshot("b", 4.0, 10.0, 1.0, 10.0, &[]),
        ]);
        snapshots.get_mut("a").unwrap().preemptible = false;

        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        // a demands nothing but keeps its reservation; b gets the rest.
        assert!((ents["a"].cpu - 6.0).abs() < 1e-6);
        assert!((ents["b"].cpu - 4.0).abs() < 1e-6);
    }

    #[test]
    fn recursion_flows_through_inner_nodes() {
        let snapshots = tree(vec![
            snapshot("root", 10.0, 10.0, 1.0, 0.0, &["org"]),
            snapshot("org", 10.0, 10.0, 1.0, 10.0, &["x", "y"]),
            snapshot("x", 5.0, 10.0, 1.0, 5.0, &[]),
            snapshot("y", 5.0, 10.0, 1.0, 5.0, &[]),
        ]);
        let ents =
            compute_entitlements(&"root".to_string(), &snapshots, Resources::new(10.0, 0.0, 0.0, 0.0));
        // The org node passes its entitlement down to the leaves.
        assert!((ents["x"].cpu - 5.0).abs() < 1e-6);
        assert!((ents["y"].cpu - 5.0).abs() < 1e-6);
    }
}
