//! The resource-pool tree.
//!
//! Process-wide state owned by the scheduler. Each pool protects itself
//! with its own mutex; the tree map is read-mostly. Tree walks lock one
//! pool at a time, children before siblings, and never walk upward while
//! holding a child.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use regatta_core::{epoch_millis, Gang, PoolId, PoolSpec, Resources, TaskId, TaskType};
use regatta_task::PoolAllocations;

use crate::entitlement::{compute_entitlements, PoolSnapshot};
use crate::error::{PoolError, PoolResult};
use crate::pool::{PoolNode, ReadyEntry};

/// Point-in-time usage summary of a pool, for the API surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub spec: PoolSpec,
    pub allocation: Resources,
    pub entitlement: Resources,
    pub demand: Resources,
    pub pending_gangs: usize,
    pub ready_gangs: usize,
    pub frozen: bool,
}

/// The tree of resource pools.
pub struct PoolTree {
    pools: RwLock<HashMap<PoolId, Arc<Mutex<PoolNode>>>>,
    root_id: PoolId,
    /// Cluster capacity distributed from the root.
    capacity: Mutex<Resources>,
    /// Signalled whenever a gang lands in a ready queue.
    ready_notify: Notify,
}

impl PoolTree {
    /// Create a tree with the given root. The root's reservation doubles
    /// as the initial cluster capacity.
    pub fn new(root_spec: PoolSpec) -> Arc<Self> {
        let root_id = root_spec.id.clone();
        let capacity = root_spec.reservation;
        let mut pools = HashMap::new();
        pools.insert(root_id.clone(), Arc::new(Mutex::new(PoolNode::new(root_spec))));
        Arc::new(Self {
            pools: RwLock::new(pools),
            root_id,
            capacity: Mutex::new(capacity),
            ready_notify: Notify::new(),
        })
    }

    pub fn root_id(&self) -> &PoolId {
        &self.root_id
    }

    /// Refresh the cluster capacity distributed from the root.
    pub fn set_capacity(&self, capacity: Resources) {
        *self.capacity.lock().unwrap() = capacity;
    }

    pub fn capacity(&self) -> Resources {
        *self.capacity.lock().unwrap()
    }

    fn node(&self, id: &PoolId) -> PoolResult<Arc<Mutex<PoolNode>>> {
        self.pools
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::NoSuchPool(id.clone()))
    }

    // ── Hierarchy management ───────────────────────────────────────

    /// Create a pool under `spec.parent_id`.
    pub fn create_pool(&self, spec: PoolSpec) -> PoolResult<PoolId> {
        let parent_id = spec
            .parent_id
            .clone()
            .ok_or_else(|| PoolError::InvalidHierarchy("pool needs a parent".to_string()))?;
        if parent_id == spec.id {
            return Err(PoolError::InvalidHierarchy(format!(
                "pool {} cannot be its own parent",
                spec.id
            )));
        }

        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(&spec.id) {
            return Err(PoolError::PoolExists(spec.id));
        }
        let parent = pools
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| PoolError::NoSuchPool(parent_id.clone()))?;

        {
            let parent_node = parent.lock().unwrap();
            if parent_node.frozen {
                return Err(PoolError::PoolGone(parent_id.clone()));
            }
            // A parent that already holds queued work is a leaf with jobs;
            // only pure inner nodes may grow children.
            if parent_node.pending_len() > 0 || parent_node.ready_len() > 0 {
                return Err(PoolError::InvalidHierarchy(format!(
                    "parent {parent_id} holds queued gangs"
                )));
            }

            // Sibling reservations must fit inside the parent's reservation.
            let mut reserved = spec.reservation;
            for sibling_id in &parent_node.children {
                if let Some(sibling) = pools.get(sibling_id) {
                    reserved = reserved.add(&sibling.lock().unwrap().spec.reservation);
                }
            }
            if !reserved.fits_in(&parent_node.spec.reservation) {
                return Err(PoolError::InvalidHierarchy(format!(
                    "child reservations exceed parent {parent_id} reservation"
                )));
            }
        }

        let id = spec.id.clone();
        pools.insert(id.clone(), Arc::new(Mutex::new(PoolNode::new(spec))));
        parent.lock().unwrap().children.push(id.clone());
        info!(pool_id = %id, parent = %parent_id, "resource pool created");
        Ok(id)
    }

    /// Remove a pool. Descendants are frozen: they stay queryable but
    /// reject new work with `PoolGone`.
    pub fn delete_pool(&self, id: &PoolId) -> PoolResult<()> {
        if *id == self.root_id {
            return Err(PoolError::InvalidHierarchy("cannot delete the root pool".into()));
        }
        let mut pools = self.pools.write().unwrap();
        let node = pools
            .remove(id)
            .ok_or_else(|| PoolError::NoSuchPool(id.clone()))?;

        let (parent_id, children) = {
            let node = node.lock().unwrap();
            (node.spec.parent_id.clone(), node.children.clone())
        };
        if let Some(parent) = parent_id.and_then(|p| pools.get(&p)) {
            parent.lock().unwrap().children.retain(|c| c != id);
        }

        // Freeze the orphaned subtree.
        let mut queue = children;
        while let Some(child_id) = queue.pop() {
            if let Some(child) = pools.get(&child_id) {
                let mut child = child.lock().unwrap();
                child.frozen = true;
                queue.extend(child.children.iter().cloned());
                warn!(pool_id = %child_id, "pool frozen: ancestor removed");
            }
        }
        info!(pool_id = %id, "resource pool deleted");
        Ok(())
    }

    pub fn contains(&self, id: &PoolId) -> bool {
        self.pools.read().unwrap().contains_key(id)
    }

    /// Update an existing pool's tunables (reservation, limit, weight,
    /// policy, preemptibility). Parent and identity are immutable, and
    /// the new reservation must keep both sides of the hierarchy
    /// invariant: siblings plus this pool still fit the parent, and this
    /// pool's own children still fit the new reservation.
    pub fn update_pool(&self, spec: PoolSpec) -> PoolResult<()> {
        let pools = self.pools.read().unwrap();
        let node = pools
            .get(&spec.id)
            .cloned()
            .ok_or_else(|| PoolError::NoSuchPool(spec.id.clone()))?;

        let (parent_id, children) = {
            let pool = node.lock().unwrap();
            if pool.spec.parent_id != spec.parent_id {
                return Err(PoolError::InvalidHierarchy(format!(
                    "pool {} cannot be re-parented",
                    spec.id
                )));
            }
            (pool.spec.parent_id.clone(), pool.children.clone())
        };

        if let Some(parent_id) = &parent_id {
            if let Some(parent) = pools.get(parent_id) {
                let parent_node = parent.lock().unwrap();
                let mut reserved = spec.reservation;
                for sibling_id in &parent_node.children {
                    if sibling_id == &spec.id {
                        continue;
                    }
                    if let Some(sibling) = pools.get(sibling_id) {
                        reserved = reserved.add(&sibling.lock().unwrap().spec.reservation);
                    }
                }
                if !reserved.fits_in(&parent_node.spec.reservation) {
                    return Err(PoolError::InvalidHierarchy(format!(
                        "child reservations exceed parent {parent_id} reservation"
                    )));
                }
            }
        }

        let mut child_sum = Resources::ZERO;
        for child_id in &children {
            if let Some(child) = pools.get(child_id) {
                child_sum = child_sum.add(&child.lock().unwrap().spec.reservation);
            }
        }
        if !child_sum.fits_in(&spec.reservation) {
            return Err(PoolError::InvalidHierarchy(format!(
                "child reservations exceed pool {} reservation",
                spec.id
            )));
        }

        node.lock().unwrap().spec = spec;
        Ok(())
    }

    // ── Queue operations ───────────────────────────────────────────

    /// Append gangs to a leaf's pending queue.
    pub fn enqueue_gangs(&self, pool_id: &PoolId, gangs: Vec<Gang>) -> PoolResult<()> {
        let node = self.node(pool_id)?;
        let mut pool = node.lock().unwrap();
        if pool.frozen {
            return Err(PoolError::PoolGone(pool_id.clone()));
        }
        if !pool.is_leaf() {
            return Err(PoolError::PoolNotLeaf(pool_id.clone()));
        }
        let count = gangs.len();
        for gang in gangs {
            pool.push_pending(gang);
        }
        debug!(pool_id = %pool_id, gangs = count, "gangs enqueued");
        Ok(())
    }

    /// Return a gang to its pool's ready queue, optionally gated by a
    /// placement backoff deadline. The gang's allocation is untouched:
    /// it was counted at admission and is only returned on completion.
    pub fn requeue_ready(&self, gang: Gang, not_before_ms: u64) -> PoolResult<()> {
        let pool_id = gang
            .tasks
            .first()
            .map(|t| t.respool_id.clone())
            .ok_or_else(|| PoolError::InvalidHierarchy("empty gang".to_string()))?;
        let node = self.node(&pool_id)?;
        node.lock().unwrap().push_ready(ReadyEntry {
            gang,
            not_before_ms,
        });
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Mark a still-queued task as dropped on next dequeue.
    pub fn mark_invalid_task(&self, pool_id: &PoolId, task_id: &TaskId) -> PoolResult<()> {
        let node = self.node(pool_id)?;
        node.lock().unwrap().add_invalid(task_id);
        Ok(())
    }

    /// Dequeue up to `limit` ready gangs of `task_type`, blocking up to
    /// `timeout` for the first one. Returns what is available at deadline.
    pub async fn dequeue_gangs(
        &self,
        limit: usize,
        task_type: TaskType,
        timeout: Duration,
    ) -> Vec<Gang> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let gangs = self.try_dequeue(limit, task_type);
            if !gangs.is_empty() {
                return gangs;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let _ = tokio::time::timeout_at(deadline, self.ready_notify.notified()).await;
        }
    }

    fn try_dequeue(&self, limit: usize, task_type: TaskType) -> Vec<Gang> {
        let now = epoch_millis();
        let mut gangs = Vec::new();
        for node in self.leaves() {
            let mut pool = node.lock().unwrap();
            while gangs.len() < limit {
                match pool.pop_ready(task_type, now) {
                    Some(gang) => gangs.push(gang),
                    None => break,
                }
            }
            if gangs.len() >= limit {
                break;
            }
        }
        gangs
    }

    // ── Scheduling tick ────────────────────────────────────────────

    /// Recompute entitlements and admit head gangs across all leaves.
    ///
    /// Leaves are visited in lexicographic pool-id order so ties break
    /// deterministically. Returns the admitted gangs.
    pub fn schedule_tick(&self, ready_queue_limit: usize) -> Vec<Gang> {
        let snapshots = self.snapshots();
        let entitlements =
            compute_entitlements(&self.root_id, &snapshots, self.capacity());

        let mut admitted = Vec::new();
        for (id, node) in self.sorted_pools() {
            let mut pool = node.lock().unwrap();
            if let Some(e) = entitlements.get(&id) {
                pool.entitlement = *e;
            }
            if pool.is_leaf() && !pool.frozen {
                admitted.extend(pool.admit(ready_queue_limit));
            }
        }
        if !admitted.is_empty() {
            self.ready_notify.notify_waiters();
        }
        admitted
    }

    /// Build per-pool snapshots with subtree demand rolled up.
    fn snapshots(&self) -> HashMap<PoolId, PoolSnapshot> {
        let pools = self.pools.read().unwrap();
        let mut snapshots: HashMap<PoolId, PoolSnapshot> = HashMap::new();
        for (id, node) in pools.iter() {
            let pool = node.lock().unwrap();
            snapshots.insert(
                id.clone(),
                PoolSnapshot {
                    id: id.clone(),
                    reservation: pool.spec.reservation,
                    limit: pool.spec.limit,
                    share_weight: pool.spec.share_weight,
                    preemptible: pool.spec.preemptible,
                    demand: if pool.is_leaf() { pool.demand() } else { Resources::ZERO },
                    children: pool.children.clone(),
                },
            );
        }
        drop(pools);

        // Roll leaf demand up into inner nodes.
        let root_demand = Self::rollup_demand(&self.root_id, &mut snapshots);
        if let Some(root) = snapshots.get_mut(&self.root_id) {
            root.demand = root_demand;
        }
        snapshots
    }

    fn rollup_demand(id: &PoolId, snapshots: &mut HashMap<PoolId, PoolSnapshot>) -> Resources {
        let Some(snap) = snapshots.get(id) else {
            return Resources::ZERO;
        };
        if snap.children.is_empty() {
            return snap.demand;
        }
        let children = snap.children.clone();
        let mut total = Resources::ZERO;
        for child in children {
            let child_demand = Self::rollup_demand(&child, snapshots);
            total = total.add(&child_demand);
        }
        if let Some(snap) = snapshots.get_mut(id) {
            snap.demand = total;
        }
        total
    }

    fn leaves(&self) -> Vec<Arc<Mutex<PoolNode>>> {
        self.sorted_pools()
            .into_iter()
            .filter(|(_, node)| node.lock().unwrap().is_leaf())
            .map(|(_, node)| node)
            .collect()
    }

    fn sorted_pools(&self) -> Vec<(PoolId, Arc<Mutex<PoolNode>>)> {
        let pools = self.pools.read().unwrap();
        let mut entries: Vec<(PoolId, Arc<Mutex<PoolNode>>)> = pools
            .iter()
            .map(|(id, node)| (id.clone(), Arc::clone(node)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn pool_status(&self, id: &PoolId) -> PoolResult<PoolStatus> {
        let node = self.node(id)?;
        let pool = node.lock().unwrap();
        Ok(PoolStatus {
            spec: pool.spec.clone(),
            allocation: pool.allocation,
            entitlement: pool.entitlement,
            demand: pool.demand(),
            pending_gangs: pool.pending_len(),
            ready_gangs: pool.ready_len(),
            frozen: pool.frozen,
        })
    }

    pub fn list_pools(&self) -> Vec<PoolStatus> {
        self.sorted_pools()
            .into_iter()
            .filter_map(|(id, _)| self.pool_status(&id).ok())
            .collect()
    }
}

impl PoolAllocations for PoolTree {
    fn subtract_allocation(&self, pool_id: &str, resources: &Resources) {
        let id = pool_id.to_string();
        match self.node(&id) {
            Ok(node) => {
                let mut pool = node.lock().unwrap();
                pool.allocation = pool.allocation.subtract(resources);
            }
            Err(_) => {
                warn!(pool_id = %pool_id, "allocation return for unknown pool dropped");
            }
        }
    }

    fn add_invalid_task(&self, pool_id: &str, task_id: &TaskId) {
        let _ = self.mark_invalid_task(&pool_id.to_string(), task_id);
    }
}
