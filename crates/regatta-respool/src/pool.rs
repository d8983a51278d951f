//! A single node of the resource-pool tree.
//!
//! Each pool guards its own queues and accounting with one mutex. Gangs
//! wait in the pending queue (priority buckets, FIFO within a bucket)
//! until the scheduler admits them into the ready queue, where the
//! placement engines pick them up.

use std::collections::{BTreeMap, HashSet, VecDeque};

use regatta_core::{Gang, PoolId, PoolSpec, Resources, TaskId};

/// A gang sitting in the ready queue.
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    pub gang: Gang,
    /// Unix ms before which the placement engine must not pick this gang
    /// up again (placement backoff). Zero = immediately eligible.
    pub not_before_ms: u64,
}

/// Mutable state of one pool node.
#[derive(Debug)]
pub struct PoolNode {
    pub spec: PoolSpec,
    pub children: Vec<PoolId>,
    /// Pending gangs by priority; drained highest priority first,
    /// FIFO within a bucket.
    pending: BTreeMap<u32, VecDeque<Gang>>,
    ready: VecDeque<ReadyEntry>,
    /// Tasks killed before admission; dropped lazily at dequeue.
    invalid: HashSet<TaskId>,
    /// Resources admitted (ready and beyond) and not yet returned.
    pub allocation: Resources,
    /// Fair share computed at the last scheduling tick.
    pub entitlement: Resources,
    /// True when the parent was removed; all operations fail with PoolGone.
    pub frozen: bool,
}

impl PoolNode {
    pub fn new(spec: PoolSpec) -> Self {
        Self {
            spec,
            children: Vec::new(),
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            invalid: HashSet::new(),
            allocation: Resources::ZERO,
            entitlement: Resources::ZERO,
            frozen: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    // ── Pending queue ──────────────────────────────────────────────

    pub fn push_pending(&mut self, gang: Gang) {
        self.pending
            .entry(gang.priority())
            .or_default()
            .push_back(gang);
    }

    /// Demand of everything still waiting for admission.
    pub fn pending_demand(&self) -> Resources {
        self.pending
            .values()
            .flatten()
            .fold(Resources::ZERO, |acc, g| acc.add(&g.demand()))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Peek the demand of the next admissible gang, highest priority first.
    pub fn head_pending_demand(&self) -> Option<Resources> {
        self.pending
            .iter()
            .rev()
            .flat_map(|(_, bucket)| bucket.front())
            .next()
            .map(|g| g.demand())
    }

    /// Pop the head gang, dropping member tasks marked invalid. Returns
    /// `None` when the queue is empty; a gang whose tasks were all
    /// invalidated is discarded and the next head is popped instead.
    pub fn pop_pending(&mut self) -> Option<Gang> {
        loop {
            let priority = *self.pending.keys().next_back()?;
            let bucket = self.pending.get_mut(&priority)?;
            let mut gang = bucket.pop_front()?;
            if bucket.is_empty() {
                self.pending.remove(&priority);
            }

            if !self.invalid.is_empty() {
                gang.tasks.retain(|t| !self.invalid.remove(&t.id));
            }
            if !gang.tasks.is_empty() {
                return Some(gang);
            }
        }
    }

    pub fn add_invalid(&mut self, task_id: &TaskId) {
        self.invalid.insert(task_id.clone());
    }

    /// Drop invalidated tasks from the head gang, discarding gangs that
    /// become empty, so the head demand reflects what would be admitted.
    fn clean_head(&mut self) {
        loop {
            let Some(priority) = self.pending.keys().next_back().copied() else {
                return;
            };
            let bucket = self.pending.get_mut(&priority).unwrap();
            let Some(head) = bucket.front_mut() else {
                self.pending.remove(&priority);
                continue;
            };
            if !self.invalid.is_empty() {
                head.tasks.retain(|t| !self.invalid.remove(&t.id));
            }
            if head.tasks.is_empty() {
                bucket.pop_front();
                if bucket.is_empty() {
                    self.pending.remove(&priority);
                }
                continue;
            }
            return;
        }
    }

    /// Move head gangs pending -> ready while the pool's entitlement
    /// covers them and the ready queue has room. Admitted demand is added
    /// to the allocation. Returns the admitted gangs in order.
    pub fn admit(&mut self, ready_queue_limit: usize) -> Vec<Gang> {
        let mut admitted = Vec::new();
        loop {
            if self.ready_len() >= ready_queue_limit {
                break;
            }
            self.clean_head();
            let Some(demand) = self.head_pending_demand() else {
                break;
            };
            if !self.allocation.add(&demand).fits_in(&self.entitlement) {
                break;
            }
            let Some(gang) = self.pop_pending() else {
                break;
            };
            self.allocation = self.allocation.add(&gang.demand());
            self.push_ready(ReadyEntry {
                gang: gang.clone(),
                not_before_ms: 0,
            });
            admitted.push(gang);
        }
        admitted
    }

    // ── Ready queue ────────────────────────────────────────────────

    pub fn push_ready(&mut self, entry: ReadyEntry) {
        self.ready.push_back(entry);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Pop the first ready gang that matches the type filter and whose
    /// backoff gate has passed. Entries that are not yet eligible keep
    /// their queue position.
    pub fn pop_ready(
        &mut self,
        task_type: regatta_core::TaskType,
        now_ms: u64,
    ) -> Option<Gang> {
        let idx = self.ready.iter().position(|e| {
            e.not_before_ms <= now_ms
                && (task_type == regatta_core::TaskType::Unknown
                    || e.gang.task_type() == task_type)
        })?;
        self.ready.remove(idx).map(|e| e.gang)
    }

    /// Demand already admitted plus still pending.
    pub fn demand(&self) -> Resources {
        self.allocation.add(&self.pending_demand())
    }
}
