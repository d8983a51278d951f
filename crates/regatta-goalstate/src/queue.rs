//! Time-bucketed delay queue.
//!
//! Entries become visible once their deadline passes. A min-heap under a
//! mutex plus a notify for waiters; enqueueing an id twice is harmless
//! because every consumer step is idempotent.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use regatta_core::epoch_millis;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline_ms: u64,
    id: String,
}

/// A delay queue of entity ids.
#[derive(Default)]
pub struct DelayQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `id` to become due at `now + delay`.
    pub fn enqueue(&self, id: &str, delay: Duration) {
        let deadline_ms = epoch_millis() + delay.as_millis() as u64;
        self.heap.lock().unwrap().push(Reverse(Entry {
            deadline_ms,
            id: id.to_string(),
        }));
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }

    /// Pop one due entry, if any.
    pub fn pop_due(&self) -> Option<String> {
        let now = epoch_millis();
        let mut heap = self.heap.lock().unwrap();
        if heap.peek().is_some_and(|Reverse(e)| e.deadline_ms <= now) {
            return heap.pop().map(|Reverse(e)| e.id);
        }
        None
    }

    /// Milliseconds until the earliest entry is due (zero if one already is).
    fn wait_hint_ms(&self) -> Option<u64> {
        let now = epoch_millis();
        let heap = self.heap.lock().unwrap();
        heap.peek()
            .map(|Reverse(e)| e.deadline_ms.saturating_sub(now))
    }

    /// Wait until an entry is due and pop it.
    pub async fn pop(&self) -> String {
        loop {
            if let Some(id) = self.pop_due() {
                return id;
            }
            match self.wait_hint_ms() {
                // Sleep toward the earliest deadline, but wake early if a
                // nearer entry arrives.
                Some(ms) => {
                    let sleep = tokio::time::sleep(Duration::from_millis(ms.max(1)));
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_entries_are_due() {
        let q = DelayQueue::new();
        q.enqueue("a", Duration::ZERO);
        assert_eq!(q.pop_due(), Some("a".to_string()));
        assert_eq!(q.pop_due(), None);
    }

    #[test]
    fn delayed_entries_wait_their_turn() {
        let q = DelayQueue::new();
        q.enqueue("later", Duration::from_secs(60));
        assert_eq!(q.pop_due(), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn earliest_deadline_pops_first() {
        let q = DelayQueue::new();
        q.enqueue("b", Duration::ZERO);
        q.enqueue("a", Duration::ZERO);
        // Both due; heap order is by (deadline, id).
        let first = q.pop_due().unwrap();
        let second = q.pop_due().unwrap();
        assert_eq!(
            {
                let mut v = vec![first, second];
                v.sort();
                v
            },
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn pop_waits_for_deadline() {
        let q = std::sync::Arc::new(DelayQueue::new());
        q.enqueue("a", Duration::from_millis(30));

        let started = std::time::Instant::now();
        let id = q.pop().await;
        assert_eq!(id, "a");
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn pop_wakes_on_new_nearer_entry() {
        let q = std::sync::Arc::new(DelayQueue::new());
        q.enqueue("far", Duration::from_secs(60));

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue("near", Duration::ZERO);

        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "near");
    }
}
