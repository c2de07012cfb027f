use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::limiter::AdmissionPermit;

/// A caller waiting for admission.
///
/// Retired the moment its permit is handed over (or its caller is found to
/// have gone away); never re-queued.
pub(super) struct QueuedRequest {
    /// Monotonic sequence number, assigned at enqueue. Doubles as the FIFO
    /// tie-breaker within a priority tier.
    pub(super) id: u64,
    pub(super) priority: i32,
    pub(super) estimated_cost: u64,
    /// Fairness diagnostics only; not a deadline.
    pub(super) enqueued_at: Instant,
    pub(super) admit: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap order: higher priority first, earlier arrival first within a
    // tier.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Pending requests, ordered by priority descending then arrival ascending.
pub(super) struct PendingQueue {
    heap: BinaryHeap<QueuedRequest>,
    next_id: u64,
}

impl PendingQueue {
    pub(super) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Enqueue a waiter, returning its assigned id.
    pub(super) fn push(
        &mut self,
        priority: i32,
        estimated_cost: u64,
        enqueued_at: Instant,
        admit: oneshot::Sender<AdmissionPermit>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(QueuedRequest {
            id,
            priority,
            estimated_cost,
            enqueued_at,
            admit,
        });
        id
    }

    /// The next request admission would pick.
    pub(super) fn peek(&self) -> Option<&QueuedRequest> {
        self.heap.peek()
    }

    pub(super) fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &mut PendingQueue, priority: i32) -> u64 {
        let (tx, _rx) = oneshot::channel();
        queue.push(priority, 1, Instant::now(), tx)
    }

    #[test]
    fn pops_highest_priority_first() {
        let mut queue = PendingQueue::new();
        let a = push(&mut queue, 1);
        let b = push(&mut queue, 5);
        let c = push(&mut queue, 1);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|r| r.id)).collect();
        assert_eq!(order, vec![b, a, c]);
    }

    #[test]
    fn equal_priorities_stay_fifo() {
        let mut queue = PendingQueue::new();
        let ids: Vec<u64> = (0..8).map(|_| push(&mut queue, 3)).collect();

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|r| r.id)).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn peek_matches_pop() {
        let mut queue = PendingQueue::new();
        push(&mut queue, 2);
        let top = push(&mut queue, 9);

        assert_eq!(queue.peek().map(|r| r.id), Some(top));
        assert_eq!(queue.pop().map(|r| r.id), Some(top));
        assert_eq!(queue.len(), 1);
    }
}
