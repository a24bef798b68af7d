//! Wait Queue
//!
//! Per-mode queue of backends waiting for their commit position to be
//! confirmed. The queue is kept sorted by LSN so that a release only has to
//! look at the satisfied prefix.

use std::collections::VecDeque;

use crate::lsn::Lsn;
use crate::syncrep::proc::BackendId;

/// A backend linked into a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedWaiter {
    /// Backend owning the wait entry
    pub backend: BackendId,
    /// Position the backend is waiting for
    pub lsn: Lsn,
}

/// Queue of waiters ordered by LSN, head first.
///
/// Mutation is only ever done by the holder of the `SyncRep` lock.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<QueuedWaiter>,
}

impl WaitQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Link a backend into the queue, keeping it sorted by LSN.
    ///
    /// Commit positions mostly arrive in rising order, so the scan starts
    /// at the tail. Waiters with equal positions keep their arrival order.
    pub fn insert(&mut self, backend: BackendId, lsn: Lsn) {
        let at = self
            .entries
            .iter()
            .rposition(|waiter| waiter.lsn <= lsn)
            .map_or(0, |i| i + 1);
        self.entries.insert(at, QueuedWaiter { backend, lsn });
    }

    /// Detach a backend if it is linked. Returns whether it was.
    pub fn remove(&mut self, backend: BackendId) -> bool {
        match self.entries.iter().position(|waiter| waiter.backend == backend) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether a backend is linked into this queue
    pub fn contains(&self, backend: BackendId) -> bool {
        self.entries.iter().any(|waiter| waiter.backend == backend)
    }

    /// Waiter at the head of the queue
    pub fn head(&self) -> Option<&QueuedWaiter> {
        self.entries.front()
    }

    /// Walk the queue from the head
    pub fn iter(&self) -> impl Iterator<Item = &QueuedWaiter> + '_ {
        self.entries.iter()
    }

    /// Detach waiters from the head while they are satisfied by `upto`,
    /// or unconditionally when `all` is set.
    ///
    /// The iterator is lazy: waiters not yet yielded when it is dropped stay
    /// linked, and a later call resumes from the new head.
    pub fn drain_satisfied(&mut self, upto: Lsn, all: bool) -> DrainSatisfied<'_> {
        DrainSatisfied {
            queue: self,
            upto,
            all,
        }
    }

    /// Number of linked waiters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no waiter is linked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the queue is non-decreasing in LSN from head to tail
    pub fn is_ordered(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| a.lsn <= b.lsn)
    }
}

/// Iterator returned by [`WaitQueue::drain_satisfied`]
pub struct DrainSatisfied<'a> {
    queue: &'a mut WaitQueue,
    upto: Lsn,
    all: bool,
}

impl Iterator for DrainSatisfied<'_> {
    type Item = QueuedWaiter;

    fn next(&mut self) -> Option<QueuedWaiter> {
        let head = self.queue.entries.front()?;
        // Sorted, so nothing behind an unsatisfied head can be satisfied
        if !self.all && head.lsn > self.upto {
            return None;
        }
        self.queue.entries.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsns(queue: &WaitQueue) -> Vec<u64> {
        queue.iter().map(|w| w.lsn.as_u64()).collect()
    }

    #[test]
    fn test_out_of_order_insert_is_sorted() {
        let mut queue = WaitQueue::new();
        queue.insert(BackendId(0), Lsn::new(100));
        queue.insert(BackendId(1), Lsn::new(50));
        queue.insert(BackendId(2), Lsn::new(80));

        assert_eq!(lsns(&queue), vec![50, 80, 100]);
        assert!(queue.is_ordered());
        assert_eq!(queue.head().unwrap().backend, BackendId(1));
    }

    #[test]
    fn test_equal_positions_keep_arrival_order() {
        let mut queue = WaitQueue::new();
        queue.insert(BackendId(0), Lsn::new(10));
        queue.insert(BackendId(1), Lsn::new(20));
        queue.insert(BackendId(2), Lsn::new(10));
        queue.insert(BackendId(3), Lsn::new(20));

        let order: Vec<usize> = queue.iter().map(|w| w.backend.0).collect();
        assert_eq!(order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut queue = WaitQueue::new();
        queue.insert(BackendId(7), Lsn::new(10));

        assert!(queue.contains(BackendId(7)));
        assert!(queue.remove(BackendId(7)));
        assert!(!queue.remove(BackendId(7)));
        assert!(!queue.contains(BackendId(7)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_at_first_unsatisfied() {
        let mut queue = WaitQueue::new();
        for (id, lsn) in [(0, 100), (1, 50), (2, 80)] {
            queue.insert(BackendId(id), Lsn::new(lsn));
        }

        let woken: Vec<u64> = queue
            .drain_satisfied(Lsn::new(80), false)
            .map(|w| w.lsn.as_u64())
            .collect();
        assert_eq!(woken, vec![50, 80]);
        assert_eq!(lsns(&queue), vec![100]);
    }

    #[test]
    fn test_drain_all_ignores_watermark() {
        let mut queue = WaitQueue::new();
        for (id, lsn) in [(0, 300), (1, 200), (2, 100)] {
            queue.insert(BackendId(id), Lsn::new(lsn));
        }

        assert_eq!(queue.drain_satisfied(Lsn::INVALID, true).count(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_drain_is_restartable() {
        let mut queue = WaitQueue::new();
        for (id, lsn) in [(0, 10), (1, 20), (2, 30)] {
            queue.insert(BackendId(id), Lsn::new(lsn));
        }

        let first = queue.drain_satisfied(Lsn::new(30), false).next().unwrap();
        assert_eq!(first.lsn, Lsn::new(10));
        assert_eq!(lsns(&queue), vec![20, 30]);

        assert_eq!(queue.drain_satisfied(Lsn::new(30), false).count(), 2);
    }
}
