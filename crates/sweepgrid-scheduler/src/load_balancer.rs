//! Round-robin node targeting.
//!
//! The k-th pick since the last reset lands on `nodes[k % nodes.len()]`.
//! The counter is atomic so a shared balancer can be read from status
//! reporting while the scheduler picks.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next target among `count` candidates, or `None` when
    /// there are none.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    /// Pick the next node from `nodes`.
    pub fn pick<'a, T>(&self, nodes: &'a [T]) -> Option<&'a T> {
        self.next(nodes.len()).map(|idx| &nodes[idx])
    }

    /// Start a new admission cycle.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    /// Picks made since the last reset.
    pub fn picks(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}
