//! Toggle operations - the cross-thread seam of the lifetime bridge
//!
//! Native code may drop or take references from any thread. Notifications
//! that cannot be applied immediately become `PendingToggleOp`s in a
//! `ToggleQueue`, drained on the home thread.
//!
//! Per object there is at most one pending op: an op in the opposite
//! direction cancels the pending one, and a second op in the same
//! direction is a protocol violation.

use crate::error::ProtocolViolation;
use crate::runtime::PendingCounters;
use girder_config::ViolationPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Direction of a refcount toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToggleDirection {
    /// Refcount rose from 1 to 2: root the proxy
    Up,
    /// Refcount fell from 2 to 1: unroot the proxy
    Down,
}

impl ToggleDirection {
    pub fn from_is_last_ref(is_last_ref: bool) -> Self {
        if is_last_ref {
            ToggleDirection::Down
        } else {
            ToggleDirection::Up
        }
    }
}

impl fmt::Display for ToggleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToggleDirection::Up => write!(f, "up"),
            ToggleDirection::Down => write!(f, "down"),
        }
    }
}

/// Toggle waiting to be applied on the home thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToggleOp {
    /// Native object address
    pub object: usize,
    pub direction: ToggleDirection,
}

/// Result of queueing an op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The opposite op was pending; both are gone
    Cancelled,
}

/// FIFO of pending toggle ops
#[derive(Debug, Default)]
pub struct ToggleQueue {
    ops: VecDeque<PendingToggleOp>,
}

impl ToggleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, op: PendingToggleOp) -> Result<EnqueueOutcome, ProtocolViolation> {
        if let Some(pos) = self.ops.iter().position(|p| p.object == op.object) {
            if self.ops[pos].direction == op.direction {
                return Err(ProtocolViolation::DuplicateToggle {
                    object: op.object,
                    direction: op.direction,
                });
            }
            self.ops.remove(pos);
            return Ok(EnqueueOutcome::Cancelled);
        }
        self.ops.push_back(op);
        Ok(EnqueueOutcome::Queued)
    }

    pub fn pop(&mut self) -> Option<PendingToggleOp> {
        self.ops.pop_front()
    }

    pub fn has_pending(&self, object: usize) -> bool {
        self.ops.iter().any(|p| p.object == object)
    }

    /// Drop every op for `object`, returning how many were removed
    pub fn cancel(&mut self, object: usize) -> usize {
        let before = self.ops.len();
        self.ops.retain(|p| p.object != object);
        before - self.ops.len()
    }

    /// Remove and return every pending op
    pub fn drain(&mut self) -> Vec<PendingToggleOp> {
        self.ops.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Thread-safe part of the lifetime bridge
pub struct ToggleShared {
    home: ThreadId,
    queue: Mutex<ToggleQueue>,
    counters: Arc<PendingCounters>,
    shut_down: AtomicBool,
    policy: ViolationPolicy,
}

impl ToggleShared {
    /// Shared state owned by the current thread
    pub fn new(policy: ViolationPolicy, counters: Arc<PendingCounters>) -> Self {
        Self {
            home: thread::current().id(),
            queue: Mutex::new(ToggleQueue::new()),
            counters,
            shut_down: AtomicBool::new(false),
            policy,
        }
    }

    pub fn is_home_thread(&self) -> bool {
        thread::current().id() == self.home
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn has_pending(&self, object: usize) -> bool {
        self.queue.lock().has_pending(object)
    }

    /// Queue an op for the home thread; callable from any thread
    pub fn enqueue(&self, op: PendingToggleOp) -> Result<EnqueueOutcome, ProtocolViolation> {
        let outcome = self.queue.lock().enqueue(op);
        match outcome {
            Ok(EnqueueOutcome::Queued) => {
                self.counters.toggle_queued();
                tracing::trace!(object = op.object, direction = %op.direction, "toggle queued");
                Ok(EnqueueOutcome::Queued)
            }
            Ok(EnqueueOutcome::Cancelled) => {
                self.counters.toggle_done(1);
                tracing::trace!(object = op.object, direction = %op.direction, "toggle cancelled pending op");
                Ok(EnqueueOutcome::Cancelled)
            }
            Err(violation) => Err(violation.enforce(self.policy)),
        }
    }

    /// Next op to apply; the lock is released before returning
    pub fn pop(&self) -> Option<PendingToggleOp> {
        let op = self.queue.lock().pop();
        if op.is_some() {
            self.counters.toggle_done(1);
        }
        op
    }

    pub fn cancel(&self, object: usize) -> usize {
        let removed = self.queue.lock().cancel(object);
        if removed > 0 {
            self.counters.toggle_done(removed);
        }
        removed
    }

    /// Stop accepting ops and drop everything queued
    pub fn shut_down(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let dropped = self.queue.lock().drain().len();
        if dropped > 0 {
            self.counters.toggle_done(dropped);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(object: usize, direction: ToggleDirection) -> PendingToggleOp {
        PendingToggleOp { object, direction }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = ToggleQueue::new();
        queue.enqueue(op(1, ToggleDirection::Up)).unwrap();
        queue.enqueue(op(2, ToggleDirection::Down)).unwrap();
        assert_eq!(queue.pop(), Some(op(1, ToggleDirection::Up)));
        assert_eq!(queue.pop(), Some(op(2, ToggleDirection::Down)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_opposite_direction_cancels() {
        let mut queue = ToggleQueue::new();
        queue.enqueue(op(1, ToggleDirection::Up)).unwrap();
        assert_eq!(
            queue.enqueue(op(1, ToggleDirection::Down)).unwrap(),
            EnqueueOutcome::Cancelled
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_direction_is_violation() {
        let mut queue = ToggleQueue::new();
        queue.enqueue(op(1, ToggleDirection::Up)).unwrap();
        assert_eq!(
            queue.enqueue(op(1, ToggleDirection::Up)),
            Err(ProtocolViolation::DuplicateToggle {
                object: 1,
                direction: ToggleDirection::Up
            })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_object() {
        let mut queue = ToggleQueue::new();
        queue.enqueue(op(1, ToggleDirection::Up)).unwrap();
        queue.enqueue(op(2, ToggleDirection::Up)).unwrap();
        assert_eq!(queue.cancel(1), 1);
        assert!(!queue.has_pending(1));
        assert!(queue.has_pending(2));
    }

    #[test]
    fn test_shared_counters_track_queue() {
        let counters = Arc::new(PendingCounters::default());
        let shared = ToggleShared::new(ViolationPolicy::Report, Arc::clone(&counters));

        shared.enqueue(op(1, ToggleDirection::Up)).unwrap();
        shared.enqueue(op(2, ToggleDirection::Up)).unwrap();
        assert_eq!(counters.snapshot().toggles, 2);

        shared.enqueue(op(2, ToggleDirection::Down)).unwrap();
        assert_eq!(counters.snapshot().toggles, 1);

        assert!(shared.pop().is_some());
        assert_eq!(counters.snapshot().toggles, 0);
    }

    #[test]
    fn test_enqueue_from_worker_thread() {
        let counters = Arc::new(PendingCounters::default());
        let shared = Arc::new(ToggleShared::new(ViolationPolicy::Report, Arc::clone(&counters)));

        let worker = Arc::clone(&shared);
        std::thread::spawn(move || {
            assert!(!worker.is_home_thread());
            worker.enqueue(op(7, ToggleDirection::Up)).unwrap();
        })
        .join()
        .unwrap();

        assert!(shared.is_home_thread());
        assert!(shared.has_pending(7));
        assert_eq!(shared.shut_down(), 1);
        assert_eq!(counters.snapshot().toggles, 0);
    }
}
