//! Overflow policies for executor queues.
//!
//! A policy decorates a [`BoundedQueue`](super::queue::BoundedQueue): the
//! queue calls [`OverflowPolicy::on_enqueue`] before every push and
//! [`OverflowPolicy::on_dequeue`] after every pop, with its lock held.

use std::sync::Arc;

use parking_lot::Mutex;
use ringrpc_common::registry::OverflowMode;
use tracing::debug;

use crate::connection::ServerConnection;
use crate::executor::task::DispatchTask;

/// Low water mark, percent of capacity
pub const LOW_WATER_PERCENT: usize = 55;

/// High water mark, percent of capacity
pub const HIGH_WATER_PERCENT: usize = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

pub trait OverflowPolicy: Send + Sync {
    /// Decides whether `task` may join a queue currently holding `queued` tasks.
    fn on_enqueue(&self, queued: usize, task: &DispatchTask) -> Admission;

    /// Observes the queue length after a task was taken.
    fn on_dequeue(&self, queued: usize);

    /// Whether the queue may grow past its capacity.
    fn is_soft(&self) -> bool {
        false
    }
}

/// Builds the policy for `mode`.
pub fn for_mode(mode: OverflowMode, capacity: usize) -> Box<dyn OverflowPolicy> {
    match mode {
        OverflowMode::Delay => Box::new(DelayPolicy::new(capacity)),
        OverflowMode::WaterMark => Box::new(WaterMarkPolicy::new(capacity)),
    }
}

/// Rejects tasks once the queue is full. The caller parks them on the delay list.
#[derive(Debug)]
pub struct DelayPolicy {
    capacity: usize,
}

impl DelayPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl OverflowPolicy for DelayPolicy {
    fn on_enqueue(&self, queued: usize, _task: &DispatchTask) -> Admission {
        if queued >= self.capacity {
            Admission::Reject
        } else {
            Admission::Accept
        }
    }

    fn on_dequeue(&self, _queued: usize) {}
}

/// Never rejects. Reaching the high mark closes the producing connection's
/// read gate; draining to the low mark re-opens every gate it closed.
pub struct WaterMarkPolicy {
    low: usize,
    high: usize,
    denied: Mutex<Vec<Arc<ServerConnection>>>,
}

impl WaterMarkPolicy {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            low: capacity * LOW_WATER_PERCENT / 100,
            high: (capacity * HIGH_WATER_PERCENT / 100).max(1),
            denied: Mutex::new(Vec::new()),
        }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Connections currently denied read interest.
    pub fn denied(&self) -> usize {
        self.denied.lock().len()
    }
}

impl OverflowPolicy for WaterMarkPolicy {
    fn on_enqueue(&self, queued: usize, task: &DispatchTask) -> Admission {
        if queued + 1 >= self.high {
            let conn = task.connection();
            // the gate may have been reopened elsewhere while still denied here
            conn.gate().close();
            let mut denied = self.denied.lock();
            if !denied.iter().any(|c| c.id() == conn.id()) {
                debug!(
                    "Queue at {} of high mark {}, pausing reads from {}",
                    queued + 1,
                    self.high,
                    conn.peer()
                );
                denied.push(conn.clone());
            }
        }
        Admission::Accept
    }

    fn on_dequeue(&self, queued: usize) {
        if queued > self.low {
            return;
        }
        let mut denied = self.denied.lock();
        if denied.is_empty() {
            return;
        }
        debug!(
            "Queue drained to {}, resuming reads from {} connections",
            queued,
            denied.len()
        );
        for conn in denied.drain(..) {
            conn.gate().open();
        }
    }

    fn is_soft(&self) -> bool {
        true
    }
}
