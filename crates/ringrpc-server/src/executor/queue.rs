use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::policy::{Admission, OverflowPolicy};
use crate::executor::task::DispatchTask;

/// Result of offering a task to a queue.
#[derive(Debug)]
pub enum Offer {
    Accepted,
    /// The policy refused the task; ownership goes back to the caller
    Rejected(DispatchTask),
    /// The queue no longer takes work
    Closed(DispatchTask),
}

#[derive(Debug)]
pub enum Take {
    Task(DispatchTask),
    TimedOut,
    /// Closed and empty
    Closed,
}

struct QueueState {
    tasks: VecDeque<DispatchTask>,
    closed: bool,
}

/// Blocking task queue decorated with an [`OverflowPolicy`].
pub struct BoundedQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
    policy: Box<dyn OverflowPolicy>,
}

impl BoundedQueue {
    pub fn new(capacity: usize, policy: Box<dyn OverflowPolicy>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn offer(&self, task: DispatchTask) -> Offer {
        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed(task);
        }
        if self.policy.on_enqueue(state.tasks.len(), &task) == Admission::Reject {
            return Offer::Rejected(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.available.notify_one();
        Offer::Accepted
    }

    /// Takes the next task, waiting up to `timeout` (forever with `None`).
    ///
    /// A closed queue keeps handing out what it holds, then reports `Closed`.
    pub fn take(&self, timeout: Option<Duration>) -> Take {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                self.policy.on_dequeue(state.tasks.len());
                return Take::Task(task);
            }
            if state.closed {
                return Take::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && state.tasks.is_empty()
                    {
                        return if state.closed { Take::Closed } else { Take::TimedOut };
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Stops accepting tasks and wakes every waiting taker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<DispatchTask> {
        let mut state = self.state.lock();
        let tasks: Vec<_> = state.tasks.drain(..).collect();
        self.policy.on_dequeue(0);
        tasks
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Nominal capacity. A soft queue may hold more.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_soft(&self) -> bool {
        self.policy.is_soft()
    }
}
