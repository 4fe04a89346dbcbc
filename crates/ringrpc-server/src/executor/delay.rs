//! The delay list behind the DELAY overflow mode.
//!
//! A task rejected by a full queue is parked here with a wake time, and the
//! connection it came from stops being read. On wake the task is offered to
//! its executor again. After `max_attempts` failed resubmits the caller gets
//! `ServiceBusy` instead.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use ringrpc_common::transport::map_io_error;
use ringrpc_common::{ErrorKind, Fault, Result};
use tracing::{debug, info, warn};

use crate::config::DelayConfig;
use crate::executor::task::DispatchTask;
use crate::executor::{DispatchExecutor, Submit};

struct Delayed {
    wake_at: Instant,
    /// Insertion order; breaks ties between equal wake times
    seq: u64,
    task: DispatchTask,
    executor: DispatchExecutor,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // reversed: BinaryHeap is a max-heap and the earliest wake must come first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayState {
    heap: BinaryHeap<Delayed>,
    next_seq: u64,
    closed: bool,
}

struct DelayInner {
    state: Mutex<DelayState>,
    wake: Condvar,
    config: DelayConfig,
    resubmits: AtomicU64,
}

/// Dedicated thread owning the process-wide delay list.
pub struct DelayWorker {
    inner: Arc<DelayInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayWorker {
    /// Starts the delay thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start(config: DelayConfig) -> Result<Self> {
        let inner = Arc::new(DelayInner {
            state: Mutex::new(DelayState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            wake: Condvar::new(),
            config,
            resubmits: AtomicU64::new(0),
        });

        let thread = std::thread::Builder::new()
            .name("ringrpc-delay".to_string())
            .spawn({
                let inner = inner.clone();
                move || inner.run()
            })
            .map_err(|e| map_io_error(e, "spawning delay worker"))?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn config(&self) -> DelayConfig {
        self.inner.config
    }

    /// Parks a rejected task and pauses reads from its connection.
    ///
    /// A task that already used up its attempts is answered with
    /// `ServiceBusy` and its connection resumes reading.
    pub fn add(&self, task: DispatchTask, executor: DispatchExecutor) {
        self.inner.add(task, executor);
    }

    /// Tasks currently parked.
    pub fn len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parked tasks offered back to their executor so far.
    pub fn resubmits(&self) -> u64 {
        self.inner.resubmits.load(AtomicOrdering::Relaxed)
    }

    /// Stops the thread and answers every parked task with `RpcServerStopping`.
    pub fn close(&self) {
        let parked: Vec<Delayed> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.heap.drain().collect()
        };
        self.inner.wake.notify_all();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Delay worker thread panicked");
            }
        }

        let stopping = Fault::new(ErrorKind::RpcServerStopping, "server shutting down");
        let count = parked.len();
        for delayed in parked {
            delayed.task.connection().gate().open();
            delayed.task.fail(&stopping);
        }
        info!("Delay worker stopped; {} parked tasks answered", count);
    }
}

impl Drop for DelayWorker {
    fn drop(&mut self) {
        self.close();
    }
}

impl DelayInner {
    fn add(&self, mut task: DispatchTask, executor: DispatchExecutor) {
        let conn = task.connection().clone();
        if task.attempts() >= self.config.max_attempts {
            warn!(
                "{} rejected after {} delayed attempts, answering ServiceBusy",
                task.header().request_ref(),
                task.attempts()
            );
            task.fail(&Fault::new(
                ErrorKind::ServiceBusy,
                format!("executor queue full after {} attempts", self.config.max_attempts),
            ));
            conn.gate().open();
            return;
        }

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            task.fail(&Fault::new(ErrorKind::RpcServerStopping, "server shutting down"));
            return;
        }

        task.record_attempt();
        conn.gate().close();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(
            "Delaying {} (attempt {}) by {:?}",
            task.header().request_ref(),
            task.attempts(),
            self.config.delay
        );
        state.heap.push(Delayed {
            wake_at: Instant::now() + self.config.delay,
            seq,
            task,
            executor,
        });
        drop(state);
        self.wake.notify_one();
    }

    fn run(&self) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    if state.closed {
                        return;
                    }
                    match state.heap.peek().map(|d| d.wake_at) {
                        Some(wake_at) if wake_at <= Instant::now() => break state.heap.pop(),
                        Some(wake_at) => {
                            self.wake.wait_until(&mut state, wake_at);
                        }
                        None => self.wake.wait(&mut state),
                    }
                }
            };

            if let Some(Delayed { task, executor, .. }) = due {
                self.resubmit(task, executor);
            }
        }
    }

    fn resubmit(&self, task: DispatchTask, executor: DispatchExecutor) {
        let conn = task.connection().clone();
        self.resubmits.fetch_add(1, AtomicOrdering::Relaxed);
        match executor.submit(task) {
            Submit::Accepted => {
                conn.gate().open();
            }
            Submit::Rejected(task) => self.add(task, executor),
            Submit::Stopping(task) => {
                task.fail(&Fault::new(ErrorKind::RpcServerStopping, "server shutting down"));
                conn.gate().open();
            }
        }
    }
}
