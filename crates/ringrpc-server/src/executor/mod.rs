//! Dispatch executors.
//!
//! Every method is bound to a [`DispatchExecutor`] when the server starts:
//! one dedicated thread, a pool of `min..=max` threads, or a pool shared by
//! every method of a named group. Each executor owns a [`BoundedQueue`]
//! decorated with the overflow policy of its configuration:
//!
//! - **DELAY**: a full queue rejects the task; the accept path hands it to
//!   the [`DelayWorker`] and the connection stops being read
//! - **WATER_MARK**: the queue never rejects; reaching the high mark pauses
//!   the producing connection and draining to the low mark resumes it
//!
//! Executor threads are plain OS threads so handlers may block freely
//! without stalling network I/O.

pub mod delay;
pub mod group;
pub mod policy;
pub mod queue;
pub mod task;


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringrpc_common::registry::{ExecutorConfig, ExecutorKind, OverflowMode};
use ringrpc_common::transport::map_io_error;
use ringrpc_common::Result;
use tracing::{debug, warn};

pub use delay::DelayWorker;
pub use group::ExecutorGroups;
pub use policy::{Admission, DelayPolicy, OverflowPolicy, WaterMarkPolicy};
pub use queue::{BoundedQueue, Offer, Take};
pub use task::DispatchTask;

/// Outcome of [`DispatchExecutor::submit`].
#[derive(Debug)]
pub enum Submit {
    Accepted,
    /// Queue full under DELAY; the task goes to the delay list
    Rejected(DispatchTask),
    /// The executor is shutting down
    Stopping(DispatchTask),
}

/// A queue plus the threads draining it.
///
/// Cloning is cheap; clones share the queue and threads.
#[derive(Clone)]
pub struct DispatchExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    name: String,
    queue: BoundedQueue,
    overflow: OverflowMode,
    min_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
    live: Mutex<usize>,
    exited: Condvar,
    busy: AtomicUsize,
    spawned: AtomicUsize,
}

impl DispatchExecutor {
    /// Creates the executor and starts its core threads.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a thread cannot be spawned.
    pub fn new(name: impl Into<String>, config: &ExecutorConfig) -> Result<Self> {
        let (min_threads, max_threads) = match config.kind {
            ExecutorKind::Single => (1, 1),
            ExecutorKind::Pool { min, max } => (min.max(1), max.max(min.max(1))),
        };

        let inner = Arc::new(ExecutorInner {
            name: name.into(),
            queue: BoundedQueue::new(
                config.capacity,
                policy::for_mode(config.overflow, config.capacity),
            ),
            overflow: config.overflow,
            min_threads,
            max_threads,
            keep_alive: config.keep_alive,
            live: Mutex::new(0),
            exited: Condvar::new(),
            busy: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        });

        for _ in 0..min_threads {
            *inner.live.lock() += 1;
            if let Err(e) = inner.spawn_worker(true) {
                *inner.live.lock() -= 1;
                inner.queue.close();
                return Err(e);
            }
        }
        debug!(
            "Started executor {} with {}..={} threads",
            inner.name, min_threads, max_threads
        );

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn overflow(&self) -> OverflowMode {
        self.inner.overflow
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Live worker threads.
    pub fn threads(&self) -> usize {
        *self.inner.live.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Queues a task. Never runs it on the calling thread.
    pub fn submit(&self, task: DispatchTask) -> Submit {
        match self.inner.queue.offer(task) {
            Offer::Accepted => {
                self.inner.maybe_grow();
                Submit::Accepted
            }
            Offer::Rejected(task) => Submit::Rejected(task),
            Offer::Closed(task) => Submit::Stopping(task),
        }
    }

    /// Stops taking new tasks. Queued tasks still run.
    pub fn close(&self) {
        self.inner.queue.close();
    }

    /// Closes the queue and waits until `deadline` for the threads to finish
    /// what is queued.
    ///
    /// # Returns
    ///
    /// Tasks still queued at the deadline; they will not run.
    pub fn shutdown(&self, deadline: Instant) -> Vec<DispatchTask> {
        self.close();
        {
            let mut live = self.inner.live.lock();
            while *live > 0 {
                if self.inner.exited.wait_until(&mut live, deadline).timed_out() {
                    break;
                }
            }
        }
        self.inner.queue.drain()
    }
}

impl ExecutorInner {
    fn spawn_worker(self: &Arc<Self>, core: bool) -> Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        std::thread::Builder::new()
            .name(format!("ringrpc-{}-{}", self.name, n))
            .spawn(move || inner.work(core))
            .map(|_| ())
            .map_err(|e| map_io_error(e, "spawning executor thread"))
    }

    fn work(&self, core: bool) {
        let idle = if core { None } else { Some(self.keep_alive) };
        loop {
            match self.queue.take(idle) {
                Take::Task(task) => {
                    self.busy.fetch_add(1, Ordering::AcqRel);
                    task.run();
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                }
                Take::TimedOut | Take::Closed => break,
            }
        }

        let mut live = self.live.lock();
        *live -= 1;
        self.exited.notify_all();
    }

    /// Adds a thread when every live thread is busy and work is waiting.
    fn maybe_grow(self: &Arc<Self>) {
        if self.max_threads <= self.min_threads {
            return;
        }
        let mut live = self.live.lock();
        if *live >= self.max_threads
            || self.busy.load(Ordering::Acquire) < *live
            || self.queue.is_empty()
        {
            return;
        }
        *live += 1;
        drop(live);

        if let Err(e) = self.spawn_worker(false) {
            warn!("Executor {} could not grow: {}", self.name, e);
            *self.live.lock() -= 1;
        }
    }
}
