//! Request id generation.
//!
//! Ids are laid out as
//!
//! ```text
//! | elapsed ms since EPOCH_MS (42 bits) | worker id (12 bits) | sequence (10 bits) |
//! ```
//!
//! so two generators with distinct worker ids never collide, and one
//! generator never repeats an id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::protocol::frame::RequestId;

/// Fixed epoch of the elapsed-time component (2020-08-10T01:20:38.074Z)
pub const EPOCH_MS: u64 = 1_597_024_838_074;

const SEQUENCE_BITS: u32 = 10;
const WORKER_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest assignable worker id
pub const MAX_WORKER_ID: u64 = (1 << WORKER_BITS) - 1;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// Hands out worker ids from a process-wide counter, wrapping within
/// `1..=MAX_WORKER_ID`.
pub fn next_worker_id() -> u64 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed) % MAX_WORKER_ID + 1
}

struct IdState {
    last_ms: u64,
    sequence: u64,
}

/// Time-ordered 64-bit request id generator.
///
/// Elapsed time is read from a monotonic clock anchored at construction, so
/// wall-clock adjustments cannot make ids go backwards.
///
/// # Example
///
/// ```
/// use ringrpc_common::ids::RequestIdGenerator;
///
/// let ids = RequestIdGenerator::new(5);
/// let a = ids.next_id();
/// let b = ids.next_id();
/// assert!(b > a);
/// assert_eq!(RequestIdGenerator::worker_of(a), 5);
/// ```
pub struct RequestIdGenerator {
    worker_id: u64,
    anchor_ms: u64,
    anchor: Instant,
    state: Mutex<IdState>,
}

impl RequestIdGenerator {
    /// Creates a generator for `worker_id`, truncated to 12 bits.
    pub fn new(worker_id: u64) -> Self {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(EPOCH_MS);

        Self {
            worker_id: worker_id & MAX_WORKER_ID,
            anchor_ms: wall_ms.saturating_sub(EPOCH_MS),
            anchor: Instant::now(),
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Creates a generator with the next process-wide worker id.
    pub fn with_next_worker() -> Self {
        Self::new(next_worker_id())
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    fn elapsed_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }

    /// Returns the next id. Spins into the next millisecond when the current
    /// one has used up its 1024 sequence numbers.
    pub fn next_id(&self) -> RequestId {
        let mut state = self.state.lock();
        let mut now = self.elapsed_ms();

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = self.elapsed_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        (now << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | state.sequence
    }

    /// Extracts the worker id from a generated id.
    pub fn worker_of(id: RequestId) -> u64 {
        (id >> SEQUENCE_BITS) & MAX_WORKER_ID
    }

    /// Extracts the sequence number from a generated id.
    pub fn sequence_of(id: RequestId) -> u64 {
        id & SEQUENCE_MASK
    }
}
