//! Consistent-hash ring of virtual connection slots.
//!
//! Every physical connection occupies [`VIRTUAL_NODES`] positions. Readers
//! load an immutable snapshot; writers rebuild a copy under a lock and swap
//! it in, so a lookup never sees a half-updated ring.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use ringrpc_common::hash;
use ringrpc_common::RequestId;

/// Virtual positions per physical connection
pub const VIRTUAL_NODES: usize = 10;

pub type RingSnapshot<T> = Arc<BTreeMap<u64, Arc<T>>>;

/// Consistent-hash ring mapping request ids to values (connections).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ringrpc_client::ring::HashRing;
///
/// let ring = HashRing::new();
/// ring.insert("a", Arc::new("conn-a"));
/// ring.insert("b", Arc::new("conn-b"));
///
/// let first = ring.pick(42).unwrap();
/// assert_eq!(ring.pick(42).unwrap(), first);
/// assert_eq!(ring.len(), 20);
/// ```
pub struct HashRing<T> {
    snapshot: ArcSwap<BTreeMap<u64, Arc<T>>>,
    write: Mutex<()>,
}

impl<T> HashRing<T> {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(BTreeMap::new()),
            write: Mutex::new(()),
        }
    }

    /// Positions a connection with this id occupies.
    pub fn positions_for(connection_id: &str) -> Vec<u64> {
        (0..VIRTUAL_NODES)
            .map(|slot| hash::slot_position(connection_id, slot))
            .collect()
    }

    /// Places `value` at the virtual positions of `connection_id`.
    ///
    /// # Returns
    ///
    /// The positions written, to be kept with the connection so a reconnect can
    /// take them over.
    pub fn insert(&self, connection_id: &str, value: Arc<T>) -> Vec<u64> {
        let positions = Self::positions_for(connection_id);
        self.replace(&positions, value);
        positions
    }

    /// Points every position in `positions` at `value`.
    pub fn replace(&self, positions: &[u64], value: Arc<T>) {
        self.mutate(|ring| {
            for position in positions {
                ring.insert(*position, value.clone());
            }
        });
    }

    /// Removes `positions`, but only where they still point at `owner`.
    pub fn remove(&self, positions: &[u64], owner: &Arc<T>) {
        self.mutate(|ring| {
            for position in positions {
                if ring.get(position).is_some_and(|v| Arc::ptr_eq(v, owner)) {
                    ring.remove(position);
                }
            }
        });
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut BTreeMap<u64, Arc<T>>),
    {
        let _guard = self.write.lock();
        let mut next = BTreeMap::clone(&self.snapshot.load());
        f(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    /// Returns the value at the first position at or after the request's
    /// hash, wrapping around to the lowest position.
    pub fn pick(&self, request_id: RequestId) -> Option<Arc<T>> {
        Self::pick_in(&self.snapshot.load(), hash::request_position(request_id))
    }

    /// Circular lookup of `position` in a snapshot.
    pub fn pick_in(ring: &BTreeMap<u64, Arc<T>>, position: u64) -> Option<Arc<T>> {
        ring.range(position..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, value)| value.clone())
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> RingSnapshot<T> {
        self.snapshot.load_full()
    }

    /// Distinct values on the ring.
    pub fn values(&self) -> Vec<Arc<T>> {
        let snapshot = self.snapshot.load();
        let mut values: Vec<Arc<T>> = Vec::new();
        for value in snapshot.values() {
            if !values.iter().any(|v| Arc::ptr_eq(v, value)) {
                values.push(value.clone());
            }
        }
        values
    }

    /// Number of virtual positions.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl<T> Default for HashRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ring_with(ids: &[&'static str]) -> HashRing<&'static str> {
        let ring = HashRing::new();
        for id in ids {
            ring.insert(id, Arc::new(*id));
        }
        ring
    }

    #[test]
    fn test_empty_ring_picks_nothing() {
        let ring: HashRing<&str> = HashRing::new();
        assert!(ring.pick(1).is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_insert_adds_virtual_positions() {
        let ring = ring_with(&["a", "b", "c"]);
        assert_eq!(ring.len(), 3 * VIRTUAL_NODES);
        assert_eq!(ring.values().len(), 3);
    }

    #[test]
    fn test_pick_is_deterministic() {
        let ring = ring_with(&["a", "b", "c"]);
        for request_id in 0..1000u64 {
            let first = ring.pick(request_id).unwrap();
            for _ in 0..3 {
                assert_eq!(ring.pick(request_id).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_wraparound_uses_lowest_position() {
        let ring = ring_with(&["a", "b"]);
        let snapshot = ring.snapshot();
        let (max_key, _) = snapshot.iter().next_back().unwrap();
        let (_, lowest) = snapshot.iter().next().unwrap();

        if *max_key < u64::MAX {
            let picked = HashRing::pick_in(&snapshot, max_key + 1).unwrap();
            assert_eq!(picked, *lowest);
        }
        let picked = HashRing::pick_in(&snapshot, u64::MAX).unwrap();
        let expected = snapshot.get(&u64::MAX).unwrap_or(lowest);
        assert_eq!(picked, *expected);
    }

    #[test]
    fn test_exact_position_hit() {
        let ring = ring_with(&["a", "b"]);
        let positions = HashRing::<&str>::positions_for("b");
        let snapshot = ring.snapshot();
        assert_eq!(*HashRing::pick_in(&snapshot, positions[0]).unwrap(), "b");
    }

    #[test]
    fn test_replace_keeps_positions() {
        let ring = HashRing::new();
        let old = Arc::new("old");
        let positions = ring.insert("slot-1", old.clone());

        let new = Arc::new("new");
        ring.replace(&positions, new.clone());

        assert_eq!(ring.len(), VIRTUAL_NODES);
        for position in &positions {
            assert!(Arc::ptr_eq(ring.snapshot().get(position).unwrap(), &new));
        }
    }

    #[test]
    fn test_remove_only_owned_positions() {
        let ring = HashRing::new();
        let a = Arc::new("a");
        let positions = ring.insert("a", a.clone());
        let b = Arc::new("b");
        ring.insert("b", b.clone());

        // a stale owner removes nothing
        ring.remove(&positions, &Arc::new("a"));
        assert_eq!(ring.len(), 2 * VIRTUAL_NODES);

        ring.remove(&positions, &a);
        assert_eq!(ring.len(), VIRTUAL_NODES);
        assert_eq!(*ring.pick(7).unwrap(), "b");
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_writes() {
        let ring = ring_with(&["a"]);
        let before = ring.snapshot();
        ring.insert("b", Arc::new("b"));
        assert_eq!(before.len(), VIRTUAL_NODES);
        assert_eq!(ring.len(), 2 * VIRTUAL_NODES);
    }

    #[test]
    fn test_more_positions_take_more_load() {
        // a connection-weighted address: "heavy" has three connections
        let ring = HashRing::new();
        for i in 0..3 {
            ring.insert(&format!("heavy#{}", i), Arc::new("heavy"));
        }
        ring.insert("light#0", Arc::new("light"));

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for request_id in 0..20_000u64 {
            *counts.entry(*ring.pick(request_id).unwrap()).or_default() += 1;
        }
        assert!(counts["heavy"] > counts["light"]);
    }
}
