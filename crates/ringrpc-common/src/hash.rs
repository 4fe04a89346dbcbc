//! Hashing used for service ids and ring positions.

use sha2::{Digest, Sha256};

use crate::protocol::frame::ServiceId;

/// Seed mixed into every ring hash
pub const RING_SEED: u64 = 9527;

fn digest(seed: Option<u64>, data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some(seed) = seed {
        hasher.update(seed.to_be_bytes());
    }
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Seeded 64-bit hash.
pub fn hash64(seed: u64, data: &[u8]) -> u64 {
    let d = digest(Some(seed), data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&d[..8]);
    u64::from_be_bytes(out)
}

/// Unseeded 32-bit hash.
pub fn hash32(data: &[u8]) -> u32 {
    let d = digest(None, data);
    u32::from_be_bytes([d[0], d[1], d[2], d[3]])
}

/// Derives the numeric id of a service from its name.
///
/// The id must be non-negative when read as an `i32`, so a negative hash is
/// re-hashed with the previous value appended to the name until it is not.
pub fn service_id(name: &str) -> ServiceId {
    let mut id = hash32(name.as_bytes()) as i32;
    while id < 0 {
        id = hash32(format!("{}{}", name, id).as_bytes()) as i32;
    }
    id as ServiceId
}

/// Ring position of virtual slot `slot` of a connection.
pub fn slot_position(connection_id: &str, slot: usize) -> u64 {
    hash64(RING_SEED, format!("{}_#_{}", connection_id, slot).as_bytes())
}

/// Ring position a request id maps to.
pub fn request_position(request_id: u64) -> u64 {
    hash64(RING_SEED, &request_id.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_is_deterministic_and_non_negative() {
        for name in ["hello", "echo", "com.example.Greeter", "", "x"] {
            let id = service_id(name);
            assert_eq!(id, service_id(name));
            assert!((id as i32) >= 0, "{} produced a negative id", name);
        }
        assert_ne!(service_id("hello"), service_id("world"));
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_ne!(hash64(1, b"data"), hash64(2, b"data"));
        assert_eq!(hash64(RING_SEED, b"data"), hash64(RING_SEED, b"data"));
    }

    #[test]
    fn test_slot_positions_differ() {
        let positions: std::collections::HashSet<u64> =
            (0..10).map(|slot| slot_position("127.0.0.1:9000#1", slot)).collect();
        assert_eq!(positions.len(), 10);
    }
}
