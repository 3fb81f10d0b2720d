//! Content-defined node boundaries.
//!
//! Each appended entry is fingerprinted; an entry ends its node when the
//! fingerprint falls under a threshold proportional to the entry's weight,
//! tuned so nodes average ~4 KiB. The decision depends only on the entry
//! itself (plus its level), which makes tree shape independent of edit
//! history: the same key set always chunks at the same entries.

/// Mean node size the boundary threshold is tuned to.
pub const TARGET_NODE_SIZE: usize = 4096;
/// Hard cap; a node is cut at this size regardless of fingerprints.
pub const MAX_NODE_SIZE: usize = 4 * TARGET_NODE_SIZE;

const MIN_ENTRY_WEIGHT: usize = 32;
const MAX_ENTRY_WEIGHT: usize = 2048;

/// Whether the entry `(key, payload)` ends its node at `level`.
pub fn is_boundary(level: u8, key: &[u8], payload: &[u8]) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[level]);
    hasher.update(key);
    hasher.update(payload);
    let digest = hasher.finalize();
    let fingerprint = u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap());

    let weight = (key.len() + payload.len()).clamp(MIN_ENTRY_WEIGHT, MAX_ENTRY_WEIGHT) as u64;
    let threshold = (u32::MAX as u64 / TARGET_NODE_SIZE as u64) * weight;
    (fingerprint as u64) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_deterministic() {
        let a = is_boundary(0, b"key-17", b"value-17");
        let b = is_boundary(0, b"key-17", b"value-17");
        assert_eq!(a, b);
    }

    #[test]
    fn levels_cut_independently() {
        // The same entry should not force boundaries at every level; over
        // many entries the per-level decisions must disagree somewhere.
        let mut diverged = false;
        for i in 0..512u32 {
            let key = format!("key-{i}");
            if is_boundary(0, key.as_bytes(), b"v") != is_boundary(1, key.as_bytes(), b"v") {
                diverged = true;
                break;
            }
        }
        assert!(diverged);
    }

    #[test]
    fn boundary_rate_is_plausible() {
        // With ~32-byte entries, roughly 1 in 64 entries ends a node.
        let hits = (0..4096u32)
            .filter(|i| {
                let key = format!("row-key-{i:08}");
                is_boundary(0, key.as_bytes(), b"0123456789abcdef")
            })
            .count();
        assert!(hits > 16, "too few boundaries: {hits}");
        assert!(hits < 256, "too many boundaries: {hits}");
    }
}
