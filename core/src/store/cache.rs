//! Shared chunk cache, bounded by a byte budget.
//!
//! Reads are concurrent over the sharded map; insertion evicts arbitrary
//! entries from the victim shard until the budget holds.

use crate::chunk::Chunk;
use crate::hash::Hash;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

pub struct ChunkCache {
    map: DashMap<Hash, Chunk>,
    bytes: AtomicUsize,
    budget: usize,
}

impl ChunkCache {
    pub fn new(budget: usize) -> ChunkCache {
        ChunkCache {
            map: DashMap::new(),
            bytes: AtomicUsize::new(0),
            budget,
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<Chunk> {
        self.map.get(hash).map(|entry| entry.clone())
    }

    pub fn insert(&self, chunk: Chunk) {
        let len = chunk.len();
        if len > self.budget {
            return;
        }
        if self.map.insert(chunk.hash(), chunk).is_none() {
            self.bytes.fetch_add(len, Ordering::Relaxed);
        }
        while self.bytes.load(Ordering::Relaxed) > self.budget {
            let victim = match self.map.iter().next() {
                Some(entry) => *entry.key(),
                None => break,
            };
            if let Some((_, evicted)) = self.map.remove(&victim) {
                self.bytes.fetch_sub(evicted.len(), Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;

    #[test]
    fn caches_and_evicts() {
        let cache = ChunkCache::new(256);
        let small = Chunk::new(ChunkType::Blob, vec![0u8; 16]);
        cache.insert(small.clone());
        assert_eq!(cache.get(&small.hash()), Some(small.clone()));

        // Filling past the budget evicts something but never grows unbounded.
        for i in 0..64u8 {
            cache.insert(Chunk::new(ChunkType::Blob, vec![i; 32]));
        }
        assert!(cache.len() * 16 <= 64 * 33);

        // Oversized chunks are not cached at all.
        let big = Chunk::new(ChunkType::Blob, vec![1u8; 1024]);
        cache.insert(big.clone());
        assert_eq!(cache.get(&big.hash()), None);
    }
}
