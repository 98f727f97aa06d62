use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::read::block::InteractionBlock;

const NIL: usize = usize::MAX;

/// Cache key: a block id is only unique within one chromosome pair's grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockKey {
    pub chrom1: u32,
    pub chrom2: u32,
    pub block_id: u64,
}

#[derive(Debug)]
struct Node {
    key: BlockKey,
    block: Arc<InteractionBlock>,
    cost: usize,
    prev: usize,
    next: usize,
}

/// Cumulative cache counters exposed on the file handle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub blocks: usize,
    pub size_in_bytes: usize,
}
impl CacheStats {
    /// Fraction of lookups served from the cache; zero before any lookup
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A byte-budgeted, strictly least-recently-used cache of decoded blocks.
///
/// Entries are `Arc`-shared with in-flight queries, so eviction never
/// invalidates a block a selector is still iterating. Lookup and insertion
/// are O(1): a hash map points into a slab of intrusive list nodes ordered
/// by recency (head = most recent). Size accounting uses each block's stable
/// per-record cost, not its exact heap footprint.
#[derive(Debug)]
pub struct BlockCache {
    capacity: usize,
    size: usize,
    map: HashMap<BlockKey, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    hits: u64,
    misses: u64,
}

impl BlockCache {
    /// Creates a cache with a byte budget; zero capacity is rejected
    pub fn new(capacity_bytes: usize) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(CacheError::ZeroCapacity.into());
        }
        Ok(Self {
            capacity: capacity_bytes,
            size: 0,
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            hits: 0,
            misses: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            blocks: self.len(),
            size_in_bytes: self.size,
        }
    }

    /// Drops every entry and clears the statistics
    pub fn reset(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.size = 0;
        self.hits = 0;
        self.misses = 0;
    }

    /// Looks a block up, promoting it to most-recently-used on a hit
    pub fn get(&mut self, key: &BlockKey) -> Option<Arc<InteractionBlock>> {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.hits += 1;
                self.detach(idx);
                self.attach_front(idx);
                Some(Arc::clone(&self.nodes[idx].block))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts a block, evicting from the least-recently-used end until the
    /// newcomer fits. A block larger than the whole budget is still accepted
    /// into an empty cache so forward progress never blocks.
    pub fn insert(&mut self, key: BlockKey, block: Arc<InteractionBlock>) {
        let cost = block.size_in_bytes();
        if let Some(idx) = self.map.get(&key).copied() {
            self.size = self.size - self.nodes[idx].cost + cost;
            self.nodes[idx].block = block;
            self.nodes[idx].cost = cost;
            self.detach(idx);
            self.attach_front(idx);
            return;
        }

        while self.size + cost > self.capacity && !self.map.is_empty() {
            self.evict_oldest();
        }

        let node = Node {
            key,
            block,
            cost,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.size += cost;
        self.attach_front(idx);
    }

    fn evict_oldest(&mut self) {
        let idx = self.tail;
        debug_assert_ne!(idx, NIL);
        self.detach(idx);
        self.size -= self.nodes[idx].cost;
        self.map.remove(&self.nodes[idx].key);
        // drop the Arc; in-flight readers keep the block alive
        self.nodes[idx].block = Arc::new(InteractionBlock::empty());
        self.free.push(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            if self.head == idx {
                self.head = next;
            }
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            if self.tail == idx {
                self.tail = prev;
            }
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BlockRecord;

    fn key(block_id: u64) -> BlockKey {
        BlockKey {
            chrom1: 0,
            chrom2: 0,
            block_id,
        }
    }

    /// A block whose accounted size is `n * 20` bytes
    fn block_of(n: u32) -> Arc<InteractionBlock> {
        let records: Vec<BlockRecord> = (0..n)
            .map(|i| BlockRecord {
                bin1: 0,
                bin2: i,
                count: 1.0,
            })
            .collect();
        Arc::new(InteractionBlock::from_records(records))
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BlockCache::new(0).is_err());
        assert!(BlockCache::new(1).is_ok());
    }

    // ==================== Hit/Miss Tests ====================

    #[test]
    fn test_second_find_is_a_hit() {
        let mut cache = BlockCache::new(1000).unwrap();
        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(1), block_of(2));
        assert!(cache.get(&key(1)).is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_keys_distinguish_chromosome_pairs() {
        let mut cache = BlockCache::new(1000).unwrap();
        cache.insert(key(7), block_of(1));
        let other_pair = BlockKey {
            chrom1: 0,
            chrom2: 1,
            block_id: 7,
        };
        assert!(cache.get(&other_pair).is_none());
    }

    // ==================== Eviction Tests ====================

    #[test]
    fn test_capacity_never_exceeded_after_insertions() {
        let mut cache = BlockCache::new(100).unwrap();
        for i in 0..20 {
            cache.insert(key(i), block_of(2)); // 40 bytes each
            assert!(cache.size_in_bytes() <= 100 || cache.len() == 1);
        }
    }

    #[test]
    fn test_lru_eviction_scenario() {
        // capacity 100, three 40-byte blocks A(0), B(1), C(2)
        let mut cache = BlockCache::new(100).unwrap();
        cache.insert(key(0), block_of(2));
        cache.insert(key(1), block_of(2));
        // C needs room: A is least recently used and gets evicted
        cache.insert(key(2), block_of(2));
        assert!(cache.get(&key(0)).is_none());

        // inserting D now evicts B, the least recently used survivor,
        // never C (most recent)
        cache.insert(key(3), block_of(2));
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.get(&key(3)).is_some());
    }

    #[test]
    fn test_recency_promotion_changes_eviction_order() {
        let mut cache = BlockCache::new(80).unwrap();
        cache.insert(key(0), block_of(2));
        cache.insert(key(1), block_of(2));
        // promote block 0; block 1 becomes LRU
        assert!(cache.get(&key(0)).is_some());
        cache.insert(key(2), block_of(2));
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(0)).is_some());
    }

    #[test]
    fn test_oversized_block_accepted_when_empty() {
        let mut cache = BlockCache::new(50).unwrap();
        cache.insert(key(0), block_of(10)); // 200 bytes > capacity
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(0)).is_some());

        // a second insert evicts the oversized resident first
        cache.insert(key(1), block_of(1));
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn test_eviction_does_not_invalidate_shared_blocks() {
        let mut cache = BlockCache::new(40).unwrap();
        let block = block_of(2);
        cache.insert(key(0), Arc::clone(&block));
        cache.insert(key(1), block_of(2)); // evicts block 0
        assert!(cache.get(&key(0)).is_none());
        // the caller's Arc still reads fine
        assert_eq!(block.num_records(), 2);
    }

    // ==================== Reset Tests ====================

    #[test]
    fn test_reset_clears_entries_and_stats() {
        let mut cache = BlockCache::new(1000).unwrap();
        cache.insert(key(0), block_of(2));
        let _ = cache.get(&key(0));
        let _ = cache.get(&key(9));
        cache.reset();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size_in_bytes(), 0);
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
        assert!(cache.get(&key(0)).is_none());
    }

    #[test]
    fn test_reinsert_same_key_updates_in_place() {
        let mut cache = BlockCache::new(1000).unwrap();
        cache.insert(key(0), block_of(2));
        cache.insert(key(0), block_of(5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_in_bytes(), 100);
    }
}
