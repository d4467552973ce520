//! Topological Queue
//!
//! A min-priority queue keyed by node level. Within a turn the engine drains
//! it in level order so every node evaluates after the nodes it reads from.
//!
//! # Ordering
//!
//! Entries with the smallest level come out first. Entries with equal levels
//! come out in insertion order, which keeps evaluation order reproducible.
//! Re-inserting a queued key moves it to its new level and counts as a fresh
//! insertion for tie-breaking purposes.
//!
//! # Implementation
//!
//! A binary heap with lazy deletion. The `positions` map is the source of
//! truth for membership; heap entries whose sequence number no longer matches
//! are stale and skipped on extraction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// A level-ordered queue with in-place re-leveling.
#[derive(Debug)]
pub struct TopoQueue<K> {
    heap: BinaryHeap<Reverse<(u32, u64, K)>>,
    positions: HashMap<K, (u32, u64)>,
    next_seq: u64,
}

impl<K> TopoQueue<K>
where
    K: Copy + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add `key` at `level`, or move it there if it is already queued.
    pub fn insert(&mut self, key: K, level: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.positions.insert(key, (level, seq));
        self.heap.push(Reverse((level, seq, key)));
        self.compact_if_bloated();
    }

    /// Remove and return the entry with the smallest level.
    pub fn extract_min(&mut self) -> Option<(K, u32)> {
        while let Some(Reverse((level, seq, key))) = self.heap.pop() {
            if self.positions.get(&key) == Some(&(level, seq)) {
                self.positions.remove(&key);
                return Some((key, level));
            }
        }
        None
    }

    /// Peek at the level of the next entry without removing it.
    pub fn min_level(&mut self) -> Option<u32> {
        while let Some(Reverse((level, seq, key))) = self.heap.peek().copied() {
            if self.positions.get(&key) == Some(&(level, seq)) {
                return Some(level);
            }
            self.heap.pop();
        }
        None
    }

    /// Evict `key` from the queue. Returns whether it was queued.
    pub fn remove(&mut self, key: K) -> bool {
        self.positions.remove(&key).is_some()
    }

    pub fn contains(&self, key: K) -> bool {
        self.positions.contains_key(&key)
    }

    /// The level at which `key` is queued, if any.
    pub fn level_of(&self, key: K) -> Option<u32> {
        self.positions.get(&key).map(|(level, _)| *level)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.positions.clear();
    }

    // Re-leveling leaves stale heap entries behind; rebuild once they
    // outnumber live ones so the heap stays proportional to the queue.
    fn compact_if_bloated(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.positions.len() * 4 {
            self.heap = self
                .positions
                .iter()
                .map(|(key, (level, seq))| Reverse((*level, *seq, *key)))
                .collect();
        }
    }
}

impl<K> Default for TopoQueue<K>
where
    K: Copy + Eq + Hash + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut TopoQueue<u32>) -> Vec<u32> {
        std::iter::from_fn(|| queue.extract_min().map(|(key, _)| key)).collect()
    }

    #[test]
    fn extracts_in_level_order() {
        let mut queue = TopoQueue::new();
        queue.insert(10, 3);
        queue.insert(11, 1);
        queue.insert(12, 2);

        assert_eq!(drain(&mut queue), vec![11, 12, 10]);
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_levels_are_fifo() {
        let mut queue = TopoQueue::new();
        for key in [5, 3, 9, 1] {
            queue.insert(key, 2);
        }
        queue.insert(7, 1);

        assert_eq!(drain(&mut queue), vec![7, 5, 3, 9, 1]);
    }

    #[test]
    fn reinsertion_moves_instead_of_duplicating() {
        let mut queue = TopoQueue::new();
        queue.insert(1, 1);
        queue.insert(2, 2);
        queue.insert(1, 5);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.level_of(1), Some(5));
        assert_eq!(queue.extract_min(), Some((2, 2)));
        assert_eq!(queue.extract_min(), Some((1, 5)));
        assert_eq!(queue.extract_min(), None);
    }

    #[test]
    fn reinsertion_at_same_level_goes_to_the_back() {
        let mut queue = TopoQueue::new();
        queue.insert(1, 0);
        queue.insert(2, 0);
        queue.insert(1, 0);

        assert_eq!(drain(&mut queue), vec![2, 1]);
    }

    #[test]
    fn contains_and_remove() {
        let mut queue = TopoQueue::new();
        queue.insert(4, 0);
        assert!(queue.contains(4));
        assert!(!queue.contains(5));

        assert!(queue.remove(4));
        assert!(!queue.remove(4));
        assert!(!queue.contains(4));
        assert_eq!(queue.extract_min(), None);
    }

    #[test]
    fn min_level_skips_stale_entries() {
        let mut queue = TopoQueue::new();
        queue.insert(1, 0);
        queue.insert(2, 3);
        queue.insert(1, 4);
        assert_eq!(queue.min_level(), Some(3));
    }

    #[test]
    fn heavy_releveling_stays_consistent() {
        let mut queue = TopoQueue::new();
        for round in 0..100u32 {
            for key in 0..10u32 {
                queue.insert(key, round + key);
            }
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(drain(&mut queue), (0..10).collect::<Vec<_>>());
    }
}
