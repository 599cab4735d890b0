//! Bounded read cache for one shard

use std::collections::{HashMap, VecDeque};

use crate::partition::ChunkPos;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// FIFO-evicting cache of partition payloads read from storage.
///
/// A capacity of zero disables caching.
#[derive(Debug)]
pub struct ReadCache {
    capacity: usize,
    entries: HashMap<ChunkPos, Vec<u8>>,
    order: VecDeque<ChunkPos>,
    stats: CacheStats,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, pos: &ChunkPos) -> Option<Vec<u8>> {
        match self.entries.get(pos) {
            Some(data) => {
                self.stats.hits += 1;
                Some(data.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, pos: ChunkPos, data: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(pos, data).is_none() {
            self.order.push_back(pos);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.stats.evictions += 1;
            }
        }
    }

    pub fn remove(&mut self, pos: &ChunkPos) {
        if self.entries.remove(pos).is_some() {
            self.order.retain(|p| p != pos);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
