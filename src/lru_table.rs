//! Small set-associative LRU lookup table, used by the PTW's PSCLs and
//! available to replacement policies that want an auxiliary table of
//! their own. Thin wrapper over `lru::LruCache` per set, following the
//! teacher's `Tlb`/`FullyAssociativeCache` pattern of one `LruCache` per
//! set rather than a hand-rolled doubly linked list.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::error::ConfigError;

pub struct LruTable<V> {
    sets: Vec<LruCache<u64, V>>,
}

impl<V> LruTable<V> {
    pub fn new(num_sets: usize, ways: usize) -> Result<Self, ConfigError> {
        if num_sets == 0 {
            return Err(ConfigError::Zero { field: "pscl sets" });
        }
        if ways == 0 {
            return Err(ConfigError::Zero { field: "pscl ways" });
        }
        let cap = NonZeroUsize::new(ways).unwrap();
        Ok(LruTable {
            sets: (0..num_sets).map(|_| LruCache::new(cap)).collect(),
        })
    }

    fn set_index(&self, index: u64) -> usize {
        (index as usize) % self.sets.len()
    }

    pub fn get(&mut self, index: u64) -> Option<&V> {
        let s = self.set_index(index);
        self.sets[s].get(&index)
    }

    pub fn insert(&mut self, index: u64, value: V) {
        let s = self.set_index(index);
        self.sets[s].put(index, value);
    }

    pub fn contains(&self, index: u64) -> bool {
        let s = self.set_index(index);
        self.sets[s].contains(&index)
    }
}
