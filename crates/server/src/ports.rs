//! Port offset allocation for hot-pluggable device categories
//!
//! A [`PortPool`] hands out the smallest free offset of its range to a
//! device key and takes it back on release. The free and allocated sets are
//! always disjoint and together cover the whole range.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

struct PoolState<K> {
    free: BTreeSet<u16>,
    allocated: HashMap<K, u16>,
}

pub struct PortPool<K> {
    name: String,
    range: RangeInclusive<u16>,
    state: Mutex<PoolState<K>>,
}

impl<K> PortPool<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(name: impl Into<String>, range: RangeInclusive<u16>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PoolState {
                free: range.clone().collect(),
                allocated: HashMap::new(),
            }),
            range,
        }
    }

    /// Bind the smallest free offset to `key`
    ///
    /// Returns `None` when the pool is exhausted or `key` already holds an
    /// offset.
    pub fn allocate(&self, key: K) -> Option<u16> {
        let mut state = self.state.lock();
        if let Some(existing) = state.allocated.get(&key) {
            warn!(
                "{} pool: {:?} already holds offset {}, not allocating again",
                self.name, key, existing
            );
            return None;
        }
        let Some(offset) = state.free.pop_first() else {
            warn!("{} pool exhausted", self.name);
            return None;
        };
        debug!("{} pool: allocated {} to {:?}", self.name, offset, key);
        state.allocated.insert(key, offset);
        Some(offset)
    }

    /// Return `key`'s offset to the free set
    pub fn release(&self, key: &K) -> Option<u16> {
        let mut state = self.state.lock();
        let offset = state.allocated.remove(key)?;
        state.free.insert(offset);
        debug!("{} pool: released {} from {:?}", self.name, offset, key);
        Some(offset)
    }

    pub fn port_of(&self, key: &K) -> Option<u16> {
        self.state.lock().allocated.get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().allocated.contains_key(key)
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Keys currently holding an offset, in offset order
    pub fn allocations(&self) -> Vec<(K, u16)> {
        let state = self.state.lock();
        let mut entries: Vec<(K, u16)> = state
            .allocated
            .iter()
            .map(|(k, offset)| (k.clone(), *offset))
            .collect();
        entries.sort_by_key(|(_, offset)| *offset);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_smallest_first_reuse() {
        let pool = PortPool::new("test", 2..=4);
        assert_eq!(pool.allocate("a"), Some(2));
        assert_eq!(pool.allocate("b"), Some(3));
        assert_eq!(pool.release(&"a"), Some(2));
        assert_eq!(pool.allocate("c"), Some(2));
    }

    #[test]
    fn test_exhaustion_and_unknown_release() {
        let pool = PortPool::new("test", 2..=3);
        assert_eq!(pool.allocate("a"), Some(2));
        assert_eq!(pool.allocate("b"), Some(3));
        assert_eq!(pool.allocate("c"), None);
        assert_eq!(pool.release(&"zzz"), None);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_duplicate_key_is_refused() {
        let pool = PortPool::new("test", 2..=100);
        assert_eq!(pool.allocate("dev"), Some(2));
        assert_eq!(pool.allocate("dev"), None);
        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.port_of(&"dev"), Some(2));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let pool = Arc::new(PortPool::new("test", 0..=199));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter_map(|i| pool.allocate(format!("{}-{}", t, i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(pool.free_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_free_and_allocated_partition_range(ops in prop::collection::vec((any::<bool>(), 0u8..12), 0..200)) {
            let pool = PortPool::new("prop", 2..=9);
            for (allocate, key) in ops {
                if allocate {
                    pool.allocate(key);
                } else {
                    pool.release(&key);
                }

                let allocations = pool.allocations();
                let mut offsets: Vec<u16> = allocations.iter().map(|(_, o)| *o).collect();
                offsets.dedup();
                prop_assert_eq!(offsets.len(), allocations.len());
                prop_assert_eq!(pool.free_count() + pool.allocated_count(), 8);
                prop_assert!(offsets.iter().all(|o| pool.range().contains(o)));
            }
        }
    }
}
