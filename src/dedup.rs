use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Bounded set of recently seen message ids, evicting the least recently touched.
///
/// `add` does its check and insert under one lock, so two tasks racing on the
/// same id can never both see it as new.
pub struct DedupCache {
    seen: Mutex<LruCache<String, ()>>,
}

impl DedupCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record `id`. Returns `true` if it was not already present.
    /// A hit still counts as a touch and refreshes the entry.
    pub fn add(&self, id: &str) -> bool {
        let mut seen = self.lock();
        if seen.get(id).is_some() {
            return false;
        }
        seen.put(id.to_string(), ());
        true
    }

    /// Membership check that does not touch the entry.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, ()>> {
        // The cache holds no invariants a panicking holder could break.
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_add_reports_duplicate() {
        let cache = DedupCache::new(10);
        assert!(cache.add("a"));
        assert!(!cache.add("a"));
        assert!(!cache.add("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_inserted_is_evicted_past_capacity() {
        let cache = DedupCache::new(3);
        for id in ["a", "b", "c", "d"] {
            assert!(cache.add(id));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let cache = DedupCache::new(3);
        cache.add("a");
        cache.add("b");
        cache.add("c");
        // Duplicate add of "a" is a touch, so "b" is now the oldest.
        assert!(!cache.add("a"));
        cache.add("d");

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        // An evicted id is new again.
        assert!(cache.add("b"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.add("x"));
        assert!(!cache.add("x"));
    }

    #[test]
    fn concurrent_adds_of_one_id_have_a_single_winner() {
        let cache = Arc::new(DedupCache::new(100));
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if cache.add("contended") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
