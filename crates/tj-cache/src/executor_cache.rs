use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

/// Outcome of [`ExecutorCache::get_or_compile`].
#[derive(Debug)]
pub enum CacheLookup<V> {
    Hit(Arc<V>),
    /// Compiled by this call, or by a concurrent caller that inserted first.
    Miss(Arc<V>),
}

impl<V> CacheLookup<V> {
    #[must_use]
    pub fn value(&self) -> &Arc<V> {
        match self {
            Self::Hit(value) | Self::Miss(value) => value,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Arc<V> {
        match self {
            Self::Hit(value) | Self::Miss(value) => value,
        }
    }

    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Compilations whose result was discarded because another caller
    /// inserted the same key first.
    pub lost_races: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    last_used: u64,
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: FxHashMap<K, Entry<V>>,
    clock: u64,
    stats: CacheStats,
}

/// Specialization-keyed store of compiled plans, shared across threads.
///
/// Compilation runs outside the lock; when two callers race on one key the
/// first insertion wins and both receive the same `Arc`. Unbounded unless a
/// capacity is given, in which case the least recently used entry is evicted.
#[derive(Debug)]
pub struct ExecutorCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> ExecutorCache<K, V> {
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: FxHashMap::default(),
                clock: 0,
                stats: CacheStats::default(),
            }),
            capacity: capacity.map(|c| c.max(1)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        inner.clock += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_used = inner.clock;
        Some(Arc::clone(&entry.value))
    }

    pub fn get_or_compile<E>(
        &self,
        key: &K,
        compile: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<CacheLookup<V>, E> {
        {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let inner = &mut *guard;
            inner.clock += 1;
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.last_used = inner.clock;
                inner.stats.hits += 1;
                log::trace!("executor cache hit");
                return Ok(CacheLookup::Hit(Arc::clone(&entry.value)));
            }
        }

        let compiled = Arc::new(compile(key)?);

        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        inner.clock += 1;
        inner.stats.misses += 1;
        if let Some(existing) = inner.entries.get_mut(key) {
            existing.last_used = inner.clock;
            inner.stats.lost_races += 1;
            log::debug!("executor cache: concurrent compilation lost the insertion race");
            return Ok(CacheLookup::Miss(Arc::clone(&existing.value)));
        }
        inner.entries.insert(
            key.clone(),
            Entry {
                value: Arc::clone(&compiled),
                last_used: inner.clock,
            },
        );
        if let Some(capacity) = self.capacity {
            while inner.entries.len() > capacity {
                let Some(oldest) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
                log::debug!("executor cache evicted its least recently used entry");
            }
        }
        inner.stats.entries = inner.entries.len();
        log::debug!("executor cache miss; {} entries cached", inner.stats.entries);
        Ok(CacheLookup::Miss(compiled))
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.stats.entries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutorCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn second_lookup_hits_and_shares_the_value() {
        let cache: ExecutorCache<u32, String> = ExecutorCache::new(None);
        let first = cache
            .get_or_compile(&1, |k| Ok::<_, ()>(format!("plan-{k}")))
            .expect("compile");
        let second = cache
            .get_or_compile(&1, |_| Err(()))
            .expect("hit does not compile");
        assert!(!first.is_hit());
        assert!(second.is_hit());
        assert!(Arc::ptr_eq(first.value(), second.value()));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn compile_errors_are_not_cached() {
        let cache: ExecutorCache<u32, u32> = ExecutorCache::new(None);
        assert_eq!(cache.get_or_compile(&7, |_| Err("boom")).map(|_| ()), Err("boom"));
        assert!(cache.is_empty());
        let ok = cache.get_or_compile(&7, |k| Ok::<_, &str>(*k * 2)).expect("retry");
        assert_eq!(**ok.value(), 14);
    }

    #[test]
    fn bounded_cache_evicts_least_recently_used() {
        let cache: ExecutorCache<u32, u32> = ExecutorCache::new(Some(2));
        for key in [1, 2] {
            cache.get_or_compile(&key, |k| Ok::<_, ()>(*k)).expect("fill");
        }
        assert!(cache.get(&1).is_some());
        cache.get_or_compile(&3, |k| Ok::<_, ()>(*k)).expect("insert");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn racing_compilations_converge_on_one_value() {
        let cache: Arc<ExecutorCache<u32, usize>> = Arc::new(ExecutorCache::new(None));
        let compilations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let compilations = Arc::clone(&compilations);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_compile(&0, |_| {
                            Ok::<_, ()>(compilations.fetch_add(1, Ordering::SeqCst))
                        })
                        .expect("compile")
                        .into_value()
                })
            })
            .collect();
        let values: Vec<Arc<usize>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(cache.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 4);
        assert_eq!(
            stats.lost_races as usize,
            compilations.load(Ordering::SeqCst) - 1
        );
    }
}
