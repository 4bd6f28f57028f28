use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Memoised decoded audio, keyed by canonical path.
///
/// Shared between pipelines through an `Arc`. When full, the oldest entry is
/// evicted first.
#[derive(Debug)]
pub struct SampleCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<PathBuf, Arc<Vec<f32>>>,
    order: VecDeque<PathBuf>,
}

impl SampleCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Vec<f32>>> {
        self.lock().entries.get(path).cloned()
    }

    pub fn insert(&self, path: PathBuf, samples: Arc<Vec<f32>>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.entries.contains_key(&path) {
            inner.entries.insert(path, samples);
            return;
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    log::trace!("Evicting cached samples for {}", oldest.display());
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(path.clone());
        inner.entries.insert(path, samples);
    }

    /// Return the cached samples for `path`, or compute and store them.
    ///
    /// The lock is not held while `load` runs, so two threads missing on the
    /// same path may both decode it; the second insert wins.
    pub fn get_or_try_insert<E>(
        &self,
        path: &Path,
        load: impl FnOnce() -> Result<Vec<f32>, E>,
    ) -> Result<Arc<Vec<f32>>, E> {
        if let Some(hit) = self.get(path) {
            log::trace!("Sample cache hit: {}", path.display());
            return Ok(hit);
        }
        let samples = Arc::new(load()?);
        self.insert(path.to_path_buf(), Arc::clone(&samples));
        Ok(samples)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SampleCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert_memoises() {
        let cache = SampleCache::new(4);
        let path = Path::new("/a.wav");
        let mut calls = 0;
        let first = cache
            .get_or_try_insert::<()>(path, || {
                calls += 1;
                Ok(vec![1.0, 2.0])
            })
            .unwrap();
        let second = cache
            .get_or_try_insert::<()>(path, || {
                calls += 1;
                Ok(vec![9.0])
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = SampleCache::new(4);
        let path = Path::new("/bad.wav");
        assert!(cache.get_or_try_insert(path, || Err("boom")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = SampleCache::new(2);
        cache.insert(PathBuf::from("/1"), Arc::new(vec![1.0]));
        cache.insert(PathBuf::from("/2"), Arc::new(vec![2.0]));
        cache.insert(PathBuf::from("/3"), Arc::new(vec![3.0]));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(Path::new("/1")).is_none());
        assert!(cache.get(Path::new("/3")).is_some());
    }

    #[test]
    fn test_zero_capacity_and_clear() {
        let disabled = SampleCache::new(0);
        disabled.insert(PathBuf::from("/1"), Arc::new(vec![1.0]));
        assert!(disabled.is_empty());

        let cache = SampleCache::new(2);
        cache.insert(PathBuf::from("/1"), Arc::new(vec![1.0]));
        cache.clear();
        assert!(cache.is_empty());
    }
}
