//! Result Cache
//!
//! Per-entity-type memoization for the lifetime of one run. Each key owns a
//! `OnceCell`, so concurrent callers asking for the same id share a single
//! fetch. Successful values and confirmed-absent results are kept; failed
//! fetches leave the cell empty so the next caller tries again.

use super::model::{GroupMember, LinkedGroup, PermissionGrant, Resource};
use crate::error::ApiError;
use crate::graph::RunStats;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A cached lookup outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<T> {
    Present(T),
    /// The entity or relationship is known not to exist
    Absent,
}

impl<T> CacheEntry<T> {
    pub fn present(self) -> Option<T> {
        match self {
            CacheEntry::Present(value) => Some(value),
            CacheEntry::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, CacheEntry::Absent)
    }
}

impl<T> From<Option<T>> for CacheEntry<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => CacheEntry::Present(v),
            None => CacheEntry::Absent,
        }
    }
}

/// Memoization for one entity type, keyed by remote id
pub struct ResultCache<T> {
    name: &'static str,
    entries: DashMap<String, Arc<OnceCell<CacheEntry<T>>>>,
    hits: AtomicU64,
    fetches: AtomicU64,
    stats: Arc<RunStats>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(name: &'static str, stats: Arc<RunStats>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            stats,
        }
    }

    fn cell(&self, id: &str) -> Arc<OnceCell<CacheEntry<T>>> {
        // clone the Arc so the shard lock is released before any await
        Arc::clone(self.entries.entry(id.to_string()).or_default().value())
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.stats.record_cache_hit();
    }

    /// Return the cached outcome for `id`, invoking `fetch` only on a miss.
    /// Errors from `fetch` are returned and not cached.
    pub async fn get_or_fetch<F, Fut>(&self, id: &str, fetch: F) -> Result<CacheEntry<T>, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry<T>, ApiError>>,
    {
        let cell = self.cell(id);
        if let Some(entry) = cell.get() {
            self.record_hit();
            return Ok(entry.clone());
        }

        let mut fetched = false;
        let entry = cell
            .get_or_try_init(|| {
                fetched = true;
                self.fetches.fetch_add(1, Ordering::Relaxed);
                fetch()
            })
            .await?
            .clone();

        if fetched {
            tracing::trace!("{} cache miss for {}", self.name, id);
        } else {
            // another caller finished the fetch while we waited
            self.record_hit();
        }
        Ok(entry)
    }

    /// Cached outcome without fetching or counting a hit
    pub fn peek(&self, id: &str) -> Option<CacheEntry<T>> {
        self.entries.get(id).and_then(|cell| cell.get().cloned())
    }

    /// Seed a value obtained by other means. An existing entry wins.
    pub fn insert(&self, id: &str, entry: CacheEntry<T>) {
        let _ = self.cell(id).set(entry);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of times a fetch function was actually invoked
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shrink(&self) {
        self.entries.shrink_to_fit();
    }
}

/// The caches the pipeline shares across workers
pub struct AuditCache {
    pub resources: ResultCache<Resource>,
    pub permission_sets: ResultCache<Vec<PermissionGrant>>,
    pub linked_groups: ResultCache<LinkedGroup>,
    pub group_members: ResultCache<Vec<GroupMember>>,
}

impl AuditCache {
    pub fn new(stats: Arc<RunStats>) -> Self {
        Self {
            resources: ResultCache::new("resource", Arc::clone(&stats)),
            permission_sets: ResultCache::new("permission-set", Arc::clone(&stats)),
            linked_groups: ResultCache::new("group", Arc::clone(&stats)),
            group_members: ResultCache::new("group-membership", stats),
        }
    }

    pub fn hits(&self) -> u64 {
        self.resources.hits()
            + self.permission_sets.hits()
            + self.linked_groups.hits()
            + self.group_members.hits()
    }

    /// Release spare map capacity under memory pressure
    pub fn shrink(&self) {
        self.resources.shrink();
        self.permission_sets.shrink();
        self.linked_groups.shrink();
        self.group_members.shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn cache() -> ResultCache<String> {
        ResultCache::new("test", Arc::new(RunStats::new()))
    }

    #[tokio::test]
    async fn test_hit_skips_fetch() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let entry = cache
                .get_or_fetch("a", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheEntry::Present("value".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(entry, CacheEntry::Present("value".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hits(), 2);
    }

    #[tokio::test]
    async fn test_absent_is_cached() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..4 {
            let entry = cache
                .get_or_fetch("no-group", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheEntry::Absent)
                })
                .await
                .unwrap();
            assert!(entry.is_absent());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = cache();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let result = cache
                .get_or_fetch("flaky", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Transient("HTTP 503".into()))
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.peek("flaky").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("shared", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(CacheEntry::Present("v".to_string()))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetches(), 1);
        assert_eq!(cache.hits(), 15);
    }

    #[test]
    fn test_insert_does_not_overwrite() {
        let cache = cache();
        cache.insert("k", CacheEntry::Present("first".into()));
        cache.insert("k", CacheEntry::Present("second".into()));
        assert_eq!(cache.peek("k"), Some(CacheEntry::Present("first".into())));
    }
}
