//! Run counters shared by every worker

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated concurrently by the client, the batcher and the caches
#[derive(Debug, Default)]
pub struct RunStats {
    api_calls: AtomicU64,
    batched_calls: AtomicU64,
    batched_requests: AtomicU64,
    fallback_batches: AtomicU64,
    cache_hits: AtomicU64,
    throttle_retries: AtomicU64,
    transient_retries: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// One `$batch` POST carrying `requests` sub-requests
    pub fn record_batch(&self, requests: usize) {
        self.batched_calls.fetch_add(1, Ordering::Relaxed);
        self.batched_requests
            .fetch_add(requests as u64, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle_retry(&self) {
        self.throttle_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_api_calls: self.api_calls.load(Ordering::Relaxed),
            batched_calls: self.batched_calls.load(Ordering::Relaxed),
            batched_requests: self.batched_requests.load(Ordering::Relaxed),
            fallback_batches: self.fallback_batches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            throttle_retries: self.throttle_retries.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RunStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_api_calls: u64,
    pub batched_calls: u64,
    pub batched_requests: u64,
    pub fallback_batches: u64,
    pub cache_hits: u64,
    pub throttle_retries: u64,
    pub transient_retries: u64,
}
