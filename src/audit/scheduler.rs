//! Concurrency Scheduler
//!
//! Fans a worker out over the resource set with at most `max_parallel`
//! tasks in flight. A failing or panicking worker is turned into an errored
//! placeholder, so every dispatched resource comes back exactly once.
//! Raising the cancel flag stops dispatch; in-flight work is awaited.

use super::memory;
use super::model::{Resource, ResourceDetail};
use crate::graph::RunStats;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_parallel: usize,
    /// Resident-memory ceiling in bytes
    pub memory_ceiling: Option<u64>,
    /// Completions between memory checks
    pub memory_check_interval: usize,
    /// Completions between progress log lines
    pub progress_interval: usize,
    pub memory_probe: fn() -> Option<u64>,
    /// Counters echoed on progress lines
    pub stats: Option<Arc<RunStats>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            memory_ceiling: None,
            memory_check_interval: 50,
            progress_interval: 25,
            memory_probe: memory::resident_bytes,
            stats: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub details: Vec<ResourceDetail>,
    pub dispatched: usize,
    /// Resources never dispatched because the run was cancelled
    pub skipped: usize,
    pub cancelled: bool,
    pub memory_reliefs: usize,
}

pub struct Scheduler {
    options: SchedulerOptions,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, cancel: Arc<AtomicBool>) -> Self {
        Self { options, cancel }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn over_ceiling(&self) -> bool {
        match self.options.memory_ceiling {
            Some(ceiling) => (self.options.memory_probe)().is_some_and(|rss| rss > ceiling),
            None => false,
        }
    }

    fn log_progress(&self, done: usize, total: usize, started: Instant) {
        let rate = done as f64 / started.elapsed().as_secs_f64().max(0.001);
        match &self.options.stats {
            Some(stats) => {
                let snap = stats.snapshot();
                tracing::info!(
                    "Processed {}/{} resources ({:.1}/s, {} calls, {} cache hits, {} throttled)",
                    done,
                    total,
                    rate,
                    snap.total_api_calls,
                    snap.cache_hits,
                    snap.throttle_retries
                );
            }
            None => tracing::info!("Processed {}/{} resources ({:.1}/s)", done, total, rate),
        }
    }

    /// Run `worker` over `resources`. `on_complete` sees every finished
    /// record, placeholders included; `relieve` is invoked when the memory
    /// ceiling is exceeded.
    pub async fn run_all<W, Fut, E, C, R>(
        &self,
        resources: Vec<Resource>,
        worker: W,
        mut on_complete: C,
        mut relieve: R,
    ) -> RunOutcome
    where
        W: Fn(Resource) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceDetail, E>> + Send + 'static,
        E: Display + Send + 'static,
        C: FnMut(&ResourceDetail),
        R: FnMut(),
    {
        let total = resources.len();
        let max_parallel = self.options.max_parallel.max(1);
        let worker = Arc::new(worker);
        let started = Instant::now();

        let mut queue = resources.into_iter();
        let mut in_flight: HashMap<String, Resource> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut outcome = RunOutcome {
            details: Vec::with_capacity(total),
            ..Default::default()
        };

        tracing::info!("Expanding {} resources with {} workers", total, max_parallel);

        loop {
            while tasks.len() < max_parallel && !self.is_cancelled() {
                let Some(resource) = queue.next() else { break };
                in_flight.insert(resource.id.clone(), resource.clone());
                outcome.dispatched += 1;

                let worker = Arc::clone(&worker);
                tasks.spawn(async move {
                    let placeholder_for = resource.clone();
                    let run = AssertUnwindSafe(async move { worker(resource).await }).catch_unwind();
                    match run.await {
                        Ok(Ok(detail)) => detail,
                        Ok(Err(err)) => {
                            tracing::warn!("Resource {} failed: {}", placeholder_for.id, err);
                            ResourceDetail::placeholder(placeholder_for, err.to_string())
                        }
                        Err(_) => {
                            tracing::error!("Worker panicked on resource {}", placeholder_for.id);
                            ResourceDetail::placeholder(placeholder_for, "worker panicked")
                        }
                    }
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let detail = match joined {
                Ok(detail) => detail,
                Err(err) => {
                    tracing::error!("Worker task lost: {}", err);
                    continue;
                }
            };

            in_flight.remove(detail.id());
            on_complete(&detail);
            outcome.details.push(detail);

            let done = outcome.details.len();
            if self.options.progress_interval > 0 && done % self.options.progress_interval == 0 {
                self.log_progress(done, total, started);
            }

            if self.options.memory_check_interval > 0
                && done % self.options.memory_check_interval == 0
                && self.over_ceiling()
            {
                tracing::warn!("Memory ceiling exceeded after {} resources, releasing caches", done);
                relieve();
                outcome.details.shrink_to_fit();
                outcome.memory_reliefs += 1;
                tokio::task::yield_now().await;
            }
        }

        // tasks that vanished without a result still get a record
        for (_, resource) in in_flight.drain() {
            outcome
                .details
                .push(ResourceDetail::placeholder(resource, "worker task aborted"));
        }

        outcome.cancelled = self.is_cancelled();
        outcome.skipped = total - outcome.dispatched;
        if outcome.cancelled {
            tracing::warn!(
                "Run cancelled: {} resources left undispatched",
                outcome.skipped
            );
        }
        outcome
    }
}
