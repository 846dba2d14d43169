//! Audit orchestration
//!
//! Discovery, checkpoint filtering, bounded expansion and merging of
//! resumed results into one [`RunReport`]. In resume mode the checkpoint is
//! written when the run ends, whether it succeeded, failed or was cancelled.

use super::cache::AuditCache;
use super::checkpoint::{CheckpointManager, CheckpointRecorder};
use super::discovery::{self, DiscoveryOptions, Strategy};
use super::exclusion::ExclusionList;
use super::expander::{DetailExpander, ExpanderOptions};
use super::model::{Resource, ResourceDetail};
use super::scheduler::{RunOutcome, Scheduler, SchedulerOptions};
use super::summary::TenantSummary;
use crate::config::AuditConfig;
use crate::error::PipelineError;
use crate::graph::{ApiClient, RunStats, StatsSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Everything a finished (or cancelled) run hands to the reporting side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub discovered: usize,
    /// Records carried over from a previous run's checkpoint
    pub resumed: usize,
    /// Records produced by this run
    pub processed: usize,
    pub errored: usize,
    pub cancelled: bool,
    pub delta_link: Option<String>,
    pub stats: StatsSnapshot,
    pub summary: TenantSummary,
    pub details: Vec<ResourceDetail>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.errored == 0
    }
}

/// One audit run's shared context
pub struct Pipeline {
    config: AuditConfig,
    client: ApiClient,
    cache: Arc<AuditCache>,
    stats: Arc<RunStats>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: AuditConfig, token: &str, cancel: Arc<AtomicBool>) -> anyhow::Result<Self> {
        config.validate()?;
        let stats = Arc::new(RunStats::new());
        let client = ApiClient::new(
            &config.api_base_url,
            token,
            config.retry.clone(),
            config.call_timeout(),
            Arc::clone(&stats),
        )?;

        Ok(Self {
            cache: Arc::new(AuditCache::new(Arc::clone(&stats))),
            config,
            client,
            stats,
            cancel,
        })
    }

    pub fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<AuditCache> {
        &self.cache
    }

    /// Run the audit end to end
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        tracing::info!("Starting audit run {}", run_id);

        let checkpoints = self
            .config
            .resume
            .then(|| CheckpointManager::new(self.config.checkpoint_path()));

        let mut saved = match &checkpoints {
            Some(manager) => manager.load()?.unwrap_or_default(),
            None => Default::default(),
        };
        saved.run_id = Some(run_id);
        let recorder = CheckpointRecorder::new(saved);

        let result = self.execute(run_id, &recorder).await;

        if let Some(manager) = &checkpoints {
            let mut state = recorder.snapshot();
            if let Err(err) = manager.save(&mut state) {
                if result.is_ok() {
                    return Err(PipelineError::Checkpoint(err));
                }
                tracing::error!("Checkpoint save failed after run error: {:#}", err);
            }
        }

        match &result {
            Ok(report) => tracing::info!(
                "Run {} finished: {} records, {} errored, {} API calls in {} ms",
                run_id,
                report.details.len(),
                report.errored,
                report.stats.total_api_calls,
                report.elapsed_ms
            ),
            Err(err) => tracing::error!("Run {} failed: {}", run_id, err),
        }
        result
    }

    async fn execute(&self, run_id: Uuid, recorder: &CheckpointRecorder) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let options = DiscoveryOptions {
            strategies: Strategy::ALL.to_vec(),
            exclusions: ExclusionList::new(&self.config.exclusions),
            include_personal: self.config.include_personal,
        };
        let found = discovery::discover(&self.client, &self.cache, &options).await?;

        if self.config.resume {
            self.resync(recorder).await;
        }
        if found.delta_link.is_some() {
            recorder.update(|s| s.continuation_token = found.delta_link.clone());
        }

        let pending = recorder.update(|s| s.pending(found.resources.clone()));
        tracing::info!(
            "{} resources discovered, {} already processed",
            found.resources.len(),
            found.resources.len() - pending.len()
        );

        let fresh = self.expand_all(pending, recorder).await;

        let fresh_ids: HashSet<&str> = fresh.details.iter().map(|d| d.id()).collect();
        let discovered_ids: HashSet<&str> = found.resources.iter().map(|r| r.id.as_str()).collect();
        let carried: Vec<ResourceDetail> = recorder
            .snapshot()
            .partial_results
            .into_values()
            .filter(|d| discovered_ids.contains(d.id()) && !fresh_ids.contains(d.id()))
            .collect();

        let resumed = carried.len();
        let processed = fresh.details.len();
        let mut details = carried;
        details.extend(fresh.details);
        details.sort_by(|a, b| a.id().cmp(b.id()));

        let errored = details.iter().filter(|d| d.is_errored()).count();
        let summary = TenantSummary::from_details(&details, self.config.top_n);

        Ok(RunReport {
            run_id,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            discovered: found.resources.len(),
            resumed,
            processed,
            errored,
            cancelled: fresh.cancelled,
            delta_link: recorder.update(|s| s.continuation_token.clone()),
            stats: self.stats.snapshot(),
            summary,
            details,
        })
    }

    /// Apply site changes since the saved delta link, if any
    async fn resync(&self, recorder: &CheckpointRecorder) {
        let Some(token) = recorder.update(|s| s.continuation_token.clone()) else {
            return;
        };

        match discovery::changes_since(&self.client, &token).await {
            Ok(changes) => {
                tracing::info!(
                    "Delta re-sync: {} changed, {} removed since last run",
                    changes.changed.len(),
                    changes.removed.len()
                );
                recorder.update(|s| s.apply_changes(&changes));
            }
            Err(err) => {
                tracing::warn!("Delta re-sync failed, relying on the processed set: {}", err);
            }
        }
    }

    async fn expand_all(&self, pending: Vec<Resource>, recorder: &CheckpointRecorder) -> RunOutcome {
        let expander = DetailExpander::new(
            self.client.clone(),
            Arc::clone(&self.cache),
            ExpanderOptions {
                largest_items: self.config.largest_items,
            },
        );
        let scheduler = Scheduler::new(
            SchedulerOptions {
                max_parallel: self.config.max_parallel,
                memory_ceiling: self.config.memory_ceiling_bytes(),
                memory_check_interval: self.config.memory_check_interval,
                progress_interval: self.config.progress_interval,
                stats: Some(Arc::clone(&self.stats)),
                ..Default::default()
            },
            Arc::clone(&self.cancel),
        );

        let cache = Arc::clone(&self.cache);
        scheduler
            .run_all(
                pending,
                move |resource| {
                    let expander = expander.clone();
                    async move { expander.expand(resource).await }
                },
                |detail| recorder.record(detail),
                || {
                    cache.shrink();
                    recorder.shrink();
                },
            )
            .await
    }
}
