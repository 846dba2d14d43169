//! Checkpoint Manager
//!
//! Persists run progress so an interrupted audit picks up where it stopped.
//! The file is JSON, written to a sibling temp file and renamed into place.
//! Partial results are stored compacted to keep the file small.

use super::discovery::SiteChanges;
use super::model::{Resource, ResourceDetail};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

const CHECKPOINT_VERSION: u32 = 1;

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Durable progress of an audit run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_resource_ids: BTreeSet<String>,
    /// Finished records keyed by resource id, saved as an array
    #[serde(default, with = "partials")]
    pub partial_results: HashMap<String, ResourceDetail>,
    /// Sites delta link from the last full listing
    #[serde(default, alias = "deltaLink")]
    pub continuation_token: Option<String>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: None,
            saved_at: None,
            processed_resource_ids: BTreeSet::new(),
            partial_results: HashMap::new(),
            continuation_token: None,
        }
    }
}

impl CheckpointState {
    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_resource_ids.contains(id)
    }

    /// Store a finished record. Errored records are kept for the report but
    /// not marked processed, so a resumed run tries them again.
    pub fn record(&mut self, detail: &ResourceDetail) {
        if detail.is_errored() {
            self.processed_resource_ids.remove(detail.id());
        } else {
            self.processed_resource_ids.insert(detail.id().to_string());
        }
        self.partial_results
            .insert(detail.id().to_string(), detail.clone().compact());
    }

    /// Resources still to be audited
    pub fn pending(&self, resources: Vec<Resource>) -> Vec<Resource> {
        resources
            .into_iter()
            .filter(|r| !self.is_processed(&r.id))
            .collect()
    }

    /// Fold a sites delta into the saved progress: removed resources leave
    /// the checkpoint entirely, changed ones are queued for a fresh audit.
    pub fn apply_changes(&mut self, changes: &SiteChanges) {
        for id in &changes.removed {
            self.processed_resource_ids.remove(id);
        }
        for id in &changes.changed {
            self.processed_resource_ids.remove(id);
        }
        self.partial_results
            .retain(|id, _| !changes.removed.contains(id));

        if changes.delta_link.is_some() {
            self.continuation_token = changes.delta_link.clone();
        }
    }
}

/// `partialResults` is an array on disk, ordered by id
mod partials {
    use super::ResourceDetail;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(map: &HashMap<String, ResourceDetail>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut records: Vec<&ResourceDetail> = map.values().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        serializer.collect_seq(records)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, ResourceDetail>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let records = Vec::<ResourceDetail>::deserialize(deserializer)?;
        Ok(records
            .into_iter()
            .map(|d| (d.id().to_string(), d))
            .collect())
    }
}

/// Loads and saves [`CheckpointState`] at a fixed path
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default checkpoint location under the user's data directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("siteaudit").join("checkpoint.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved state; a missing file means a fresh start
    pub fn load(&self) -> Result<Option<CheckpointState>> {
        if !self.path.exists() {
            tracing::debug!("No checkpoint at {}", self.path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))?;
        let state: CheckpointState = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt checkpoint {}", self.path.display()))?;

        tracing::info!(
            "Loaded checkpoint: {} processed, {} partial results",
            state.processed_resource_ids.len(),
            state.partial_results.len()
        );
        Ok(Some(state))
    }

    /// Write state atomically, stamping the save time
    pub fn save(&self, state: &mut CheckpointState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create checkpoint directory {}", parent.display())
                })?;
            }
        }

        state.saved_at = Some(Utc::now());
        let content = serde_json::to_string_pretty(state)?;

        let tmp = self.temp_path();
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move checkpoint into {}", self.path.display()))?;

        tracing::info!(
            "Saved checkpoint ({} processed) to {}",
            state.processed_resource_ids.len(),
            self.path.display()
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint.json".to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }
}

/// Checkpoint state shared with the scheduler's completion callback
#[derive(Debug, Clone, Default)]
pub struct CheckpointRecorder {
    state: Arc<Mutex<CheckpointState>>,
}

impl CheckpointRecorder {
    pub fn new(state: CheckpointState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, detail: &ResourceDetail) {
        self.lock().record(detail);
    }

    /// Run `f` against the state under the writer lock
    pub fn update<R>(&self, f: impl FnOnce(&mut CheckpointState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn processed_count(&self) -> usize {
        self.lock().processed_resource_ids.len()
    }

    pub fn shrink(&self) {
        self.lock().partial_results.shrink_to_fit();
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::model::{Principal, ResourceKind};
    use std::collections::HashSet;

    fn resource(id: &str) -> Resource {
        Resource {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            url: format!("https://t/sites/{}", id),
            kind: ResourceKind::Shared,
        }
    }

    fn detail(id: &str) -> ResourceDetail {
        let mut d = ResourceDetail::new(resource(id));
        d.add_principal(Principal::new("Ann", "ann@contoso.com", "owner"));
        d
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("none.json"));
        assert!(manager.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("nested").join("cp.json"));

        let mut state = CheckpointState {
            run_id: Some(Uuid::new_v4()),
            continuation_token: Some("https://t/delta?token=1".into()),
            ..Default::default()
        };
        state.record(&detail("a"));
        manager.save(&mut state).unwrap();

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.saved_at.is_some());
        assert!(!dir.path().join("nested").join(".cp.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(CheckpointManager::new(path).load().is_err());
    }

    #[test]
    fn test_wire_names() {
        let mut state = CheckpointState::default();
        state.record(&detail("a"));
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("processedResourceIds").is_some());
        assert!(json.get("partialResults").is_some());
        assert!(json.get("continuationToken").is_some());

        let legacy: CheckpointState =
            serde_json::from_str(r#"{"processedResourceIds":["x"],"deltaLink":"d"}"#).unwrap();
        assert_eq!(legacy.continuation_token.as_deref(), Some("d"));
        assert!(legacy.is_processed("x"));
    }

    #[test]
    fn test_record_compacts_and_replaces() {
        let mut state = CheckpointState::default();
        state.record(&detail("a"));
        state.record(&detail("a"));

        assert_eq!(state.partial_results.len(), 1);
        let saved = &state.partial_results["a"];
        assert!(saved.owners.is_empty());
        assert_eq!(saved.owner_count, 1);
    }

    #[test]
    fn test_partials_keyed_by_id_saved_as_sorted_array() {
        let mut state = CheckpointState::default();
        for id in ["c", "a", "b"] {
            state.record(&ResourceDetail::placeholder(resource(id), "boom"));
        }
        state.record(&detail("a"));

        assert_eq!(state.partial_results.len(), 3);
        assert!(!state.partial_results["a"].is_errored());
        assert!(state.is_processed("a"));

        let json = serde_json::to_value(&state).unwrap();
        let ids: Vec<&str> = json["partialResults"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["resource"]["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let back: CheckpointState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_errored_records_are_retried() {
        let mut state = CheckpointState::default();
        state.record(&ResourceDetail::placeholder(resource("a"), "boom"));
        assert!(!state.is_processed("a"));
        assert_eq!(state.partial_results.len(), 1);
    }

    #[test]
    fn test_pending_skips_processed() {
        let mut state = CheckpointState::default();
        state.record(&detail("a"));
        state.record(&detail("b"));

        let pending = state.pending(vec![resource("a"), resource("b"), resource("c"), resource("d")]);
        let ids: Vec<_> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn test_apply_changes() {
        let mut state = CheckpointState::default();
        for id in ["a", "b", "c"] {
            state.record(&detail(id));
        }

        let changes = SiteChanges {
            changed: HashSet::from(["b".to_string()]),
            removed: HashSet::from(["c".to_string()]),
            delta_link: Some("next".into()),
        };
        state.apply_changes(&changes);

        assert!(state.is_processed("a"));
        assert!(!state.is_processed("b"));
        assert!(!state.is_processed("c"));
        assert_eq!(state.partial_results.len(), 2);
        assert_eq!(state.continuation_token.as_deref(), Some("next"));
    }

    #[test]
    fn test_recorder_is_shared() {
        let recorder = CheckpointRecorder::default();
        let clone = recorder.clone();
        clone.record(&detail("a"));
        clone.update(|s| s.continuation_token = Some("t".into()));
        assert_eq!(recorder.processed_count(), 1);
        assert_eq!(recorder.update(|s| s.continuation_token.clone()).as_deref(), Some("t"));
        assert_eq!(recorder.snapshot().partial_results.len(), 1);
    }
}
