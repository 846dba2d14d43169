//! Resource Discovery
//!
//! Several enumeration strategies run independently against the API; each
//! has different coverage and failure modes. Their raw records are merged
//! into one set keyed by resource id, filtered by the personal-storage
//! policy and the exclusion list, and returned sorted by id.

use super::cache::{AuditCache, CacheEntry};
use super::exclusion::ExclusionList;
use super::model::{Resource, ResourceKind};
use crate::error::{ApiError, PipelineError};
use crate::graph::pages::{self, DeltaEntry, PageWalker};
use crate::graph::ApiClient;
use futures::future::join_all;
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

const SITE_FIELDS: &str = "id,displayName,name,webUrl,isPersonalSite";

/// An independent way of enumerating resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Complete listing through the sites delta endpoint
    FullListing,
    /// Search-based listing
    Search,
    /// The tenant's well-known root site
    RootEntry,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::FullListing, Strategy::Search, Strategy::RootEntry];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::FullListing => write!(f, "full-listing"),
            Strategy::Search => write!(f, "search"),
            Strategy::RootEntry => write!(f, "root-entry"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub strategies: Vec<Strategy>,
    pub exclusions: ExclusionList,
    pub include_personal: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            strategies: Strategy::ALL.to_vec(),
            exclusions: ExclusionList::default(),
            include_personal: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub resources: Vec<Resource>,
    /// Delta link from the full listing, for later incremental re-sync
    pub delta_link: Option<String>,
    pub failed: Vec<(Strategy, ApiError)>,
}

/// Raw output of one strategy
struct StrategyOutput {
    records: Vec<Value>,
    delta_link: Option<String>,
}

async fn run_strategy(
    strategy: Strategy,
    client: &ApiClient,
    cache: &AuditCache,
) -> Result<StrategyOutput, ApiError> {
    match strategy {
        Strategy::FullListing => {
            let url = format!("/sites/delta?$select={}", SITE_FIELDS);
            let set = PageWalker::new(client, &url).collect_all().await?;
            Ok(StrategyOutput {
                records: set.items,
                delta_link: set.delta_link,
            })
        }
        Strategy::Search => {
            let url = format!("/sites?search=*&$select={}", SITE_FIELDS);
            let records: Vec<Value> = PageWalker::new(client, &url).into_stream().try_collect().await?;
            Ok(StrategyOutput {
                records,
                delta_link: None,
            })
        }
        Strategy::RootEntry => {
            let url = format!("/sites/root?$select={}", SITE_FIELDS);
            let entry = cache
                .resources
                .get_or_fetch("root", || async {
                    let value = client.get_optional(&url).await?;
                    Ok::<_, ApiError>(CacheEntry::from(value.as_ref().and_then(Resource::from_value)))
                })
                .await?;
            let records = match entry {
                CacheEntry::Present(root) => vec![resource_record(&root)],
                CacheEntry::Absent => Vec::new(),
            };
            Ok(StrategyOutput {
                records,
                delta_link: None,
            })
        }
    }
}

/// Re-encode a decoded resource so every strategy feeds the same merge
fn resource_record(resource: &Resource) -> Value {
    serde_json::json!({
        "id": resource.id,
        "displayName": resource.display_name,
        "webUrl": resource.url,
        "isPersonalSite": resource.kind == ResourceKind::Personal,
    })
}

/// Merge raw records from any number of strategies into one deduplicated,
/// filtered, id-sorted set. Records missing identity fields are dropped.
/// When two strategies disagree on a record, the smaller one in
/// (display name, url, kind) order is kept so the result does not depend
/// on arrival order.
pub fn merge_resources<I>(batches: I, options: &DiscoveryOptions) -> Vec<Resource>
where
    I: IntoIterator<Item = Vec<Value>>,
{
    let mut merged: BTreeMap<String, Resource> = BTreeMap::new();

    for record in batches.into_iter().flatten() {
        let Some(resource) = Resource::from_value(&record) else {
            tracing::debug!("Dropping resource record without identity fields");
            continue;
        };

        let keep_existing = merged
            .get(&resource.id)
            .is_some_and(|existing| sort_key(existing) <= sort_key(&resource));
        if !keep_existing {
            merged.insert(resource.id.clone(), resource);
        }
    }

    merged
        .into_values()
        .filter(|r| options.include_personal || r.kind != ResourceKind::Personal)
        .filter(|r| !options.exclusions.excludes(r))
        .collect()
}

fn sort_key(resource: &Resource) -> (&str, &str, bool) {
    (
        resource.display_name.as_str(),
        resource.url.as_str(),
        resource.kind == ResourceKind::Personal,
    )
}

/// Run every configured strategy and merge the results. A run where every
/// strategy fails, or where nothing survives filtering, is fatal.
pub async fn discover(
    client: &ApiClient,
    cache: &AuditCache,
    options: &DiscoveryOptions,
) -> Result<DiscoveryOutcome, PipelineError> {
    let runs = join_all(
        options
            .strategies
            .iter()
            .map(|&strategy| async move { (strategy, run_strategy(strategy, client, cache).await) }),
    )
    .await;

    let mut outcome = DiscoveryOutcome::default();
    let mut batches = Vec::new();

    for (strategy, result) in runs {
        match result {
            Ok(output) => {
                tracing::info!("Strategy {} returned {} records", strategy, output.records.len());
                if output.delta_link.is_some() {
                    outcome.delta_link = output.delta_link;
                }
                batches.push(output.records);
            }
            Err(err) => {
                tracing::warn!("Strategy {} failed: {}", strategy, err);
                outcome.failed.push((strategy, err));
            }
        }
    }

    if batches.is_empty() {
        let auth = outcome.failed.iter().find(|(_, e)| e.is_auth()).map(|(_, e)| e.clone());
        return Err(match (auth, outcome.failed.pop()) {
            (Some(err), _) => PipelineError::Unauthenticated(err),
            (None, Some((_, err))) => PipelineError::Discovery(err),
            (None, None) => PipelineError::NoResources,
        });
    }

    outcome.resources = merge_resources(batches, options);
    if outcome.resources.is_empty() {
        return Err(PipelineError::NoResources);
    }

    for resource in &outcome.resources {
        cache.resources.insert(&resource.id, CacheEntry::Present(resource.clone()));
    }

    tracing::info!(
        "Discovered {} resources ({} strategies failed)",
        outcome.resources.len(),
        outcome.failed.len()
    );
    Ok(outcome)
}

/// Resources changed or removed since a saved delta link
#[derive(Debug, Default)]
pub struct SiteChanges {
    pub changed: HashSet<String>,
    pub removed: HashSet<String>,
    pub delta_link: Option<String>,
}

/// Walk the sites delta from a saved link
pub async fn changes_since(client: &ApiClient, delta_link: &str) -> Result<SiteChanges, ApiError> {
    let delta = pages::walk_delta(client, delta_link).await?;
    let mut changes = SiteChanges {
        delta_link: delta.delta_link,
        ..Default::default()
    };

    for entry in delta.entries {
        match entry {
            DeltaEntry::Tombstone(id) => {
                changes.changed.remove(&id);
                changes.removed.insert(id);
            }
            DeltaEntry::Upsert(item) => {
                if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                    changes.removed.remove(id);
                    changes.changed.insert(id.to_string());
                }
            }
        }
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, name: &str) -> Value {
        json!({"id": id, "displayName": name, "webUrl": format!("https://t/sites/{}", id)})
    }

    #[test]
    fn test_merge_dedupes_by_id() {
        let full = vec![record("a", "A"), record("b", "B")];
        let search = vec![record("b", "B"), record("c", "C")];
        let merged = merge_resources(vec![full, search], &DiscoveryOptions::default());
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_drops_records_without_identity() {
        let batch = vec![json!({"displayName": "orphan"}), json!({"id": "x"}), record("a", "A")];
        let merged = merge_resources(vec![batch], &DiscoveryOptions::default());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_applies_personal_policy() {
        let batch = vec![
            json!({"id": "p", "webUrl": "https://t-my/personal/bob", "isPersonalSite": true}),
            json!({"id": "u", "webUrl": "https://t-my/personal/ann"}),
            record("s", "Shared"),
        ];
        let merged = merge_resources(vec![batch.clone()], &DiscoveryOptions::default());
        assert_eq!(merged.len(), 1);

        let options = DiscoveryOptions {
            include_personal: true,
            ..Default::default()
        };
        assert_eq!(merge_resources(vec![batch], &options).len(), 3);
    }

    #[test]
    fn test_merge_conflict_is_order_independent() {
        let one = vec![record("a", "Alpha")];
        let two = vec![record("a", "alpha-old")];
        let forward = merge_resources(vec![one.clone(), two.clone()], &DiscoveryOptions::default());
        let reverse = merge_resources(vec![two, one], &DiscoveryOptions::default());
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_merge_applies_exclusions() {
        let options = DiscoveryOptions {
            exclusions: ExclusionList::new(["arch*"]),
            ..Default::default()
        };
        let merged = merge_resources(vec![vec![record("a", "Archive"), record("b", "Board")]], &options);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "b");
    }
}
