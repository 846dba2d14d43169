//! Tenant rollup
//!
//! Aggregates detail records into the figures a report is built from:
//! storage totals, each resource's share of used storage, the top-N by
//! storage and principal counts. Presentation is left to the consumer.

use super::model::ResourceDetail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One resource's slice of tenant storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceShare {
    pub id: String,
    pub display_name: String,
    pub url: String,
    pub used: u64,
    /// Percent of all used storage in the tenant
    pub share_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSummary {
    pub resource_count: usize,
    pub errored_count: usize,
    pub total_used: u64,
    pub total_allotted: u64,
    pub total_deleted: u64,
    pub used_pct: f64,
    pub linked_group_count: usize,
    pub owner_entries: usize,
    pub member_entries: usize,
    /// External principal entries summed over resources
    pub external_entries: usize,
    /// Distinct external identifiers among fully detailed records
    pub distinct_externals: usize,
    pub top_by_storage: Vec<ResourceShare>,
}

impl TenantSummary {
    pub fn from_details(details: &[ResourceDetail], top_n: usize) -> Self {
        let mut summary = TenantSummary {
            resource_count: details.len(),
            ..Default::default()
        };
        let mut externals = BTreeSet::new();

        for detail in details {
            summary.total_used += detail.quota.used;
            summary.total_allotted += detail.quota.allotted;
            summary.total_deleted += detail.quota.deleted;
            summary.owner_entries += detail.owner_count;
            summary.member_entries += detail.member_count;
            summary.external_entries += detail.external_count;
            if detail.is_errored() {
                summary.errored_count += 1;
            }
            if detail.has_linked_group {
                summary.linked_group_count += 1;
            }
            for principal in &detail.external_principals {
                externals.insert(principal.identifier.to_lowercase());
            }
        }

        summary.distinct_externals = externals.len();
        summary.used_pct = percent(summary.total_used, summary.total_allotted);

        let mut shares: Vec<ResourceShare> = details
            .iter()
            .map(|d| ResourceShare {
                id: d.id().to_string(),
                display_name: d.resource.display_name.clone(),
                url: d.resource.url.clone(),
                used: d.quota.used,
                share_pct: percent(d.quota.used, summary.total_used),
            })
            .collect();
        shares.sort_by(|a, b| b.used.cmp(&a.used).then_with(|| a.id.cmp(&b.id)));
        shares.truncate(top_n);
        summary.top_by_storage = shares;

        summary
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
