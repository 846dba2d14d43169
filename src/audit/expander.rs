//! Detail Expander
//!
//! Turns one [`Resource`] into a [`ResourceDetail`]: quota, linked-group
//! presence, the permission roster with groups expanded to their members,
//! and optionally the largest files and folders. A failing sub-step zeroes
//! or empties its own contribution and is noted on the record; only a
//! permanent rejection of the resource itself fails the whole expansion.

use super::cache::{AuditCache, CacheEntry};
use super::model::{
    DriveItemSummary, GrantTarget, GroupMember, LinkedGroup, PermissionGrant, Principal,
    QuotaMetrics, Resource, ResourceDetail,
};
use crate::error::ApiError;
use crate::graph::pages::{self, PageWalker};
use crate::graph::ApiClient;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpanderOptions {
    /// Largest files/folders to keep per resource; 0 skips the drive walk
    pub largest_items: usize,
}

fn drive_path(site: &str) -> String {
    format!("/sites/{}/drive?$select=id,quota", site)
}

fn permissions_path(site: &str) -> String {
    format!("/sites/{}/drive/root/permissions", site)
}

fn linked_group_path(site: &str) -> String {
    format!("/sites/{}/linkedGroup?$select=id,displayName", site)
}

fn members_path(group: &str) -> String {
    format!(
        "/groups/{}/transitiveMembers?$select=id,displayName,mail,userPrincipalName",
        urlencoding::encode(group)
    )
}

fn drive_items_path(site: &str) -> String {
    format!(
        "/sites/{}/drive/root/delta?$select=id,name,size,folder,file,parentReference,root",
        site
    )
}

/// Expands resources using the shared client and caches
#[derive(Clone)]
pub struct DetailExpander {
    client: ApiClient,
    cache: Arc<AuditCache>,
    options: ExpanderOptions,
}

impl DetailExpander {
    pub fn new(client: ApiClient, cache: Arc<AuditCache>, options: ExpanderOptions) -> Self {
        Self {
            client,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<AuditCache> {
        &self.cache
    }

    /// Build the detail record for one resource
    pub async fn expand(&self, resource: Resource) -> Result<ResourceDetail, ApiError> {
        let site = urlencoding::encode(&resource.id).into_owned();
        let mut detail = ResourceDetail::new(resource);

        // quota, plus the first permissions page when not cached yet
        let mut paths = vec![drive_path(&site)];
        let want_permissions = self.cache.permission_sets.peek(detail.id()).is_none();
        if want_permissions {
            paths.push(permissions_path(&site));
        }
        let mut outcomes = self.client.batch_get(&paths).await.into_iter();
        let quota_outcome = outcomes.next();
        let permissions_first = outcomes.next();

        match quota_outcome {
            Some(Ok(drive)) => {
                detail.drive_id = drive.get("id").and_then(|v| v.as_str()).map(String::from);
                detail.set_quota(QuotaMetrics::from_drive(&drive));
            }
            Some(Err(err)) if err.is_negative() => {
                tracing::debug!("{} has no drive, recording zero quota", detail.id());
            }
            Some(Err(err @ ApiError::Rejected { .. })) => return Err(err),
            Some(Err(err)) => {
                tracing::warn!("Quota lookup failed for {}: {}", detail.id(), err);
                detail.record_failure("quota", err);
            }
            None => detail.record_failure("quota", "missing batch outcome"),
        }

        self.expand_linked_group(&site, &mut detail).await;
        self.expand_permissions(&site, permissions_first, &mut detail).await;

        if self.options.largest_items > 0 && detail.drive_id.is_some() {
            self.expand_largest_items(&site, &mut detail).await;
        }

        Ok(detail)
    }

    async fn expand_linked_group(&self, site: &str, detail: &mut ResourceDetail) {
        let path = linked_group_path(site);
        let lookup = self
            .cache
            .linked_groups
            .get_or_fetch(detail.id(), || async {
                let value = self.client.get_optional(&path).await?;
                Ok::<_, ApiError>(CacheEntry::from(value.as_ref().and_then(LinkedGroup::from_value)))
            })
            .await;

        match lookup {
            Ok(CacheEntry::Present(group)) => {
                detail.has_linked_group = true;
                detail.linked_group = Some(group.display_name);
            }
            Ok(CacheEntry::Absent) => {
                tracing::debug!("{} has no linked group", detail.id());
            }
            Err(err) => {
                tracing::warn!("Linked group probe failed for {}: {}", detail.id(), err);
                detail.record_failure("linked group", err);
            }
        }
    }

    async fn expand_permissions(
        &self,
        site: &str,
        first_page: Option<Result<Value, ApiError>>,
        detail: &mut ResourceDetail,
    ) {
        let path = permissions_path(site);
        let grants = self
            .cache
            .permission_sets
            .get_or_fetch(detail.id(), || async {
                let first = match first_page {
                    Some(Ok(value)) => value,
                    Some(Err(err)) if err.is_negative() => return Ok(CacheEntry::Absent),
                    Some(Err(err)) => return Err(err),
                    None => match self.client.get_optional(&path).await? {
                        Some(value) => value,
                        None => return Ok(CacheEntry::Absent),
                    },
                };
                let set = pages::collect_from_first(&self.client, first).await?;
                let grants: Vec<PermissionGrant> = set.items.iter().map(PermissionGrant::from_value).collect();
                Ok(CacheEntry::Present(grants))
            })
            .await;

        let grants = match grants {
            Ok(entry) => entry.present().unwrap_or_default(),
            Err(err) => {
                tracing::warn!("Permission lookup failed for {}: {}", detail.id(), err);
                detail.record_failure("permissions", err);
                return;
            }
        };

        for grant in grants {
            match grant.target {
                GrantTarget::Principal {
                    display_name,
                    identifier,
                } => detail.add_principal(Principal::new(&display_name, &identifier, &grant.role)),
                GrantTarget::Group { id, display_name } => match self.group_members(&id).await {
                    Ok(members) => {
                        for member in &members {
                            detail.add_principal(member.with_role(&grant.role));
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Expanding group {} failed: {}", display_name, err);
                        detail.record_failure(&format!("group {}", display_name), err);
                    }
                },
                GrantTarget::Unknown => {
                    tracing::debug!("Skipping grant without a grantee on {}", detail.id());
                }
            }
        }
    }

    /// Members of a group, shared across every resource granting to it
    pub async fn group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, ApiError> {
        let path = members_path(group_id);
        let entry = self
            .cache
            .group_members
            .get_or_fetch(group_id, || async {
                match PageWalker::new(&self.client, &path).collect_all().await {
                    Ok(set) => Ok(CacheEntry::Present(
                        set.items.iter().filter_map(GroupMember::from_value).collect(),
                    )),
                    Err(err) if err.is_negative() => Ok(CacheEntry::Absent),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(entry.present().unwrap_or_default())
    }

    async fn expand_largest_items(&self, site: &str, detail: &mut ResourceDetail) {
        let path = drive_items_path(site);
        let set = match PageWalker::new(&self.client, &path).collect_all().await {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!("Drive walk failed for {}: {}", detail.id(), err);
                detail.record_failure("drive items", err);
                return;
            }
        };

        let mut files = Vec::new();
        let mut folders = Vec::new();
        for item in &set.items {
            if item.get("root").is_some() || item.get("@removed").is_some() {
                continue;
            }
            if let Some((summary, is_folder)) = DriveItemSummary::from_value(item) {
                if is_folder {
                    folders.push(summary);
                } else {
                    files.push(summary);
                }
            }
        }

        detail.largest_files = top_by_size(files, self.options.largest_items);
        detail.largest_folders = top_by_size(folders, self.options.largest_items);
    }
}

/// The `n` largest items, ties broken by path
fn top_by_size(mut items: Vec<DriveItemSummary>, n: usize) -> Vec<DriveItemSummary> {
    items.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    items.truncate(n);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, size: u64) -> DriveItemSummary {
        DriveItemSummary {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            size,
        }
    }

    #[test]
    fn test_top_by_size() {
        let items = vec![item("/a", 10), item("/b", 30), item("/c", 20), item("/d", 30)];
        let top = top_by_size(items, 3);
        let paths: Vec<_> = top.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/d", "/c"]);
    }

    #[test]
    fn test_paths_encode_ids() {
        assert_eq!(
            members_path("g 1"),
            "/groups/g%201/transitiveMembers?$select=id,displayName,mail,userPrincipalName"
        );
        assert_eq!(drive_path("site-1"), "/sites/site-1/drive?$select=id,quota");
    }
}
