//! Audit data model
//!
//! [`Resource`] is the immutable identity produced by discovery;
//! [`ResourceDetail`] is the aggregate the expander builds for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier fragments that mark an account as an external guest
const GUEST_MARKERS: &[&str] = &["#ext#", "urn:spo:guest"];

/// Role keywords that place a principal among the owners
const OWNER_ROLE_KEYWORDS: &[&str] = &["owner", "admin"];

/// Whether a resource is somebody's personal storage or a shared site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    #[default]
    Shared,
    Personal,
}

impl ResourceKind {
    /// The explicit `isPersonalSite` flag decides; the `/personal/` URL
    /// segment is only consulted when the flag is absent.
    pub fn classify(value: &Value, url: &str) -> Self {
        match value.get("isPersonalSite").and_then(|v| v.as_bool()) {
            Some(true) => ResourceKind::Personal,
            Some(false) => ResourceKind::Shared,
            None if url.to_lowercase().contains("/personal/") => ResourceKind::Personal,
            None => ResourceKind::Shared,
        }
    }
}

/// A top-level addressable entity in the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub display_name: String,
    pub url: String,
    #[serde(default)]
    pub kind: ResourceKind,
}

impl Resource {
    /// Decode a site record. Records without an id or URL are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        let id = text("id")?;
        let url = text("webUrl")?;
        let display_name = text("displayName")
            .or_else(|| text("name"))
            .unwrap_or_else(|| url.clone());
        let kind = ResourceKind::classify(value, &url);

        Some(Self {
            id,
            display_name,
            url,
            kind,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrincipalType {
    Internal,
    ExternalGuest,
}

impl PrincipalType {
    pub fn from_identifier(identifier: &str) -> Self {
        let lower = identifier.to_lowercase();
        if GUEST_MARKERS.iter().any(|m| lower.contains(m)) {
            PrincipalType::ExternalGuest
        } else {
            PrincipalType::Internal
        }
    }
}

/// A user holding a role on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub display_name: String,
    pub identifier: String,
    pub principal_type: PrincipalType,
    pub role: String,
}

impl Principal {
    /// The principal type always follows from the identifier
    pub fn new(display_name: &str, identifier: &str, role: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            identifier: identifier.to_string(),
            principal_type: PrincipalType::from_identifier(identifier),
            role: role.to_string(),
        }
    }

    pub fn is_external(&self) -> bool {
        self.principal_type == PrincipalType::ExternalGuest
    }

    pub fn is_owner(&self) -> bool {
        let role = self.role.to_lowercase();
        OWNER_ROLE_KEYWORDS.iter().any(|k| role.contains(k))
    }
}

/// Best identifier a user record offers
fn identifier_of(value: &Value) -> Option<String> {
    ["userPrincipalName", "loginName", "email", "mail", "id"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

const USER_ODATA_TYPE: &str = "#microsoft.graph.user";

/// A user reached through group expansion, before a role is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub display_name: String,
    pub identifier: String,
}

impl GroupMember {
    /// Decode a member record. Nested groups, devices and service
    /// principals are skipped, as are users without any identifier.
    pub fn from_value(value: &Value) -> Option<Self> {
        if let Some(kind) = value.get("@odata.type").and_then(|v| v.as_str()) {
            if !kind.eq_ignore_ascii_case(USER_ODATA_TYPE) {
                return None;
            }
        }
        let identifier = identifier_of(value)?;
        let display_name = value
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or(&identifier)
            .to_string();
        Some(Self {
            display_name,
            identifier,
        })
    }

    /// The member as a principal holding the grant's role
    pub fn with_role(&self, role: &str) -> Principal {
        Principal::new(&self.display_name, &self.identifier, role)
    }
}

/// Group connected to a resource, when it has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedGroup {
    pub id: String,
    pub display_name: String,
}

impl LinkedGroup {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id").and_then(|v| v.as_str())?.to_string();
        let display_name = value
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or(&id)
            .to_string();
        Some(Self { id, display_name })
    }
}

/// Who a permission grant is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantTarget {
    Principal { display_name: String, identifier: String },
    Group { id: String, display_name: String },
    /// Inherited-only or malformed grants
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub role: String,
    pub target: GrantTarget,
}

impl PermissionGrant {
    /// Decode a permission record. The grantee is looked up in
    /// `grantedToV2`, falling back to the legacy `grantedTo`.
    pub fn from_value(value: &Value) -> Self {
        let role = value
            .get("roles")
            .and_then(|v| v.as_array())
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let grantee = value.get("grantedToV2").or_else(|| value.get("grantedTo"));
        let target = grantee.map(GrantTarget::decode).unwrap_or(GrantTarget::Unknown);

        Self { role, target }
    }
}

impl GrantTarget {
    fn decode(grantee: &Value) -> Self {
        if let Some(group) = grantee.get("group") {
            if let Some(id) = group.get("id").and_then(|v| v.as_str()) {
                let display_name = group
                    .get("displayName")
                    .and_then(|v| v.as_str())
                    .unwrap_or(id)
                    .to_string();
                return GrantTarget::Group {
                    id: id.to_string(),
                    display_name,
                };
            }
        }

        for key in ["user", "siteUser"] {
            if let Some(user) = grantee.get(key) {
                if let Some(identifier) = identifier_of(user) {
                    let display_name = user
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&identifier)
                        .to_string();
                    return GrantTarget::Principal {
                        display_name,
                        identifier,
                    };
                }
            }
        }

        GrantTarget::Unknown
    }
}

/// Storage figures in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaMetrics {
    pub used: u64,
    pub allotted: u64,
    pub deleted: u64,
}

impl QuotaMetrics {
    /// Decode the `quota` facet of a drive; missing fields read as zero
    pub fn from_drive(drive: &Value) -> Self {
        let quota = drive.get("quota");
        let field = |key: &str| {
            quota
                .and_then(|q| q.get(key))
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
                .unwrap_or(0)
        };
        Self {
            used: field("used"),
            allotted: field("total"),
            deleted: field("deleted"),
        }
    }

    fn percent_of_allotted(&self, value: u64) -> f64 {
        if self.allotted == 0 {
            0.0
        } else {
            value as f64 / self.allotted as f64 * 100.0
        }
    }

    pub fn used_pct(&self) -> f64 {
        self.percent_of_allotted(self.used)
    }

    pub fn deleted_pct(&self) -> f64 {
        self.percent_of_allotted(self.deleted)
    }

    pub fn free_pct(&self) -> f64 {
        if self.allotted == 0 {
            0.0
        } else {
            (100.0 - self.used_pct()).max(0.0)
        }
    }
}

/// A file or folder ranked by size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItemSummary {
    pub name: String,
    pub path: String,
    pub size: u64,
}

impl DriveItemSummary {
    /// Decode a drive item; returns the summary and whether it is a folder
    pub fn from_value(value: &Value) -> Option<(Self, bool)> {
        let name = value.get("name").and_then(|v| v.as_str())?.to_string();
        let size = value.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
        let parent = value
            .pointer("/parentReference/path")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let path = if parent.is_empty() {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent.trim_end_matches('/'), name)
        };
        let is_folder = value.get("folder").is_some();
        Some((Self { name, path, size }, is_folder))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetailStatus {
    #[default]
    Complete,
    Errored,
}

/// Everything the audit learns about one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDetail {
    pub resource: Resource,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub quota: QuotaMetrics,
    #[serde(default)]
    pub used_pct: f64,
    #[serde(default)]
    pub deleted_pct: f64,
    #[serde(default)]
    pub free_pct: f64,
    #[serde(default)]
    pub has_linked_group: bool,
    #[serde(default)]
    pub linked_group: Option<String>,
    #[serde(default)]
    pub owners: Vec<Principal>,
    #[serde(default)]
    pub members: Vec<Principal>,
    #[serde(default)]
    pub external_principals: Vec<Principal>,
    #[serde(default)]
    pub owner_count: usize,
    #[serde(default)]
    pub member_count: usize,
    #[serde(default)]
    pub external_count: usize,
    #[serde(default)]
    pub largest_files: Vec<DriveItemSummary>,
    #[serde(default)]
    pub largest_folders: Vec<DriveItemSummary>,
    #[serde(default)]
    pub status: DetailStatus,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResourceDetail {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            drive_id: None,
            quota: QuotaMetrics::default(),
            used_pct: 0.0,
            deleted_pct: 0.0,
            free_pct: 0.0,
            has_linked_group: false,
            linked_group: None,
            owners: Vec::new(),
            members: Vec::new(),
            external_principals: Vec::new(),
            owner_count: 0,
            member_count: 0,
            external_count: 0,
            largest_files: Vec::new(),
            largest_folders: Vec::new(),
            status: DetailStatus::Complete,
            errors: Vec::new(),
        }
    }

    /// Zeroed record standing in for a resource that could not be expanded
    pub fn placeholder(resource: Resource, reason: impl Into<String>) -> Self {
        let mut detail = Self::new(resource);
        detail.status = DetailStatus::Errored;
        detail.errors.push(reason.into());
        detail
    }

    pub fn id(&self) -> &str {
        &self.resource.id
    }

    pub fn is_errored(&self) -> bool {
        self.status == DetailStatus::Errored
    }

    /// Record a failed sub-step; the rest of the record stays usable
    pub fn record_failure(&mut self, step: &str, error: impl std::fmt::Display) {
        self.status = DetailStatus::Errored;
        self.errors.push(format!("{}: {}", step, error));
    }

    pub fn set_quota(&mut self, quota: QuotaMetrics) {
        self.quota = quota;
        self.used_pct = quota.used_pct();
        self.deleted_pct = quota.deleted_pct();
        self.free_pct = quota.free_pct();
    }

    /// Place a principal among owners or members. Externals are also
    /// listed in `external_principals`. Repeats of the same identifier and
    /// role are ignored.
    pub fn add_principal(&mut self, principal: Principal) {
        let bucket = if principal.is_owner() {
            &mut self.owners
        } else {
            &mut self.members
        };

        let duplicate = bucket.iter().any(|p| {
            p.identifier.eq_ignore_ascii_case(&principal.identifier)
                && p.role.eq_ignore_ascii_case(&principal.role)
        });
        if duplicate {
            return;
        }

        if principal.is_external() {
            self.external_principals.push(principal.clone());
        }
        bucket.push(principal);
        self.refresh_counts();
    }

    fn refresh_counts(&mut self) {
        self.owner_count = self.owners.len();
        self.member_count = self.members.len();
        self.external_count = self.external_principals.len();
    }

    /// Drop the large collections, keeping their counts
    pub fn compact(mut self) -> Self {
        self.owners = Vec::new();
        self.members = Vec::new();
        self.external_principals = Vec::new();
        self.largest_files = Vec::new();
        self.largest_folders = Vec::new();
        self
    }
}
