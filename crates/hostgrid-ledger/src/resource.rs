//! Managed resources: every lifecycle-tracked unit a tenant owns.
//!
//! All kinds share one record shape (`ManagedResource`); what differs per
//! kind is its placement (how it maps onto a shard), its parent kind, and
//! the typed payload validated by [`crate::kinds`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Config, ShardId, ShardRole};

/// Unique identifier of a resource within its kind.
pub type ResourceId = String;

// ── Kind ──────────────────────────────────────────────────────────

/// Resource kinds tracked by the ledger.
///
/// Declaration order is the canonical ordering used in desired-state
/// documents: tenants first, then what hangs off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tenant,
    Webroot,
    Fqdn,
    SshKey,
    EgressRule,
    CronJob,
    Daemon,
    Database,
    DatabaseUser,
    CacheInstance,
    S3Bucket,
    Zone,
    Backup,
}

/// How a kind maps onto the shard topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Carries its own `shard_id`, which must point at a shard of this role.
    Shard(ShardRole),
    /// Lives wherever its parent lives.
    Parent,
    /// Not hosted on any shard.
    Unplaced,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::Tenant,
        ResourceKind::Webroot,
        ResourceKind::Fqdn,
        ResourceKind::SshKey,
        ResourceKind::EgressRule,
        ResourceKind::CronJob,
        ResourceKind::Daemon,
        ResourceKind::Database,
        ResourceKind::DatabaseUser,
        ResourceKind::CacheInstance,
        ResourceKind::S3Bucket,
        ResourceKind::Zone,
        ResourceKind::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tenant => "tenant",
            ResourceKind::Webroot => "webroot",
            ResourceKind::Fqdn => "fqdn",
            ResourceKind::SshKey => "ssh_key",
            ResourceKind::EgressRule => "egress_rule",
            ResourceKind::CronJob => "cron_job",
            ResourceKind::Daemon => "daemon",
            ResourceKind::Database => "database",
            ResourceKind::DatabaseUser => "database_user",
            ResourceKind::CacheInstance => "cache_instance",
            ResourceKind::S3Bucket => "s3_bucket",
            ResourceKind::Zone => "zone",
            ResourceKind::Backup => "backup",
        }
    }

    /// Name of the redb table holding this kind's records.
    pub fn table_name(&self) -> &'static str {
        match self {
            ResourceKind::Tenant => "resources_tenant",
            ResourceKind::Webroot => "resources_webroot",
            ResourceKind::Fqdn => "resources_fqdn",
            ResourceKind::SshKey => "resources_ssh_key",
            ResourceKind::EgressRule => "resources_egress_rule",
            ResourceKind::CronJob => "resources_cron_job",
            ResourceKind::Daemon => "resources_daemon",
            ResourceKind::Database => "resources_database",
            ResourceKind::DatabaseUser => "resources_database_user",
            ResourceKind::CacheInstance => "resources_cache_instance",
            ResourceKind::S3Bucket => "resources_s3_bucket",
            ResourceKind::Zone => "resources_zone",
            ResourceKind::Backup => "resources_backup",
        }
    }

    pub fn placement(&self) -> Placement {
        match self {
            ResourceKind::Tenant => Placement::Shard(ShardRole::Web),
            ResourceKind::Database => Placement::Shard(ShardRole::Database),
            ResourceKind::CacheInstance => Placement::Shard(ShardRole::Cache),
            ResourceKind::S3Bucket => Placement::Shard(ShardRole::Storage),
            ResourceKind::Webroot
            | ResourceKind::Fqdn
            | ResourceKind::SshKey
            | ResourceKind::EgressRule
            | ResourceKind::CronJob
            | ResourceKind::Daemon
            | ResourceKind::DatabaseUser => Placement::Parent,
            ResourceKind::Zone | ResourceKind::Backup => Placement::Unplaced,
        }
    }

    /// Kind of the record `parent_id` refers to, for parent-placed kinds.
    pub fn parent_kind(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Webroot | ResourceKind::SshKey | ResourceKind::EgressRule => {
                Some(ResourceKind::Tenant)
            }
            ResourceKind::Fqdn | ResourceKind::CronJob | ResourceKind::Daemon => {
                Some(ResourceKind::Webroot)
            }
            ResourceKind::DatabaseUser => Some(ResourceKind::Database),
            _ => None,
        }
    }

    /// Every kind except the tenant itself belongs to a tenant.
    pub fn is_tenant_scoped(&self) -> bool {
        *self != ResourceKind::Tenant
    }

    pub fn is_shard_placed(&self) -> bool {
        matches!(self.placement(), Placement::Shard(_))
    }

    /// Kinds whose records can be toggled with enable/disable.
    pub fn supports_enable(&self) -> bool {
        matches!(self, ResourceKind::CronJob | ResourceKind::Daemon)
    }

    /// Kinds directly placed on a shard of the given role.
    pub fn placed_on(role: ShardRole) -> impl Iterator<Item = ResourceKind> {
        Self::ALL
            .into_iter()
            .filter(move |k| k.placement() == Placement::Shard(role))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Lifecycle status of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Provisioning,
    Active,
    Suspended,
    Failed,
    Deleting,
    /// Tombstone left after a successful de-provisioning workflow.
    Deleted,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Provisioning => "provisioning",
            ResourceStatus::Active => "active",
            ResourceStatus::Suspended => "suspended",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Deleted => "deleted",
        }
    }

    /// Whether a resource in this status belongs in its shard's desired state.
    pub fn is_desired(&self) -> bool {
        matches!(self, ResourceStatus::Provisioning | ResourceStatus::Active)
    }

    /// Everything but the tombstone.
    pub fn is_live(&self) -> bool {
        *self != ResourceStatus::Deleted
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResourceStatus::Pending),
            "provisioning" => Ok(ResourceStatus::Provisioning),
            "active" => Ok(ResourceStatus::Active),
            "suspended" => Ok(ResourceStatus::Suspended),
            "failed" => Ok(ResourceStatus::Failed),
            "deleting" => Ok(ResourceStatus::Deleting),
            "deleted" => Ok(ResourceStatus::Deleted),
            other => Err(format!("unknown resource status: {other}")),
        }
    }
}

// ── Operations ────────────────────────────────────────────────────

/// The last remote operation issued for a resource; what `Retry` re-issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Provision,
    Update,
    Deprovision,
    Suspend,
    Unsuspend,
    Migrate { target_shard_id: ShardId },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Provision => "provision",
            Operation::Update => "update",
            Operation::Deprovision => "deprovision",
            Operation::Suspend => "suspend",
            Operation::Unsuspend => "unsuspend",
            Operation::Migrate { .. } => "migrate",
        }
    }
}

/// Phase of an in-flight migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Accepted,
    ProvisioningTarget,
    CopyingData,
    VerifyingTarget,
}

/// Marker persisted on a resource while a migration is in flight.
///
/// Its presence is what enforces "at most one migration per resource".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMarker {
    pub source_shard_id: ShardId,
    pub target_shard_id: ShardId,
    pub phase: MigrationPhase,
    pub started_at: u64,
}

// ── Record ────────────────────────────────────────────────────────

/// A lifecycle-tracked resource record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Present iff the kind is tenant-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<ResourceId>,
    /// Present iff the kind is shard-placed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<ShardId>,
    /// Present iff the kind is parent-placed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_reason: Option<String>,
    /// Ancestor whose suspension cascaded onto this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_by: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationMarker>,
    #[serde(default)]
    pub config: Config,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ManagedResource {
    /// Build a fresh `pending` record.
    pub fn new(id: impl Into<ResourceId>, kind: ResourceKind, now: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            tenant_id: None,
            shard_id: None,
            parent_id: None,
            status: ResourceStatus::Pending,
            status_message: None,
            suspend_reason: None,
            suspended_by: None,
            last_operation: None,
            migration: None,
            config: Config::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `kind/id`, used in logs and error messages.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }

    /// Whether a migration is currently in flight.
    pub fn is_migrating(&self) -> bool {
        self.migration.is_some()
    }

    /// Check that the populated scope fields match what the kind requires.
    pub fn check_scope(&self) -> Result<(), String> {
        match (self.kind.is_tenant_scoped(), &self.tenant_id) {
            (true, None) => return Err(format!("{} requires tenant_id", self.kind)),
            (false, Some(_)) => return Err(format!("{} must not carry tenant_id", self.kind)),
            _ => {}
        }
        match (self.kind.is_shard_placed(), &self.shard_id) {
            (true, None) => return Err(format!("{} requires shard_id", self.kind)),
            (false, Some(_)) => return Err(format!("{} must not carry shard_id", self.kind)),
            _ => {}
        }
        match (self.kind.parent_kind(), &self.parent_id) {
            (Some(parent), None) => Err(format!("{} requires a parent {parent}", self.kind)),
            (None, Some(_)) => Err(format!("{} must not carry parent_id", self.kind)),
            _ => Ok(()),
        }
    }
}
