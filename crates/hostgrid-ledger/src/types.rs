//! Topology, health and drift types.
//!
//! Regions, clusters, shards and nodes are administrative records managed
//! synchronously; they never pass through the provisioning state machine.
//! Health reports and drift events are produced by node agents.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for a shard.
pub type ShardId = String;

/// Opaque, ordered configuration map.
///
/// `BTreeMap` keeps serialization order independent of insertion order.
pub type Config = BTreeMap<String, serde_json::Value>;

// ── Region / Cluster ──────────────────────────────────────────────

/// A geographic region grouping clusters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub created_at: u64,
}

/// A cluster of shards and nodes inside a region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub region_id: String,
    pub name: String,
    #[serde(default)]
    pub config: Config,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Shard ─────────────────────────────────────────────────────────

/// What a shard hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Web,
    Database,
    Cache,
    Storage,
}

impl ShardRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardRole::Web => "web",
            ShardRole::Database => "database",
            ShardRole::Cache => "cache",
            ShardRole::Storage => "storage",
        }
    }
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(ShardRole::Web),
            "database" => Ok(ShardRole::Database),
            "cache" => Ok(ShardRole::Cache),
            "storage" => Ok(ShardRole::Storage),
            other => Err(format!("unknown shard role: {other}")),
        }
    }
}

/// Convergence status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Active,
    Converging,
    Failed,
}

/// A partition of a cluster; the unit of convergence and migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shard {
    pub id: ShardId,
    pub cluster_id: String,
    pub name: String,
    pub role: ShardRole,
    /// Load-balancer backend label traffic for this shard is routed to.
    pub lb_backend: String,
    #[serde(default)]
    pub config: Config,
    pub status: ShardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Node ──────────────────────────────────────────────────────────

/// Administrative status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Active,
    Maintenance,
    Offline,
}

/// A host machine running a node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<ShardId>,
    pub roles: Vec<ShardRole>,
    /// Network addresses (ip or ip:port), in operator-given order.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Server time of the last accepted health report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// Whether the node carries the given role.
    pub fn has_role(&self, role: ShardRole) -> bool {
        self.roles.contains(&role)
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health verdict reported by a node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A single named check inside a health report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub status: NodeHealthStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Summary of the agent's last local reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReconciliationSummary {
    #[serde(default)]
    pub last_run_at: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub drift_events: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Latest health snapshot of a node. Upsert-only; no history is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// Stamped from the request path; any agent-supplied value is discarded.
    #[serde(default)]
    pub node_id: NodeId,
    pub status: NodeHealthStatus,
    #[serde(default)]
    pub checks: BTreeMap<String, HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationSummary>,
    /// Agent clock at report time.
    #[serde(default)]
    pub reported_at: u64,
    /// Server clock when the report was accepted.
    #[serde(default)]
    pub received_at: u64,
}

// ── Drift ─────────────────────────────────────────────────────────

/// A detected mismatch between desired and actual configuration on a node.
///
/// `id`, `node_id` and `received_at` are assigned server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftEvent {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub node_id: NodeId,
    pub kind: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub detail: String,
    /// Agent clock when the drift was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<u64>,
    #[serde(default)]
    pub received_at: u64,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_role_round_trips_through_str() {
        for role in [ShardRole::Web, ShardRole::Database, ShardRole::Cache, ShardRole::Storage] {
            assert_eq!(role.as_str().parse::<ShardRole>().unwrap(), role);
        }
        assert!("lb".parse::<ShardRole>().is_err());
    }

    #[test]
    fn drift_event_accepts_payload_without_server_fields() {
        let event: DriftEvent = serde_json::from_str(
            r#"{"kind":"nginx","resource":"t1_w1.conf","action":"rewrite"}"#,
        )
        .unwrap();
        assert_eq!(event.id, 0);
        assert!(event.node_id.is_empty());
        assert!(event.detail.is_empty());
    }
}
