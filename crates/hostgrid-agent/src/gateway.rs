//! The protocol surface node agents talk to.
//!
//! Agents pull their desired state, push health snapshots and push drift
//! events. Agents are only weakly trusted: the node id always comes from
//! the request path, and every server-owned field of a submitted payload is
//! overwritten before it is stored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hostgrid_converge::{DesiredState, Orchestrator, compute_desired_state};
use hostgrid_ledger::{
    DriftEvent, HealthReport, Ledger, LedgerError, NodeHealthStatus, epoch_secs,
};

use crate::error::{AgentError, AgentResult};

/// Maximum number of drift events returned by a listing.
pub const DRIFT_LIST_LIMIT: usize = 100;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// A health report older than this does not count towards a verdict.
    pub health_freshness: Duration,
    /// Drift events within `drift_window` that trigger re-convergence;
    /// zero disables the policy.
    pub drift_threshold: usize,
    pub drift_window: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            health_freshness: Duration::from_secs(120),
            drift_threshold: 10,
            drift_window: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    pub fn with_health_freshness(mut self, freshness: Duration) -> Self {
        self.health_freshness = freshness;
        self
    }

    pub fn with_drift_policy(mut self, threshold: usize, window: Duration) -> Self {
        self.drift_threshold = threshold;
        self.drift_window = window;
        self
    }
}

/// The shard document as seen by one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDesiredState {
    pub node_id: String,
    #[serde(flatten)]
    pub document: DesiredState,
}

/// Response to a drift submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftAck {
    pub accepted: usize,
    /// The drift policy requested a re-convergence of the node's shard.
    pub converge_requested: bool,
}

/// A fixed-size window of the most recent drift events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftList {
    pub items: Vec<DriftEvent>,
    pub has_more: bool,
}

/// Health verdict for one node of a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeVerdict {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeHealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<u64>,
    pub healthy: bool,
}

/// Whether a shard is fit to take traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardHealth {
    pub shard_id: String,
    pub healthy: bool,
    pub nodes: Vec<NodeVerdict>,
}

impl ShardHealth {
    /// One-line explanation of an unhealthy verdict.
    pub fn describe(&self) -> String {
        if self.nodes.is_empty() {
            return format!("shard {} has no nodes", self.shard_id);
        }
        let bad: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.healthy)
            .map(|n| match n.status {
                Some(status) => format!("{} ({status:?}, stale or unhealthy)", n.node_id),
                None => format!("{} (no report)", n.node_id),
            })
            .collect();
        if bad.is_empty() {
            format!("shard {} is healthy", self.shard_id)
        } else {
            format!("shard {} unhealthy: {}", self.shard_id, bad.join(", "))
        }
    }
}

/// Node agent gateway.
#[derive(Clone)]
pub struct Gateway {
    ledger: Ledger,
    orchestrator: Orchestrator,
    config: AgentConfig,
}

impl Gateway {
    pub fn new(ledger: Ledger, orchestrator: Orchestrator) -> Self {
        Self {
            ledger,
            orchestrator,
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The node's shard document, filtered to what the node should run.
    ///
    /// A node without the shard's role gets no resources; a resource whose
    /// config pins `node_id` to another node is left out.
    pub fn desired_state(&self, node_id: &str) -> AgentResult<NodeDesiredState> {
        let node = self
            .ledger
            .get_node(node_id)?
            .ok_or_else(|| AgentError::NodeNotFound(node_id.to_string()))?;
        let shard_id = node
            .shard_id
            .clone()
            .ok_or_else(|| AgentError::NodeUnassigned(node_id.to_string()))?;
        let mut document = compute_desired_state(&self.ledger, &shard_id)?;

        if !node.has_role(document.shard.role) {
            document.resources.clear();
        } else {
            document.resources.retain(|r| {
                match r.config.get("node_id").and_then(|v| v.as_str()) {
                    Some(pinned) => pinned == node_id,
                    None => true,
                }
            });
        }
        debug!(
            %node_id,
            %shard_id,
            resources = document.resources.len(),
            "desired state served"
        );
        Ok(NodeDesiredState {
            node_id: node_id.to_string(),
            document,
        })
    }

    /// Overwrite the node's health snapshot.
    pub fn report_health(&self, node_id: &str, mut report: HealthReport) -> AgentResult<HealthReport> {
        report.node_id = node_id.to_string();
        report.received_at = epoch_secs();
        self.ledger.put_health(&report).map_err(|e| match e {
            LedgerError::NotFound(_) => AgentError::NodeNotFound(node_id.to_string()),
            other => other.into(),
        })?;
        if report.status != NodeHealthStatus::Healthy {
            warn!(%node_id, status = ?report.status, "node reported degraded health");
        }
        Ok(report)
    }

    pub fn get_health(&self, node_id: &str) -> AgentResult<HealthReport> {
        self.ledger
            .get_health(node_id)?
            .ok_or_else(|| AgentError::HealthNotFound(node_id.to_string()))
    }

    /// Append drift events and apply the drift policy.
    pub async fn report_drift(&self, node_id: &str, events: Vec<DriftEvent>) -> AgentResult<DriftAck> {
        let node = self
            .ledger
            .get_node(node_id)?
            .ok_or_else(|| AgentError::NodeNotFound(node_id.to_string()))?;
        let now = epoch_secs();
        let stored = self.ledger.append_drift(node_id, events, now)?;
        info!(%node_id, count = stored.len(), "drift events received");

        let mut converge_requested = false;
        if self.config.drift_threshold > 0
            && !stored.is_empty()
            && let Some(shard_id) = &node.shard_id
        {
            let since = now.saturating_sub(self.config.drift_window.as_secs());
            let recent = self.ledger.count_drift_since(node_id, since)?;
            if recent >= self.config.drift_threshold {
                warn!(
                    %node_id,
                    %shard_id,
                    recent,
                    threshold = self.config.drift_threshold,
                    "drift threshold reached, requesting convergence"
                );
                self.orchestrator.trigger(shard_id).await;
                converge_requested = true;
            }
        }
        Ok(DriftAck {
            accepted: stored.len(),
            converge_requested,
        })
    }

    /// The most recent drift events, newest first. Never more than
    /// [`DRIFT_LIST_LIMIT`]; not paginated.
    pub fn list_drift(&self, node_id: &str) -> AgentResult<DriftList> {
        if self.ledger.get_node(node_id)?.is_none() {
            return Err(AgentError::NodeNotFound(node_id.to_string()));
        }
        let items = self.ledger.list_drift(node_id, DRIFT_LIST_LIMIT)?;
        Ok(DriftList {
            items,
            has_more: false,
        })
    }

    /// A shard is healthy when it has nodes and every node has a fresh,
    /// healthy report.
    pub fn shard_health(&self, shard_id: &str) -> AgentResult<ShardHealth> {
        if self.ledger.get_shard(shard_id)?.is_none() {
            return Err(AgentError::ShardNotFound(shard_id.to_string()));
        }
        let now = epoch_secs();
        let freshness = self.config.health_freshness.as_secs();
        let mut nodes = Vec::new();
        for node in self.ledger.nodes_for_shard(shard_id)? {
            let report = self.ledger.get_health(&node.id)?;
            let healthy = report.as_ref().is_some_and(|r| {
                r.status == NodeHealthStatus::Healthy && now.saturating_sub(r.received_at) <= freshness
            });
            nodes.push(NodeVerdict {
                node_id: node.id,
                status: report.as_ref().map(|r| r.status),
                received_at: report.as_ref().map(|r| r.received_at),
                healthy,
            });
        }
        let healthy = !nodes.is_empty() && nodes.iter().all(|n| n.healthy);
        Ok(ShardHealth {
            shard_id: shard_id.to_string(),
            healthy,
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use hostgrid_converge::{ConvergeConfig, TriggerMode};
    use hostgrid_ledger::{
        Cluster, Config, ManagedResource, Node, NodeStatus, Region, ResourceKind, ResourceStatus,
        Shard, ShardRole, ShardStatus,
    };
    use hostgrid_workflow::MemoryExecutor;

    use super::*;

    fn node(id: &str, roles: Vec<ShardRole>) -> Node {
        Node {
            id: id.into(),
            cluster_id: "eu-1".into(),
            shard_id: Some("web-1".into()),
            roles,
            addresses: vec![],
            status: NodeStatus::Active,
            last_health_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn setup() -> (Ledger, Gateway) {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .create_region(&Region {
                id: "eu".into(),
                name: "eu".into(),
                created_at: 0,
            })
            .unwrap();
        ledger
            .create_cluster(&Cluster {
                id: "eu-1".into(),
                region_id: "eu".into(),
                name: "eu-1".into(),
                config: Config::new(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        ledger
            .create_shard(&Shard {
                id: "web-1".into(),
                cluster_id: "eu-1".into(),
                name: "web-1".into(),
                role: ShardRole::Web,
                lb_backend: "web-1".into(),
                config: Config::new(),
                status: ShardStatus::Active,
                status_message: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        ledger.create_node(&node("n1", vec![ShardRole::Web])).unwrap();
        ledger.create_node(&node("n2", vec![ShardRole::Web])).unwrap();
        ledger.create_node(&node("lb", vec![])).unwrap();

        let mut tenant = ManagedResource::new("acme", ResourceKind::Tenant, 0);
        tenant.shard_id = Some("web-1".into());
        tenant.status = ResourceStatus::Active;
        ledger.insert_resource(&tenant).unwrap();
        let mut webroot = ManagedResource::new("site", ResourceKind::Webroot, 0);
        webroot.tenant_id = Some("acme".into());
        webroot.parent_id = Some("acme".into());
        webroot.status = ResourceStatus::Active;
        ledger.insert_resource(&webroot).unwrap();
        let mut daemon = ManagedResource::new("worker", ResourceKind::Daemon, 0);
        daemon.tenant_id = Some("acme".into());
        daemon.parent_id = Some("site".into());
        daemon.status = ResourceStatus::Active;
        daemon.config.insert("node_id".into(), json!("n2"));
        ledger.insert_resource(&daemon).unwrap();

        let orch = Orchestrator::with_config(
            ledger.clone(),
            Arc::new(MemoryExecutor::new()),
            ConvergeConfig::default(),
            TriggerMode::Deferred,
        );
        let gateway = Gateway::new(ledger.clone(), orch);
        (ledger, gateway)
    }

    fn healthy_report() -> HealthReport {
        HealthReport {
            node_id: "spoofed".into(),
            status: NodeHealthStatus::Healthy,
            checks: BTreeMap::new(),
            reconciliation: None,
            reported_at: 1,
            received_at: 0,
        }
    }

    fn drift(resource: &str) -> DriftEvent {
        DriftEvent {
            id: 0,
            node_id: "spoofed".into(),
            kind: "nginx".into(),
            resource: resource.into(),
            action: "rewrite".into(),
            detail: String::new(),
            observed_at: None,
            received_at: 0,
        }
    }

    #[test]
    fn desired_state_is_filtered_per_node() {
        let (_, gw) = setup();
        let ids = |node: &str| -> Vec<String> {
            gw.desired_state(node)
                .unwrap()
                .document
                .resources
                .into_iter()
                .map(|r| r.id)
                .collect()
        };
        assert_eq!(ids("n1"), vec!["acme", "site"]);
        assert_eq!(ids("n2"), vec!["acme", "site", "worker"]);
        assert!(ids("lb").is_empty());
        assert!(matches!(gw.desired_state("ghost"), Err(AgentError::NodeNotFound(_))));
    }

    #[test]
    fn node_documents_share_the_shard_fingerprint() {
        let (_, gw) = setup();
        let a = gw.desired_state("n1").unwrap();
        let b = gw.desired_state("n2").unwrap();
        assert_eq!(a.document.fingerprint, b.document.fingerprint);
    }

    #[test]
    fn health_is_path_stamped_and_overwritten() {
        let (ledger, gw) = setup();
        assert!(matches!(gw.get_health("n1"), Err(AgentError::HealthNotFound(_))));
        gw.report_health("n1", healthy_report()).unwrap();
        let mut degraded = healthy_report();
        degraded.status = NodeHealthStatus::Degraded;
        gw.report_health("n1", degraded).unwrap();

        let stored = gw.get_health("n1").unwrap();
        assert_eq!(stored.node_id, "n1");
        assert_eq!(stored.status, NodeHealthStatus::Degraded);
        assert!(ledger.get_node("n1").unwrap().unwrap().last_health_at.is_some());
        assert!(matches!(
            gw.report_health("ghost", healthy_report()),
            Err(AgentError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn drift_list_caps_at_one_hundred() {
        let (_, gw) = setup();
        let gw = gw.with_config(AgentConfig::default().with_drift_policy(0, Duration::ZERO));
        let events: Vec<DriftEvent> = (0..150).map(|i| drift(&format!("r{i}"))).collect();
        let ack = gw.report_drift("n1", events).await.unwrap();
        assert_eq!(ack.accepted, 150);
        assert!(!ack.converge_requested);

        let list = gw.list_drift("n1").unwrap();
        assert_eq!(list.items.len(), 100);
        assert!(!list.has_more);
        assert_eq!(list.items[0].resource, "r149");
        assert_eq!(list.items[99].resource, "r50");
        assert!(list.items.iter().all(|e| e.node_id == "n1"));
    }

    #[tokio::test]
    async fn drift_threshold_requests_convergence() {
        let (_, gw) = setup();
        let gw = gw.with_config(AgentConfig::default().with_drift_policy(3, Duration::from_secs(60)));
        let ack = gw.report_drift("n1", vec![drift("a"), drift("b")]).await.unwrap();
        assert!(!ack.converge_requested);
        let ack = gw.report_drift("n1", vec![drift("c")]).await.unwrap();
        assert!(ack.converge_requested);
        assert_eq!(gw.orchestrator.pending().await, vec!["web-1"]);
    }

    #[test]
    fn shard_health_requires_every_node_fresh_and_healthy() {
        let (_, gw) = setup();
        let verdict = gw.shard_health("web-1").unwrap();
        assert!(!verdict.healthy);
        assert!(verdict.describe().contains("no report"));

        for id in ["n1", "n2", "lb"] {
            gw.report_health(id, healthy_report()).unwrap();
        }
        assert!(gw.shard_health("web-1").unwrap().healthy);

        let mut sick = healthy_report();
        sick.status = NodeHealthStatus::Unhealthy;
        gw.report_health("n2", sick).unwrap();
        assert!(!gw.shard_health("web-1").unwrap().healthy);
        assert!(matches!(gw.shard_health("nope"), Err(AgentError::ShardNotFound(_))));
    }
}
