//! The control plane facade.
//!
//! Wires the ledger, the workflow executor, the orchestrator, the agent
//! gateway, the lifecycle service and the migration coordinator together,
//! and adds the operations that span them: retry routing, tenant-wide
//! retry, synchronous topology administration and workflow lookups.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hostgrid_agent::{AgentConfig, Gateway};
use hostgrid_converge::{ConvergeConfig, ConvergeReport, Orchestrator, TriggerMode};
use hostgrid_ledger::{
    Cluster, Config, Ledger, ManagedResource, Node, NodeStatus, Operation, Region, ResourceKind,
    ResourceStatus, Shard, ShardRole, ShardStatus, TenantSummary, epoch_secs, valid_id,
};
use hostgrid_workflow::{WorkflowExecutor, WorkflowKey, WorkflowStatus};

use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{Lifecycle, LifecycleConfig};
use crate::migration::{MigrateOptions, MigrationConfig, MigrationCoordinator};

/// Everything needed to assemble a [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub lifecycle: LifecycleConfig,
    pub converge: ConvergeConfig,
    pub trigger_mode: TriggerMode,
    pub migration: MigrationConfig,
    pub agent: AgentConfig,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            converge: ConvergeConfig::default(),
            trigger_mode: TriggerMode::Spawn,
            migration: MigrationConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Outcome of retrying every failed resource of a tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryReport {
    pub retried: usize,
    /// `kind/id: reason` for every item whose retry was refused.
    pub errors: Vec<String>,
}

// ── Topology requests ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewRegion {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCluster {
    pub id: String,
    pub region_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewShard {
    pub id: String,
    pub cluster_id: String,
    pub role: ShardRole,
    #[serde(default)]
    pub name: String,
    /// Defaults to the shard id.
    #[serde(default)]
    pub lb_backend: Option<String>,
    #[serde(default)]
    pub config: Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub id: String,
    pub cluster_id: String,
    #[serde(default)]
    pub shard_id: Option<String>,
    /// Defaults to the shard's role when a shard is given.
    #[serde(default)]
    pub roles: Vec<ShardRole>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
}

fn check_id(what: &str, id: &str) -> ControlResult<()> {
    if valid_id(id) {
        Ok(())
    } else {
        Err(ControlError::Validation(format!("invalid {what} id: {id:?}")))
    }
}

fn name_or_id(name: String, id: &str) -> String {
    if name.trim().is_empty() {
        id.to_string()
    } else {
        name
    }
}

/// The assembled control plane. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    ledger: Ledger,
    executor: Arc<dyn WorkflowExecutor>,
    orchestrator: Orchestrator,
    gateway: Gateway,
    lifecycle: Lifecycle,
    migrations: MigrationCoordinator,
}

impl ControlPlane {
    pub fn new(ledger: Ledger, executor: Arc<dyn WorkflowExecutor>, config: PlaneConfig) -> Self {
        let orchestrator = Orchestrator::with_config(
            ledger.clone(),
            executor.clone(),
            config.converge,
            config.trigger_mode,
        );
        let gateway = Gateway::new(ledger.clone(), orchestrator.clone()).with_config(config.agent);
        let settle_mode = config.lifecycle.settle_mode;
        let lifecycle = Lifecycle::new(
            ledger.clone(),
            executor.clone(),
            orchestrator.clone(),
            config.lifecycle,
        );
        let migrations = MigrationCoordinator::new(
            ledger.clone(),
            executor.clone(),
            orchestrator.clone(),
            gateway.clone(),
            config.migration,
            settle_mode,
        );
        Self {
            ledger,
            executor,
            orchestrator,
            gateway,
            lifecycle,
            migrations,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn executor(&self) -> &Arc<dyn WorkflowExecutor> {
        &self.executor
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    // ── Cross-cutting operations ───────────────────────────────────

    /// Retry a failed resource, re-issuing a failed migration to its
    /// recorded target.
    pub async fn retry(&self, kind: ResourceKind, id: &str) -> ControlResult<ManagedResource> {
        let existing = self.ledger.require_resource(kind, id)?;
        if existing.status == ResourceStatus::Failed
            && let Some(Operation::Migrate { target_shard_id }) = &existing.last_operation
        {
            return self
                .migrations
                .migrate(kind, id, target_shard_id, MigrateOptions::default())
                .await;
        }
        self.lifecycle.retry(kind, id).await
    }

    /// Retry every failed resource of a tenant, the tenant included. Items
    /// are retried independently; one refusal does not stop the rest.
    pub async fn retry_failed(&self, tenant_id: &str) -> ControlResult<RetryReport> {
        let tenant = self.ledger.require_resource(ResourceKind::Tenant, tenant_id)?;
        let mut candidates: Vec<ManagedResource> = self
            .ledger
            .tenant_resources(tenant_id)?
            .into_iter()
            .filter(|r| r.status == ResourceStatus::Failed)
            .collect();
        if tenant.status == ResourceStatus::Failed {
            candidates.push(tenant);
        }
        // Parents first, so a retried child finds its parent back in flight.
        candidates.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));

        let mut report = RetryReport::default();
        for r in candidates {
            match self.retry(r.kind, &r.id).await {
                Ok(_) => report.retried += 1,
                Err(e) => {
                    warn!(resource = %r.reference(), error = %e, "retry refused");
                    report.errors.push(format!("{}: {e}", r.reference()));
                }
            }
        }
        info!(%tenant_id, retried = report.retried, refused = report.errors.len(), "tenant retry");
        Ok(report)
    }

    pub fn tenant_summary(&self, tenant_id: &str) -> ControlResult<TenantSummary> {
        Ok(self.ledger.tenant_summary(tenant_id)?)
    }

    /// Converge a shard and wait for the outcome.
    pub async fn converge_shard(&self, shard_id: &str) -> ControlResult<ConvergeReport> {
        Ok(self.orchestrator.converge(shard_id).await?)
    }

    /// Request convergence of an existing shard without waiting.
    pub async fn request_converge(&self, shard_id: &str) -> ControlResult<()> {
        self.require_shard(shard_id)?;
        self.orchestrator.trigger(shard_id).await;
        Ok(())
    }

    /// Status of the latest execution under `key`.
    pub async fn workflow_status(&self, key: &str) -> ControlResult<WorkflowStatus> {
        let key = WorkflowKey::from(key);
        self.executor
            .get_status(&key)
            .await
            .map_err(|e| ControlError::WorkflowStart(e.to_string()))?
            .ok_or_else(|| ControlError::NotFound(format!("workflow {key}")))
    }

    /// One pass of the background sweep: apply finished workflow outcomes
    /// and run deferred convergence.
    pub async fn reconcile(&self) -> ControlResult<usize> {
        let settled = self.lifecycle.reconcile_inflight().await?;
        if self.orchestrator.mode() == TriggerMode::Deferred {
            for (shard_id, outcome) in self.orchestrator.flush().await {
                if let Err(e) = outcome {
                    warn!(%shard_id, error = %e, "deferred convergence failed");
                }
            }
        }
        Ok(settled)
    }

    // ── Topology ───────────────────────────────────────────────────

    pub fn create_region(&self, new: NewRegion) -> ControlResult<Region> {
        check_id("region", &new.id)?;
        let region = Region {
            name: name_or_id(new.name, &new.id),
            id: new.id,
            created_at: epoch_secs(),
        };
        self.ledger.create_region(&region)?;
        info!(region_id = %region.id, "region created");
        Ok(region)
    }

    pub fn get_region(&self, id: &str) -> ControlResult<Region> {
        self.ledger
            .get_region(id)?
            .ok_or_else(|| ControlError::NotFound(format!("region {id}")))
    }

    pub fn list_regions(&self) -> ControlResult<Vec<Region>> {
        Ok(self.ledger.list_regions()?)
    }

    pub fn delete_region(&self, id: &str) -> ControlResult<()> {
        Ok(self.ledger.delete_region(id)?)
    }

    pub fn create_cluster(&self, new: NewCluster) -> ControlResult<Cluster> {
        check_id("cluster", &new.id)?;
        let now = epoch_secs();
        let cluster = Cluster {
            name: name_or_id(new.name, &new.id),
            id: new.id,
            region_id: new.region_id,
            config: new.config,
            created_at: now,
            updated_at: now,
        };
        self.ledger.create_cluster(&cluster)?;
        info!(cluster_id = %cluster.id, region_id = %cluster.region_id, "cluster created");
        Ok(cluster)
    }

    pub fn get_cluster(&self, id: &str) -> ControlResult<Cluster> {
        self.ledger
            .get_cluster(id)?
            .ok_or_else(|| ControlError::NotFound(format!("cluster {id}")))
    }

    pub fn list_clusters(&self) -> ControlResult<Vec<Cluster>> {
        Ok(self.ledger.list_clusters()?)
    }

    pub fn delete_cluster(&self, id: &str) -> ControlResult<()> {
        Ok(self.ledger.delete_cluster(id)?)
    }

    pub fn create_shard(&self, new: NewShard) -> ControlResult<Shard> {
        check_id("shard", &new.id)?;
        let now = epoch_secs();
        let shard = Shard {
            name: name_or_id(new.name, &new.id),
            lb_backend: new.lb_backend.unwrap_or_else(|| new.id.clone()),
            id: new.id,
            cluster_id: new.cluster_id,
            role: new.role,
            config: new.config,
            status: ShardStatus::Active,
            status_message: None,
            created_at: now,
            updated_at: now,
        };
        self.ledger.create_shard(&shard)?;
        info!(shard_id = %shard.id, role = %shard.role, "shard created");
        Ok(shard)
    }

    pub fn get_shard(&self, id: &str) -> ControlResult<Shard> {
        self.require_shard(id)
    }

    pub fn list_shards(&self) -> ControlResult<Vec<Shard>> {
        Ok(self.ledger.list_shards()?)
    }

    pub fn delete_shard(&self, id: &str) -> ControlResult<()> {
        Ok(self.ledger.delete_shard(id)?)
    }

    pub fn create_node(&self, new: NewNode) -> ControlResult<Node> {
        check_id("node", &new.id)?;
        let mut roles = new.roles;
        if roles.is_empty()
            && let Some(shard_id) = &new.shard_id
        {
            roles.push(self.require_shard(shard_id)?.role);
        }
        let now = epoch_secs();
        let node = Node {
            id: new.id,
            cluster_id: new.cluster_id,
            shard_id: new.shard_id,
            roles,
            addresses: new.addresses,
            status: new.status,
            last_health_at: None,
            created_at: now,
            updated_at: now,
        };
        self.ledger.create_node(&node)?;
        info!(node_id = %node.id, shard_id = ?node.shard_id, "node created");
        Ok(node)
    }

    pub fn get_node(&self, id: &str) -> ControlResult<Node> {
        self.ledger
            .get_node(id)?
            .ok_or_else(|| ControlError::NotFound(format!("node {id}")))
    }

    pub fn list_nodes(&self) -> ControlResult<Vec<Node>> {
        Ok(self.ledger.list_nodes()?)
    }

    pub fn delete_node(&self, id: &str) -> ControlResult<()> {
        Ok(self.ledger.delete_node(id)?)
    }

    fn require_shard(&self, id: &str) -> ControlResult<Shard> {
        self.ledger
            .get_shard(id)?
            .ok_or_else(|| ControlError::NotFound(format!("shard {id}")))
    }
}
