//! The desired-state document of a shard.
//!
//! A pure function of the ledger: the shard and cluster descriptors, the
//! node roster, and every resource served from the shard whose status is
//! `provisioning` or `active`. Everything else is absent, and absence is
//! what tells node agents to tear configuration down.
//!
//! Nodes are ordered by id and resources by kind then id; configs are
//! ordered maps. The canonical bytes are therefore identical for identical
//! ledger snapshots, and so is the fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hostgrid_ledger::{
    Cluster, Config, Ledger, ManagedResource, Node, NodeStatus, ResourceKind, ResourceStatus,
    Shard, ShardRole,
};

use crate::error::{ConvergeError, ConvergeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub id: String,
    pub name: String,
    pub role: ShardRole,
    pub lb_backend: String,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub id: String,
    pub region_id: String,
    pub name: String,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub roles: Vec<ShardRole>,
    pub addresses: Vec<String>,
    pub status: NodeStatus,
}

/// One resource's configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: ResourceStatus,
    pub config: Config,
}

/// Declarative target configuration of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub shard: ShardDescriptor,
    pub cluster: ClusterDescriptor,
    pub nodes: Vec<NodeDescriptor>,
    pub resources: Vec<ResourceEntry>,
    /// SHA-256 of the document with this field empty.
    pub fingerprint: String,
}

impl DesiredState {
    /// Assemble the document from a ledger snapshot.
    pub fn build(
        shard: &Shard,
        cluster: &Cluster,
        nodes: &[Node],
        resources: &[ManagedResource],
    ) -> Self {
        let mut nodes: Vec<NodeDescriptor> = nodes
            .iter()
            .map(|n| NodeDescriptor {
                id: n.id.clone(),
                roles: n.roles.clone(),
                addresses: n.addresses.clone(),
                status: n.status,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in &mut nodes {
            node.roles.sort();
            node.roles.dedup();
        }

        let mut resources: Vec<ResourceEntry> = resources
            .iter()
            .filter(|r| r.status.is_desired())
            .map(|r| ResourceEntry {
                kind: r.kind,
                id: r.id.clone(),
                tenant_id: r.tenant_id.clone(),
                parent_id: r.parent_id.clone(),
                status: r.status,
                config: r.config.clone(),
            })
            .collect();
        resources.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));

        let mut doc = Self {
            shard: ShardDescriptor {
                id: shard.id.clone(),
                name: shard.name.clone(),
                role: shard.role,
                lb_backend: shard.lb_backend.clone(),
                config: shard.config.clone(),
            },
            cluster: ClusterDescriptor {
                id: cluster.id.clone(),
                region_id: cluster.region_id.clone(),
                name: cluster.name.clone(),
                config: cluster.config.clone(),
            },
            nodes,
            resources,
            fingerprint: String::new(),
        };
        doc.fingerprint = hex::encode(Sha256::digest(doc.canonical_bytes()));
        doc
    }

    /// Compact JSON serialization; stable for a given document.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Plain structs, ordered maps and serde_json values cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Resources currently waiting for promotion.
    pub fn provisioning(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.resources
            .iter()
            .filter(|r| r.status == ResourceStatus::Provisioning)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

/// Read the shard's current snapshot from the ledger and build its document.
pub fn compute_desired_state(ledger: &Ledger, shard_id: &str) -> ConvergeResult<DesiredState> {
    let shard = ledger
        .get_shard(shard_id)?
        .ok_or_else(|| ConvergeError::ShardNotFound(shard_id.to_string()))?;
    let cluster = ledger
        .get_cluster(&shard.cluster_id)?
        .ok_or_else(|| ConvergeError::ClusterNotFound(shard.cluster_id.clone()))?;
    let nodes = ledger.nodes_for_shard(shard_id)?;
    let resources = ledger.resources_on_shard(shard_id)?;
    Ok(DesiredState::build(&shard, &cluster, &nodes, &resources))
}
