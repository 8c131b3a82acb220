//! Ledger: redb-backed persistence for hostgrid.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. Every
//! status transition goes through [`Ledger::compare_and_swap`], which reads,
//! checks and writes inside one write transaction; redb serializes write
//! transactions, so two racing transitions can never both apply.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::resource::{ManagedResource, Placement, ResourceKind, ResourceStatus};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `LedgerError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| LedgerError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Default number of drift events kept per node.
pub const DEFAULT_DRIFT_RETENTION: usize = 1000;

/// Hard cap on the number of records a single list call returns.
pub const MAX_PAGE_SIZE: usize = 500;

fn read_value<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> LedgerResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn read_all<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> LedgerResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn write_value<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> LedgerResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

// ── Query types ───────────────────────────────────────────────────

/// Result of a compare-and-swap transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The mutation was written.
    Applied {
        previous: ManagedResource,
        current: ManagedResource,
    },
    /// The record exists but the expected status or a guard did not hold.
    /// Nothing was written.
    Rejected {
        current: ManagedResource,
        reason: String,
    },
    /// No record with that kind and id.
    Missing,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }

    /// The written record, if the mutation applied.
    pub fn into_current(self) -> Option<ManagedResource> {
        match self {
            CasOutcome::Applied { current, .. } => Some(current),
            _ => None,
        }
    }
}

/// Filters for listing the records of one kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub shard_id: Option<ShardId>,
    #[serde(default)]
    pub status: Option<ResourceStatus>,
    /// Include `deleted` tombstones.
    #[serde(default)]
    pub include_deleted: bool,
    /// Return records with an id strictly greater than this.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One page of an id-ordered listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Per-tenant counts of non-deleted resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TenantSummary {
    pub tenant_id: String,
    /// kind → status → count.
    pub by_kind: BTreeMap<String, BTreeMap<String, u64>>,
    pub total: u64,
    pub pending: u64,
    pub provisioning: u64,
    pub failed: u64,
}

// ── Ledger ────────────────────────────────────────────────────────

/// Thread-safe resource ledger backed by redb.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
    drift_retention: usize,
}

impl Ledger {
    /// Open (or create) a persistent ledger at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let ledger = Self::from_database(db)?;
        debug!(?path, "ledger opened");
        Ok(ledger)
    }

    /// Create an ephemeral in-memory ledger (for testing and standalone mode).
    pub fn open_in_memory() -> LedgerResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let ledger = Self::from_database(db)?;
        debug!("in-memory ledger opened");
        Ok(ledger)
    }

    fn from_database(db: Database) -> LedgerResult<Self> {
        let ledger = Self {
            db: Arc::new(db),
            drift_retention: DEFAULT_DRIFT_RETENTION,
        };
        ledger.ensure_tables()?;
        Ok(ledger)
    }

    /// Override how many drift events are stored per node.
    pub fn with_drift_retention(mut self, retention: usize) -> Self {
        self.drift_retention = retention.max(1);
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [REGIONS, CLUSTERS, SHARDS, NODES, NODE_HEALTH, DRIFT_EVENTS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        for kind in ResourceKind::ALL {
            txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> LedgerResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_value(&table, key)
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> LedgerResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_all(&table)
    }

    // ── Regions ────────────────────────────────────────────────────

    pub fn create_region(&self, region: &Region) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            if table.get(region.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::Conflict(format!("region {}", region.id)));
            }
            write_value(&mut table, &region.id, region)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(region_id = %region.id, "region stored");
        Ok(())
    }

    pub fn get_region(&self, id: &str) -> LedgerResult<Option<Region>> {
        self.get_json(REGIONS, id)
    }

    pub fn list_regions(&self) -> LedgerResult<Vec<Region>> {
        self.list_json(REGIONS)
    }

    /// Delete a region. Fails while any cluster still belongs to it.
    pub fn delete_region(&self, id: &str) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let clusters: Vec<Cluster> =
                read_all(&txn.open_table(CLUSTERS).map_err(map_err!(Table))?)?;
            if let Some(cluster) = clusters.iter().find(|c| c.region_id == id) {
                return Err(LedgerError::Precondition(format!(
                    "region {id} still has cluster {}",
                    cluster.id
                )));
            }
            let mut table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            if table.remove(id).map_err(map_err!(Write))?.is_none() {
                return Err(LedgerError::NotFound(format!("region {id}")));
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(region_id = %id, "region deleted");
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    pub fn create_cluster(&self, cluster: &Cluster) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let regions = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            if read_value::<Region>(&regions, &cluster.region_id)?.is_none() {
                return Err(LedgerError::NotFound(format!("region {}", cluster.region_id)));
            }
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            if table.get(cluster.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::Conflict(format!("cluster {}", cluster.id)));
            }
            write_value(&mut table, &cluster.id, cluster)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %cluster.id, "cluster stored");
        Ok(())
    }

    pub fn get_cluster(&self, id: &str) -> LedgerResult<Option<Cluster>> {
        self.get_json(CLUSTERS, id)
    }

    pub fn list_clusters(&self) -> LedgerResult<Vec<Cluster>> {
        self.list_json(CLUSTERS)
    }

    /// Delete a cluster. Fails while shards or nodes still belong to it.
    pub fn delete_cluster(&self, id: &str) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let shards: Vec<Shard> = read_all(&txn.open_table(SHARDS).map_err(map_err!(Table))?)?;
            if let Some(shard) = shards.iter().find(|s| s.cluster_id == id) {
                return Err(LedgerError::Precondition(format!(
                    "cluster {id} still has shard {}",
                    shard.id
                )));
            }
            let nodes: Vec<Node> = read_all(&txn.open_table(NODES).map_err(map_err!(Table))?)?;
            if let Some(node) = nodes.iter().find(|n| n.cluster_id == id) {
                return Err(LedgerError::Precondition(format!(
                    "cluster {id} still has node {}",
                    node.id
                )));
            }
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            if table.remove(id).map_err(map_err!(Write))?.is_none() {
                return Err(LedgerError::NotFound(format!("cluster {id}")));
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %id, "cluster deleted");
        Ok(())
    }

    // ── Shards ─────────────────────────────────────────────────────

    pub fn create_shard(&self, shard: &Shard) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            if read_value::<Cluster>(&clusters, &shard.cluster_id)?.is_none() {
                return Err(LedgerError::NotFound(format!("cluster {}", shard.cluster_id)));
            }
            let mut table = txn.open_table(SHARDS).map_err(map_err!(Table))?;
            if table.get(shard.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::Conflict(format!("shard {}", shard.id)));
            }
            write_value(&mut table, &shard.id, shard)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(shard_id = %shard.id, role = %shard.role, "shard stored");
        Ok(())
    }

    pub fn get_shard(&self, id: &str) -> LedgerResult<Option<Shard>> {
        self.get_json(SHARDS, id)
    }

    pub fn list_shards(&self) -> LedgerResult<Vec<Shard>> {
        self.list_json(SHARDS)
    }

    /// Record a shard's convergence status.
    pub fn set_shard_status(
        &self,
        id: &str,
        status: ShardStatus,
        message: Option<String>,
    ) -> LedgerResult<Shard> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let shard = {
            let mut table = txn.open_table(SHARDS).map_err(map_err!(Table))?;
            let mut shard: Shard = read_value(&table, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("shard {id}")))?;
            shard.status = status;
            shard.status_message = message;
            shard.updated_at = epoch_secs();
            write_value(&mut table, id, &shard)?;
            shard
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(shard_id = %id, ?status, "shard status updated");
        Ok(shard)
    }

    /// Delete a shard. Fails while nodes or live resources are placed on it.
    pub fn delete_shard(&self, id: &str) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let nodes: Vec<Node> = read_all(&txn.open_table(NODES).map_err(map_err!(Table))?)?;
            if let Some(node) = nodes.iter().find(|n| n.shard_id.as_deref() == Some(id)) {
                return Err(LedgerError::Precondition(format!(
                    "shard {id} still has node {}",
                    node.id
                )));
            }
            for kind in ResourceKind::ALL.into_iter().filter(|k| k.is_shard_placed()) {
                let records: Vec<ManagedResource> =
                    read_all(&txn.open_table(resource_table(kind)).map_err(map_err!(Table))?)?;
                if let Some(r) = records.iter().find(|r| {
                    r.status.is_live()
                        && (r.shard_id.as_deref() == Some(id)
                            || r.migration.as_ref().is_some_and(|m| m.target_shard_id == id))
                }) {
                    return Err(LedgerError::Precondition(format!(
                        "shard {id} still hosts {}",
                        r.reference()
                    )));
                }
            }
            let mut table = txn.open_table(SHARDS).map_err(map_err!(Table))?;
            if table.remove(id).map_err(map_err!(Write))?.is_none() {
                return Err(LedgerError::NotFound(format!("shard {id}")));
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(shard_id = %id, "shard deleted");
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a node. Its shard, if any, must belong to the node's cluster.
    pub fn create_node(&self, node: &Node) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            if read_value::<Cluster>(&clusters, &node.cluster_id)?.is_none() {
                return Err(LedgerError::NotFound(format!("cluster {}", node.cluster_id)));
            }
            if let Some(shard_id) = &node.shard_id {
                let shards = txn.open_table(SHARDS).map_err(map_err!(Table))?;
                let shard: Shard = read_value(&shards, shard_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("shard {shard_id}")))?;
                if shard.cluster_id != node.cluster_id {
                    return Err(LedgerError::Precondition(format!(
                        "shard {shard_id} belongs to cluster {}, not {}",
                        shard.cluster_id, node.cluster_id
                    )));
                }
            }
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            if table.get(node.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::Conflict(format!("node {}", node.id)));
            }
            write_value(&mut table, &node.id, node)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %node.id, "node stored");
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> LedgerResult<Option<Node>> {
        self.get_json(NODES, id)
    }

    pub fn list_nodes(&self) -> LedgerResult<Vec<Node>> {
        self.list_json(NODES)
    }

    /// Nodes assigned to a shard, ordered by id.
    pub fn nodes_for_shard(&self, shard_id: &str) -> LedgerResult<Vec<Node>> {
        let nodes: Vec<Node> = self.list_json(NODES)?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.shard_id.as_deref() == Some(shard_id))
            .collect())
    }

    /// Delete a node together with its health snapshot and drift history.
    pub fn delete_node(&self, id: &str) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            if table.remove(id).map_err(map_err!(Write))?.is_none() {
                return Err(LedgerError::NotFound(format!("node {id}")));
            }
            let mut health = txn.open_table(NODE_HEALTH).map_err(map_err!(Table))?;
            health.remove(id).map_err(map_err!(Write))?;
            let mut drift = txn.open_table(DRIFT_EVENTS).map_err(map_err!(Table))?;
            let (start, end) = drift_range(id);
            let keys: Vec<String> = drift
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            for key in keys {
                drift.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %id, "node deleted");
        Ok(())
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Insert a new resource record. Fails if the id is taken for its kind,
    /// even by a tombstone.
    pub fn insert_resource(&self, resource: &ManagedResource) -> LedgerResult<()> {
        resource.check_scope().map_err(LedgerError::Precondition)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(resource_table(resource.kind))
                .map_err(map_err!(Table))?;
            if table.get(resource.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::Conflict(resource.reference()));
            }
            write_value(&mut table, &resource.id, resource)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(resource = %resource.reference(), status = %resource.status, "resource stored");
        Ok(())
    }

    pub fn get_resource(&self, kind: ResourceKind, id: &str) -> LedgerResult<Option<ManagedResource>> {
        self.get_json(resource_table(kind), id)
    }

    /// Like [`Ledger::get_resource`], but a missing record is an error.
    pub fn require_resource(&self, kind: ResourceKind, id: &str) -> LedgerResult<ManagedResource> {
        self.get_resource(kind, id)?
            .ok_or_else(|| LedgerError::NotFound(format!("{kind}/{id}")))
    }

    /// Remove a record outright. Only used to undo an insert whose
    /// provisioning request was never accepted.
    pub fn remove_resource(&self, kind: ResourceKind, id: &str) -> LedgerResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%kind, %id, existed, "resource removed");
        Ok(existed)
    }

    /// List the records of one kind, ordered by id.
    pub fn query_resources(
        &self,
        kind: ResourceKind,
        query: &ResourceQuery,
    ) -> LedgerResult<Page<ManagedResource>> {
        let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
        let mut items = Vec::new();
        let mut has_more = false;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if let Some(cursor) = &query.cursor
                && key.value() <= cursor.as_str()
            {
                continue;
            }
            let record: ManagedResource =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !query.include_deleted && !record.status.is_live() {
                continue;
            }
            if query.status.is_some_and(|s| s != record.status)
                || query.tenant_id.as_ref().is_some_and(|t| record.tenant_id.as_ref() != Some(t))
                || query.shard_id.as_ref().is_some_and(|s| record.shard_id.as_ref() != Some(s))
            {
                continue;
            }
            if items.len() == limit {
                has_more = true;
                break;
            }
            items.push(record);
        }
        let next_cursor = if has_more {
            items.last().map(|r| r.id.clone())
        } else {
            None
        };
        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    /// Every non-deleted record of every kind matching `filter`.
    pub fn scan_resources(
        &self,
        filter: impl Fn(&ManagedResource) -> bool,
    ) -> LedgerResult<Vec<ManagedResource>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut results = Vec::new();
        for kind in ResourceKind::ALL {
            let table = txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
            let records: Vec<ManagedResource> = read_all(&table)?;
            results.extend(
                records
                    .into_iter()
                    .filter(|r| r.status.is_live() && filter(r)),
            );
        }
        Ok(results)
    }

    /// Non-deleted resources owned by a tenant, excluding the tenant record.
    pub fn tenant_resources(&self, tenant_id: &str) -> LedgerResult<Vec<ManagedResource>> {
        self.scan_resources(|r| r.tenant_id.as_deref() == Some(tenant_id))
    }

    /// Non-deleted resources whose `parent_id` points at this record.
    pub fn children_of(&self, parent: &ManagedResource) -> LedgerResult<Vec<ManagedResource>> {
        self.scan_resources(|r| {
            r.kind.parent_kind() == Some(parent.kind) && r.parent_id.as_deref() == Some(&parent.id)
        })
    }

    /// Non-deleted resources that depend on this record: for a tenant every
    /// resource it owns, otherwise the transitive parent-placed children.
    pub fn dependents_of(&self, resource: &ManagedResource) -> LedgerResult<Vec<ManagedResource>> {
        if resource.kind == ResourceKind::Tenant {
            return self.tenant_resources(&resource.id);
        }
        let mut out = Vec::new();
        let mut frontier = vec![resource.clone()];
        while let Some(parent) = frontier.pop() {
            for child in self.children_of(&parent)? {
                frontier.push(child.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Resources whose status is awaiting a workflow outcome.
    pub fn inflight_resources(&self) -> LedgerResult<Vec<ManagedResource>> {
        self.scan_resources(|r| {
            matches!(
                r.status,
                ResourceStatus::Pending | ResourceStatus::Provisioning | ResourceStatus::Deleting
            )
        })
    }

    /// The shard a resource is served from, following the parent chain for
    /// parent-placed kinds.
    pub fn effective_shard(&self, resource: &ManagedResource) -> LedgerResult<Option<ShardId>> {
        let mut current = resource.clone();
        // Parent chains are at most tenant → webroot → fqdn.
        for _ in 0..4 {
            match current.kind.placement() {
                Placement::Shard(_) => return Ok(current.shard_id.clone()),
                Placement::Unplaced => return Ok(None),
                Placement::Parent => {
                    let (Some(kind), Some(parent_id)) =
                        (current.kind.parent_kind(), current.parent_id.as_deref())
                    else {
                        return Ok(None);
                    };
                    match self.get_resource(kind, parent_id)? {
                        Some(parent) => current = parent,
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Every non-deleted resource served from `shard_id`, in kind order then
    /// id order.
    pub fn resources_on_shard(&self, shard_id: &str) -> LedgerResult<Vec<ManagedResource>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        // Parents precede their children in `ResourceKind::ALL`, so one pass
        // in that order resolves every parent chain.
        let mut placed: BTreeMap<ResourceKind, BTreeSet<String>> = BTreeMap::new();
        let mut results = Vec::new();
        for kind in ResourceKind::ALL {
            let table = txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
            let records: Vec<ManagedResource> = read_all(&table)?;
            for record in records {
                let on_shard = match kind.placement() {
                    Placement::Shard(_) => record.shard_id.as_deref() == Some(shard_id),
                    Placement::Parent => match (kind.parent_kind(), record.parent_id.as_ref()) {
                        (Some(parent_kind), Some(parent_id)) => placed
                            .get(&parent_kind)
                            .is_some_and(|ids| ids.contains(parent_id)),
                        _ => false,
                    },
                    Placement::Unplaced => false,
                };
                if on_shard && record.status.is_live() {
                    placed.entry(kind).or_default().insert(record.id.clone());
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    /// Atomically transition a resource.
    ///
    /// Within one write transaction: read the record, require its status to
    /// be one of `expected`, apply `mutate`, check the result is a legal
    /// transition that keeps the record's identity, and write it. A closure
    /// error or a failed check rejects the swap and writes nothing.
    pub fn compare_and_swap<F>(
        &self,
        kind: ResourceKind,
        id: &str,
        expected: &[ResourceStatus],
        mutate: F,
    ) -> LedgerResult<CasOutcome>
    where
        F: FnOnce(&mut ManagedResource) -> Result<(), String>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(resource_table(kind)).map_err(map_err!(Table))?;
            let Some(current) = read_value::<ManagedResource>(&table, id)? else {
                return Ok(CasOutcome::Missing);
            };
            if !expected.contains(&current.status) {
                let reason = format!("{} is {}", current.reference(), current.status);
                CasOutcome::Rejected { current, reason }
            } else {
                let mut next = current.clone();
                match mutate(&mut next) {
                    Err(reason) => CasOutcome::Rejected { current, reason },
                    Ok(()) if next.id != current.id || next.kind != current.kind => {
                        CasOutcome::Rejected {
                            current,
                            reason: "resource identity cannot change".into(),
                        }
                    }
                    Ok(()) if !current.status.can_transition_to(next.status) => {
                        let reason = format!(
                            "illegal transition {} -> {}",
                            current.status, next.status
                        );
                        CasOutcome::Rejected { current, reason }
                    }
                    Ok(()) => {
                        next.updated_at = epoch_secs().max(current.updated_at);
                        write_value(&mut table, id, &next)?;
                        CasOutcome::Applied {
                            previous: current,
                            current: next,
                        }
                    }
                }
            }
        };
        if outcome.is_applied() {
            txn.commit().map_err(map_err!(Transaction))?;
            if let CasOutcome::Applied { previous, current } = &outcome {
                debug!(
                    resource = %current.reference(),
                    from = %previous.status,
                    to = %current.status,
                    "resource transitioned"
                );
            }
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(outcome)
    }

    /// Put a record back to an earlier snapshot if its status is still one
    /// of `expected`. Bypasses the transition table; used to undo a write
    /// whose workflow was never accepted.
    pub fn restore(
        &self,
        previous: &ManagedResource,
        expected: &[ResourceStatus],
    ) -> LedgerResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let restored = {
            let mut table = txn
                .open_table(resource_table(previous.kind))
                .map_err(map_err!(Table))?;
            match read_value::<ManagedResource>(&table, &previous.id)? {
                Some(current) if expected.contains(&current.status) => {
                    write_value(&mut table, &previous.id, previous)?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(resource = %previous.reference(), restored, "resource restore attempted");
        Ok(restored)
    }

    /// Counts of a tenant's non-deleted resources, the tenant included.
    pub fn tenant_summary(&self, tenant_id: &str) -> LedgerResult<TenantSummary> {
        let tenant = self.require_resource(ResourceKind::Tenant, tenant_id)?;
        let mut records = self.tenant_resources(tenant_id)?;
        if tenant.status.is_live() {
            records.push(tenant);
        }
        let mut summary = TenantSummary {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        };
        for r in &records {
            *summary
                .by_kind
                .entry(r.kind.to_string())
                .or_default()
                .entry(r.status.to_string())
                .or_default() += 1;
            summary.total += 1;
            match r.status {
                ResourceStatus::Pending => summary.pending += 1,
                ResourceStatus::Provisioning => summary.provisioning += 1,
                ResourceStatus::Failed => summary.failed += 1,
                _ => {}
            }
        }
        Ok(summary)
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Overwrite a node's health snapshot and stamp `last_health_at`.
    pub fn put_health(&self, report: &HealthReport) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = read_value(&nodes, &report.node_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("node {}", report.node_id)))?;
            node.last_health_at = Some(report.received_at);
            write_value(&mut nodes, &node.id, &node)?;
            let mut table = txn.open_table(NODE_HEALTH).map_err(map_err!(Table))?;
            write_value(&mut table, &report.node_id, report)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %report.node_id, status = ?report.status, "health report stored");
        Ok(())
    }

    pub fn get_health(&self, node_id: &str) -> LedgerResult<Option<HealthReport>> {
        self.get_json(NODE_HEALTH, node_id)
    }

    // ── Drift ──────────────────────────────────────────────────────

    /// Append drift events for a node. Each event gets a fresh sequence id
    /// and the given `node_id` and `received_at`. The oldest events beyond
    /// the retention bound are discarded.
    pub fn append_drift(
        &self,
        node_id: &str,
        events: Vec<DriftEvent>,
        received_at: u64,
    ) -> LedgerResult<Vec<DriftEvent>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stamped = {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            if read_value::<Node>(&nodes, node_id)?.is_none() {
                return Err(LedgerError::NotFound(format!("node {node_id}")));
            }

            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let mut sequence = counters
                .get(DRIFT_SEQUENCE)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);

            let mut table = txn.open_table(DRIFT_EVENTS).map_err(map_err!(Table))?;
            let mut stamped = Vec::with_capacity(events.len());
            for mut event in events {
                sequence += 1;
                event.id = sequence;
                event.node_id = node_id.to_string();
                event.received_at = received_at;
                write_value(&mut table, &drift_key(node_id, sequence), &event)?;
                stamped.push(event);
            }
            counters
                .insert(DRIFT_SEQUENCE, sequence)
                .map_err(map_err!(Write))?;

            let (start, end) = drift_range(node_id);
            let keys: Vec<String> = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            let excess = keys.len().saturating_sub(self.drift_retention);
            for key in &keys[..excess] {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stamped
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, count = stamped.len(), "drift events stored");
        Ok(stamped)
    }

    /// The most recent drift events of a node, newest first.
    pub fn list_drift(&self, node_id: &str, limit: usize) -> LedgerResult<Vec<DriftEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DRIFT_EVENTS).map_err(map_err!(Table))?;
        let (start, end) = drift_range(node_id);
        let mut events = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            events.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(events)
    }

    /// Number of stored drift events for a node received at or after `since`.
    pub fn count_drift_since(&self, node_id: &str, since: u64) -> LedgerResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DRIFT_EVENTS).map_err(map_err!(Table))?;
        let (start, end) = drift_range(node_id);
        let mut count = 0;
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: DriftEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if event.received_at < since {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ledger() -> Ledger {
        Ledger::open_in_memory().unwrap()
    }

    fn seed_topology(ledger: &Ledger) {
        ledger
            .create_region(&Region {
                id: "eu".into(),
                name: "Europe".into(),
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
        for (id, role) in [("web-1", ShardRole::Web), ("db-1", ShardRole::Database)] {
            ledger
                .create_shard(&Shard {
                    id: id.into(),
                    cluster_id: "eu-1".into(),
                    name: id.into(),
                    role,
                    lb_backend: id.into(),
                    config: Config::new(),
                    status: ShardStatus::Active,
                    status_message: None,
                    created_at: 0,
                    updated_at: 0,
                })
                .unwrap();
        }
        ledger
            .create_node(&Node {
                id: "node-1".into(),
                cluster_id: "eu-1".into(),
                shard_id: Some("web-1".into()),
                roles: vec![ShardRole::Web],
                addresses: vec!["10.0.0.1".into()],
                status: NodeStatus::Active,
                last_health_at: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    fn tenant(id: &str, shard: &str) -> ManagedResource {
        let mut t = ManagedResource::new(id, ResourceKind::Tenant, 0);
        t.shard_id = Some(shard.into());
        t
    }

    fn webroot(id: &str, tenant: &str) -> ManagedResource {
        let mut w = ManagedResource::new(id, ResourceKind::Webroot, 0);
        w.tenant_id = Some(tenant.into());
        w.parent_id = Some(tenant.into());
        w.config.insert("runtime".into(), json!("php"));
        w
    }

    fn fqdn(id: &str, tenant: &str, webroot: &str) -> ManagedResource {
        let mut f = ManagedResource::new(id, ResourceKind::Fqdn, 0);
        f.tenant_id = Some(tenant.into());
        f.parent_id = Some(webroot.into());
        f
    }

    #[test]
    fn topology_deletes_respect_dependents() {
        let l = ledger();
        seed_topology(&l);
        assert!(matches!(l.delete_region("eu"), Err(LedgerError::Precondition(_))));
        assert!(matches!(l.delete_cluster("eu-1"), Err(LedgerError::Precondition(_))));
        assert!(matches!(l.delete_shard("web-1"), Err(LedgerError::Precondition(_))));
        assert!(matches!(l.delete_shard("nope"), Err(LedgerError::NotFound(_))));

        l.delete_node("node-1").unwrap();
        l.delete_shard("web-1").unwrap();
        l.delete_shard("db-1").unwrap();
        l.delete_cluster("eu-1").unwrap();
        l.delete_region("eu").unwrap();
        assert!(l.list_regions().unwrap().is_empty());
    }

    #[test]
    fn node_shard_must_share_cluster() {
        let l = ledger();
        seed_topology(&l);
        l.create_cluster(&Cluster {
            id: "eu-2".into(),
            region_id: "eu".into(),
            name: "eu-2".into(),
            config: Config::new(),
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
        let node = Node {
            id: "node-2".into(),
            cluster_id: "eu-2".into(),
            shard_id: Some("web-1".into()),
            roles: vec![ShardRole::Web],
            addresses: vec![],
            status: NodeStatus::Active,
            last_health_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(matches!(l.create_node(&node), Err(LedgerError::Precondition(_))));
    }

    #[test]
    fn duplicate_resource_is_a_conflict() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();
        let err = l.insert_resource(&tenant("acme", "web-1")).unwrap_err();
        assert_eq!(err, LedgerError::Conflict("tenant/acme".into()));
    }

    #[test]
    fn cas_applies_only_from_expected_status() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();

        let outcome = l
            .compare_and_swap(ResourceKind::Tenant, "acme", &[ResourceStatus::Active], |r| {
                r.status = ResourceStatus::Deleting;
                Ok(())
            })
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Rejected { .. }));
        assert_eq!(
            l.require_resource(ResourceKind::Tenant, "acme").unwrap().status,
            ResourceStatus::Pending
        );

        let outcome = l
            .compare_and_swap(ResourceKind::Tenant, "acme", &[ResourceStatus::Pending], |r| {
                r.status = ResourceStatus::Provisioning;
                Ok(())
            })
            .unwrap();
        let current = outcome.into_current().unwrap();
        assert_eq!(current.status, ResourceStatus::Provisioning);
    }

    #[test]
    fn cas_rejects_illegal_transition_and_closure_errors() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();
        let outcome = l
            .compare_and_swap(ResourceKind::Tenant, "acme", &[ResourceStatus::Pending], |r| {
                r.status = ResourceStatus::Active;
                Ok(())
            })
            .unwrap();
        match outcome {
            CasOutcome::Rejected { reason, .. } => assert!(reason.contains("illegal")),
            other => panic!("expected rejection, got {other:?}"),
        }

        let outcome = l
            .compare_and_swap(ResourceKind::Tenant, "acme", &[ResourceStatus::Pending], |_| {
                Err("migration in flight".into())
            })
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Rejected { .. }));

        let outcome = l
            .compare_and_swap(ResourceKind::Tenant, "ghost", &[ResourceStatus::Pending], |_| Ok(()))
            .unwrap();
        assert_eq!(outcome, CasOutcome::Missing);
    }

    #[test]
    fn restore_only_when_status_still_matches() {
        let l = ledger();
        let original = tenant("acme", "web-1");
        l.insert_resource(&original).unwrap();
        l.compare_and_swap(ResourceKind::Tenant, "acme", &[ResourceStatus::Pending], |r| {
            r.status = ResourceStatus::Provisioning;
            Ok(())
        })
        .unwrap();
        assert!(!l.restore(&original, &[ResourceStatus::Deleting]).unwrap());
        assert!(l.restore(&original, &[ResourceStatus::Provisioning]).unwrap());
        assert_eq!(l.require_resource(ResourceKind::Tenant, "acme").unwrap(), original);
    }

    #[test]
    fn resources_on_shard_follow_parent_chain() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();
        l.insert_resource(&tenant("other", "web-2")).unwrap();
        l.insert_resource(&webroot("site", "acme")).unwrap();
        l.insert_resource(&webroot("blog", "other")).unwrap();
        l.insert_resource(&fqdn("www", "acme", "site")).unwrap();

        let ids: Vec<_> = l
            .resources_on_shard("web-1")
            .unwrap()
            .into_iter()
            .map(|r| r.reference())
            .collect();
        assert_eq!(ids, vec!["tenant/acme", "webroot/site", "fqdn/www"]);

        let www = l.require_resource(ResourceKind::Fqdn, "www").unwrap();
        assert_eq!(l.effective_shard(&www).unwrap().as_deref(), Some("web-1"));
    }

    #[test]
    fn query_paginates_by_id() {
        let l = ledger();
        for id in ["a", "b", "c", "d", "e"] {
            l.insert_resource(&tenant(id, "web-1")).unwrap();
        }
        let first = l
            .query_resources(
                ResourceKind::Tenant,
                &ResourceQuery {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let rest = l
            .query_resources(
                ResourceKind::Tenant,
                &ResourceQuery {
                    cursor: first.next_cursor,
                    limit: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        let ids: Vec<_> = rest.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);
        assert!(!rest.has_more);
    }

    #[test]
    fn dependents_of_webroot_are_transitive() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();
        l.insert_resource(&webroot("site", "acme")).unwrap();
        l.insert_resource(&fqdn("www", "acme", "site")).unwrap();
        let site = l.require_resource(ResourceKind::Webroot, "site").unwrap();
        let deps = l.dependents_of(&site).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, "www");

        let acme = l.require_resource(ResourceKind::Tenant, "acme").unwrap();
        assert_eq!(l.dependents_of(&acme).unwrap().len(), 2);
    }

    #[test]
    fn tenant_summary_counts_by_kind_and_status() {
        let l = ledger();
        l.insert_resource(&tenant("acme", "web-1")).unwrap();
        l.insert_resource(&webroot("site", "acme")).unwrap();
        l.insert_resource(&webroot("blog", "acme")).unwrap();
        let summary = l.tenant_summary("acme").unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.pending, 3);
        assert_eq!(summary.by_kind["webroot"]["pending"], 2);
    }

    #[test]
    fn health_report_updates_node() {
        let l = ledger();
        seed_topology(&l);
        let report = HealthReport {
            node_id: "node-1".into(),
            status: NodeHealthStatus::Healthy,
            checks: BTreeMap::new(),
            reconciliation: None,
            reported_at: 5,
            received_at: 7,
        };
        l.put_health(&report).unwrap();
        assert_eq!(l.get_health("node-1").unwrap(), Some(report.clone()));
        assert_eq!(l.get_node("node-1").unwrap().unwrap().last_health_at, Some(7));

        let mut unknown = report;
        unknown.node_id = "ghost".into();
        assert!(matches!(l.put_health(&unknown), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn drift_is_bounded_and_newest_first() {
        let l = ledger().with_drift_retention(10);
        seed_topology(&l);
        let events: Vec<DriftEvent> = (0..15)
            .map(|i| DriftEvent {
                id: 999,
                node_id: "spoofed".into(),
                kind: "nginx".into(),
                resource: format!("site-{i}"),
                action: "rewrite".into(),
                detail: String::new(),
                observed_at: None,
                received_at: 0,
            })
            .collect();
        let stamped = l.append_drift("node-1", events, 42).unwrap();
        assert!(stamped.iter().all(|e| e.node_id == "node-1" && e.received_at == 42));
        assert_eq!(stamped[0].id, 1);

        let listed = l.list_drift("node-1", 100).unwrap();
        assert_eq!(listed.len(), 10);
        assert_eq!(listed[0].resource, "site-14");
        assert_eq!(listed[9].resource, "site-5");
        assert_eq!(l.count_drift_since("node-1", 42).unwrap(), 10);
        assert_eq!(l.count_drift_since("node-1", 43).unwrap(), 0);
    }

    #[test]
    fn persistent_ledger_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.redb");
        {
            let l = Ledger::open(&path).unwrap();
            l.insert_resource(&tenant("acme", "web-1")).unwrap();
        }
        let l = Ledger::open(&path).unwrap();
        assert!(l.get_resource(ResourceKind::Tenant, "acme").unwrap().is_some());
    }
}
