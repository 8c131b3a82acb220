//! redb table definitions for the hostgrid ledger.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except the counter table. Managed resources get one table per
//! kind; drift events use the composite key `{node_id}:{sequence}` with a
//! zero-padded sequence so a prefix range scan yields them in arrival order.

use redb::TableDefinition;

use crate::resource::ResourceKind;

/// Regions keyed by `{region_id}`.
pub const REGIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("regions");

/// Clusters keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Shards keyed by `{shard_id}`.
pub const SHARDS: TableDefinition<&str, &[u8]> = TableDefinition::new("shards");

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Latest health report keyed by `{node_id}` (single row per node).
pub const NODE_HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("node_health");

/// Drift events keyed by `{node_id}:{sequence:020}`.
pub const DRIFT_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("drift_events");

/// Monotonic counters keyed by name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Counter name for drift event sequence numbers.
pub const DRIFT_SEQUENCE: &str = "drift_sequence";

/// Table holding the records of one resource kind, keyed by `{resource_id}`.
pub fn resource_table(kind: ResourceKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(kind.table_name())
}

/// Build the drift table key for a node and sequence number.
pub fn drift_key(node_id: &str, sequence: u64) -> String {
    format!("{node_id}:{sequence:020}")
}

/// Half-open key range covering every drift event of a node.
///
/// `;` sorts immediately after `:`, so `[node:, node;)` contains exactly
/// the keys with the `{node_id}:` prefix.
pub fn drift_range(node_id: &str) -> (String, String) {
    (format!("{node_id}:"), format!("{node_id};"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_keys_sort_by_sequence() {
        assert!(drift_key("node-1", 9) < drift_key("node-1", 10));
        assert!(drift_key("node-1", 10) < drift_key("node-1", 100));
    }

    #[test]
    fn drift_range_excludes_longer_node_ids() {
        let (start, end) = drift_range("node-1");
        let other = drift_key("node-10", 1);
        assert!(!(other.as_str() >= start.as_str() && other.as_str() < end.as_str()));
        let own = drift_key("node-1", 1);
        assert!(own.as_str() >= start.as_str() && own.as_str() < end.as_str());
    }
}
