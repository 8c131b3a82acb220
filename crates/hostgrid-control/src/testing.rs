//! Shared fixtures for the crate's unit tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use hostgrid_agent::Gateway;
use hostgrid_converge::{ConvergeConfig, Orchestrator, TriggerMode};
use hostgrid_ledger::{
    Cluster, Config, Ledger, Node, NodeStatus, Region, Shard, ShardRole, ShardStatus,
};
use hostgrid_workflow::MemoryExecutor;

use crate::lifecycle::{Lifecycle, LifecycleConfig, NewResource, SettleMode};

pub(crate) struct Fixture {
    pub ledger: Ledger,
    pub executor: MemoryExecutor,
    pub orchestrator: Orchestrator,
    pub gateway: Gateway,
    pub lifecycle: Lifecycle,
}

pub(crate) fn config(value: Value) -> Config {
    serde_json::from_value(value).unwrap()
}

pub(crate) fn new_resource(id: &str, tenant: Option<&str>, shard: Option<&str>, parent: Option<&str>, cfg: Value) -> NewResource {
    NewResource {
        id: id.into(),
        tenant_id: tenant.map(str::to_string),
        shard_id: shard.map(str::to_string),
        parent_id: parent.map(str::to_string),
        config: config(cfg),
    }
}

fn shard(id: &str, role: ShardRole) -> Shard {
    Shard {
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
    }
}

fn node(id: &str, shard_id: &str, role: ShardRole) -> Node {
    Node {
        id: id.into(),
        cluster_id: "eu-1".into(),
        shard_id: Some(shard_id.into()),
        roles: vec![role],
        addresses: vec![],
        status: NodeStatus::Active,
        last_health_at: None,
        created_at: 0,
        updated_at: 0,
    }
}

/// Two web shards and two database shards with one node each. Convergence
/// is deferred and workflow outcomes are settled by hand.
pub(crate) fn fixture() -> Fixture {
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
    for (s, n, role) in [
        ("web-1", "n1", ShardRole::Web),
        ("web-2", "n2", ShardRole::Web),
        ("db-1", "n3", ShardRole::Database),
        ("db-2", "n4", ShardRole::Database),
    ] {
        ledger.create_shard(&shard(s, role)).unwrap();
        ledger.create_node(&node(n, s, role)).unwrap();
    }

    let executor = MemoryExecutor::new();
    let orchestrator = Orchestrator::with_config(
        ledger.clone(),
        Arc::new(executor.clone()),
        ConvergeConfig::default().with_ack_timeout(Duration::from_secs(2)),
        TriggerMode::Deferred,
    );
    let gateway = Gateway::new(ledger.clone(), orchestrator.clone());
    let lifecycle = Lifecycle::new(
        ledger.clone(),
        Arc::new(executor.clone()),
        orchestrator.clone(),
        LifecycleConfig::default()
            .with_settle_timeout(Duration::from_secs(2))
            .with_settle_mode(SettleMode::Manual),
    );
    Fixture {
        ledger,
        executor,
        orchestrator,
        gateway,
        lifecycle,
    }
}

impl Fixture {
    /// Create, settle and converge a tenant on `web-1`.
    pub async fn active_tenant(&self, id: &str) {
        use hostgrid_ledger::{Operation, ResourceKind};
        self.lifecycle
            .create(
                ResourceKind::Tenant,
                new_resource(id, None, Some("web-1"), None, json!({})),
            )
            .await
            .unwrap();
        self.lifecycle
            .settle(ResourceKind::Tenant, id, Operation::Provision)
            .await
            .unwrap();
        self.orchestrator.flush().await;
    }

    /// Create, settle and converge a PHP webroot under `tenant`.
    pub async fn active_webroot(&self, tenant: &str, id: &str) {
        use hostgrid_ledger::{Operation, ResourceKind};
        self.lifecycle
            .create(
                ResourceKind::Webroot,
                new_resource(
                    id,
                    Some(tenant),
                    None,
                    Some(tenant),
                    json!({"runtime": "php", "runtime_version": "8.3"}),
                ),
            )
            .await
            .unwrap();
        self.lifecycle
            .settle(ResourceKind::Webroot, id, Operation::Provision)
            .await
            .unwrap();
        self.orchestrator.flush().await;
    }
}
