//! Cross-shard migration with copy-then-cutover.
//!
//! A resource keeps serving from its source shard for the whole migration.
//! Its `shard_id` only changes in the cutover write, and that write happens
//! after the target has been provisioned, filled and found healthy. Any
//! failure before the cutover leaves the record on the source shard as
//! `failed` with the migration marker cleared, so the same migration can be
//! issued again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use hostgrid_agent::Gateway;
use hostgrid_converge::Orchestrator;
use hostgrid_ledger::{
    Action, CasOutcome, Ledger, ManagedResource, MigrationMarker, MigrationPhase, Operation, Placement,
    ResourceKind, ResourceStatus, epoch_secs, precondition_message, truncate_message,
};
use hostgrid_workflow::{WorkflowExecutor, WorkflowKey, WorkflowStatus};

use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{SettleMode, expect_applied};

/// Kinds a tenant migration may carry along.
const CASCADABLE: [ResourceKind; 2] = [ResourceKind::Zone, ResourceKind::Fqdn];

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Bound on each awaited step (target provisioning, data copy, repoint).
    pub step_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(1800),
        }
    }
}

impl MigrationConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateOptions {
    /// Dependent kinds of a tenant to re-point after the cutover.
    #[serde(default)]
    pub cascade: Vec<ResourceKind>,
}

/// Result of re-pointing cascaded dependents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    pub repointed: Vec<String>,
    pub failed: Vec<String>,
}

/// Result of resuming in-flight migrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResumeReport {
    pub resumed: usize,
    /// `kind/id: reason` for every migration that could not be driven.
    pub errors: Vec<String>,
}

struct Inner {
    ledger: Ledger,
    executor: Arc<dyn WorkflowExecutor>,
    orchestrator: Orchestrator,
    gateway: Gateway,
    config: MigrationConfig,
    mode: SettleMode,
}

/// Drives migrations. Cheap to clone.
#[derive(Clone)]
pub struct MigrationCoordinator {
    inner: Arc<Inner>,
}

fn step_key(step: &str, r: &ManagedResource) -> WorkflowKey {
    WorkflowKey::new(step, r.kind.as_str(), &r.id)
}

impl MigrationCoordinator {
    pub fn new(
        ledger: Ledger,
        executor: Arc<dyn WorkflowExecutor>,
        orchestrator: Orchestrator,
        gateway: Gateway,
        config: MigrationConfig,
        mode: SettleMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                executor,
                orchestrator,
                gateway,
                config,
                mode,
            }),
        }
    }

    /// Accept a migration of `kind/id` to `target_shard_id`.
    ///
    /// Returns once the target provisioning step is accepted, with the record
    /// in `provisioning` and still on its source shard.
    pub async fn migrate(
        &self,
        kind: ResourceKind,
        id: &str,
        target_shard_id: &str,
        options: MigrateOptions,
    ) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let existing = ledger.require_resource(kind, id)?;
        if !kind.is_shard_placed() {
            return Err(ControlError::Validation(format!(
                "{kind} has no shard of its own and cannot be migrated"
            )));
        }
        if !Action::Migrate.permits(existing.status) {
            return Err(ControlError::Precondition(precondition_message(
                Action::Migrate,
                existing.status,
            )));
        }
        if let Some(marker) = &existing.migration {
            return Err(ControlError::Precondition(format!(
                "{} is already migrating to {}",
                existing.reference(),
                marker.target_shard_id
            )));
        }
        let source = existing
            .shard_id
            .clone()
            .ok_or_else(|| ControlError::Validation(format!("{} has no shard", existing.reference())))?;
        if source == target_shard_id {
            return Err(ControlError::Precondition(format!(
                "{} is already on shard {source}",
                existing.reference()
            )));
        }

        let target = ledger
            .get_shard(target_shard_id)?
            .ok_or_else(|| ControlError::NotFound(format!("shard {target_shard_id}")))?;
        let source_shard = ledger
            .get_shard(&source)?
            .ok_or_else(|| ControlError::NotFound(format!("shard {source}")))?;
        if kind.placement() != Placement::Shard(target.role) {
            return Err(ControlError::Validation(format!(
                "{kind} cannot be placed on {} shard {}",
                target.role, target.id
            )));
        }
        if target.cluster_id != source_shard.cluster_id {
            return Err(ControlError::Validation(format!(
                "shard {} is in cluster {}, not {}",
                target.id, target.cluster_id, source_shard.cluster_id
            )));
        }
        if !options.cascade.is_empty() {
            if kind != ResourceKind::Tenant {
                return Err(ControlError::Validation("only tenant migrations cascade".into()));
            }
            if let Some(bad) = options.cascade.iter().find(|k| !CASCADABLE.contains(k)) {
                return Err(ControlError::Validation(format!("{bad} cannot be cascaded")));
            }
        }

        let marker = MigrationMarker {
            source_shard_id: source.clone(),
            target_shard_id: target.id.clone(),
            phase: MigrationPhase::Accepted,
            started_at: epoch_secs(),
        };
        let outcome = ledger.compare_and_swap(kind, id, Action::Migrate.allowed_from(), |r| {
            if r.is_migrating() {
                return Err(format!("{} is already migrating", r.reference()));
            }
            if r.shard_id.as_deref() != Some(source.as_str()) {
                return Err(format!("{} moved off shard {source}", r.reference()));
            }
            r.status = ResourceStatus::Provisioning;
            r.status_message = None;
            r.migration = Some(marker);
            r.last_operation = Some(Operation::Migrate {
                target_shard_id: target.id.clone(),
            });
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Migrate, kind, id)?;

        let key = step_key("migrate_provision", &current);
        let input = json!({
            "resource": current,
            "source_shard_id": source,
            "target_shard_id": target.id,
        });
        if let Err(e) = self.inner.executor.start_or_signal(&key, input).await {
            ledger.restore(&previous, &[ResourceStatus::Provisioning])?;
            warn!(%key, error = %e, "migration refused by workflow engine");
            return Err(ControlError::WorkflowStart(e.to_string()));
        }
        info!(
            resource = %current.reference(),
            from = %source,
            to = %target.id,
            "migration accepted"
        );

        if self.inner.mode == SettleMode::Background {
            let this = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = this.drive(kind, &id, &options).await {
                    error!(%kind, %id, error = %e, "migration driver stopped");
                }
            });
        }
        Ok(current)
    }

    /// Run an accepted migration to completion or failure and return the
    /// resulting record. A failed step is recorded on the resource, not
    /// returned as an error.
    pub async fn drive(
        &self,
        kind: ResourceKind,
        id: &str,
        options: &MigrateOptions,
    ) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let record = ledger.require_resource(kind, id)?;
        let Some(marker) = record.migration.clone() else {
            return Err(ControlError::Precondition(format!(
                "{} has no migration in flight",
                record.reference()
            )));
        };
        let (source, target) = (marker.source_shard_id, marker.target_shard_id);

        self.set_phase(kind, id, MigrationPhase::ProvisioningTarget)?;
        if let Err(message) = self.await_step(&step_key("migrate_provision", &record)).await {
            return self.fail(kind, id, &format!("target provisioning failed: {message}"));
        }

        self.set_phase(kind, id, MigrationPhase::CopyingData)?;
        let copy = step_key("migrate_copy", &record);
        let input = json!({
            "resource": record,
            "source_shard_id": source,
            "target_shard_id": target,
        });
        if let Err(message) = self.run_step(&copy, input).await {
            return self.fail(kind, id, &format!("data copy failed: {message}"));
        }

        self.set_phase(kind, id, MigrationPhase::VerifyingTarget)?;
        match self.inner.gateway.shard_health(&target) {
            Ok(health) if health.healthy => {}
            Ok(health) => {
                return self.fail(kind, id, &format!("target not healthy: {}", health.describe()));
            }
            Err(e) => return self.fail(kind, id, &format!("target health unknown: {e}")),
        }

        let outcome = ledger.compare_and_swap(kind, id, &[ResourceStatus::Provisioning], |r| {
            match &r.migration {
                Some(m) if m.target_shard_id == target => {}
                _ => return Err("migration marker changed".into()),
            }
            r.shard_id = Some(target.clone());
            r.status = ResourceStatus::Active;
            r.status_message = None;
            r.migration = None;
            Ok(())
        })?;
        let Some(current) = outcome.into_current() else {
            return Err(ControlError::Precondition(format!(
                "{kind}/{id} changed during migration; cutover skipped"
            )));
        };
        info!(resource = %current.reference(), from = %source, to = %target, "migration cut over");

        self.inner.orchestrator.trigger(&source).await;
        self.inner.orchestrator.trigger(&target).await;

        if !options.cascade.is_empty() {
            let report = self.repoint_dependents(&current, &target, &options.cascade).await?;
            info!(
                resource = %current.reference(),
                repointed = report.repointed.len(),
                failed = report.failed.len(),
                "cascaded dependents re-pointed"
            );
        }
        Ok(current)
    }

    /// Resume every migration left in flight, for example after a restart.
    /// Cascades are not resumed. A migration that cannot be driven is
    /// reported and the rest still run.
    pub async fn resume_inflight(&self) -> ControlResult<ResumeReport> {
        let pending = self.inner.ledger.scan_resources(|r| r.is_migrating())?;
        let mut report = ResumeReport::default();
        for record in pending {
            info!(resource = %record.reference(), "resuming migration");
            match self
                .drive(record.kind, &record.id, &MigrateOptions::default())
                .await
            {
                Ok(_) => report.resumed += 1,
                Err(e) => {
                    warn!(resource = %record.reference(), error = %e, "migration resume failed");
                    report.errors.push(format!("{}: {e}", record.reference()));
                }
            }
        }
        Ok(report)
    }

    async fn repoint_dependents(
        &self,
        tenant: &ManagedResource,
        target: &str,
        kinds: &[ResourceKind],
    ) -> ControlResult<CascadeReport> {
        let ledger = &self.inner.ledger;
        let mut report = CascadeReport::default();
        let dependents = ledger.scan_resources(|r| {
            r.tenant_id.as_deref() == Some(tenant.id.as_str())
                && kinds.contains(&r.kind)
                && r.status == ResourceStatus::Active
        })?;
        for dep in dependents {
            let key = step_key("migrate_repoint", &dep);
            let input = json!({ "resource": dep, "target_shard_id": target });
            match self.run_step(&key, input).await {
                Ok(()) => report.repointed.push(dep.reference()),
                Err(message) => {
                    let message = truncate_message(&format!("repoint to {target} failed: {message}"));
                    ledger.compare_and_swap(dep.kind, &dep.id, &[ResourceStatus::Active], |r| {
                        r.status = ResourceStatus::Failed;
                        r.status_message = Some(message);
                        Ok(())
                    })?;
                    warn!(resource = %dep.reference(), "dependent repoint failed");
                    report.failed.push(dep.reference());
                }
            }
        }
        Ok(report)
    }

    async fn run_step(&self, key: &WorkflowKey, input: Value) -> Result<(), String> {
        self.inner
            .executor
            .start_or_signal(key, input)
            .await
            .map_err(|e| e.to_string())?;
        self.await_step(key).await
    }

    async fn await_step(&self, key: &WorkflowKey) -> Result<(), String> {
        match self
            .inner
            .executor
            .await_completion(key, self.inner.config.step_timeout)
            .await
        {
            Ok(WorkflowStatus::Completed { .. }) => {
                debug!(%key, "migration step completed");
                Ok(())
            }
            Ok(WorkflowStatus::Failed { error }) => Err(error),
            Ok(WorkflowStatus::Running) => Err("step still running".into()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn set_phase(&self, kind: ResourceKind, id: &str, phase: MigrationPhase) -> ControlResult<()> {
        let outcome = self
            .inner
            .ledger
            .compare_and_swap(kind, id, &[ResourceStatus::Provisioning], |r| match &mut r.migration {
                Some(marker) => {
                    marker.phase = phase;
                    Ok(())
                }
                None => Err("no migration in flight".into()),
            })?;
        match outcome.into_current() {
            Some(_) => {
                debug!(%kind, %id, ?phase, "migration phase");
                Ok(())
            }
            None => Err(ControlError::Precondition(format!(
                "{kind}/{id} is no longer migrating"
            ))),
        }
    }

    /// Abandon the migration: the record stays on its source shard, `failed`.
    fn fail(&self, kind: ResourceKind, id: &str, message: &str) -> ControlResult<ManagedResource> {
        let message = truncate_message(message);
        let outcome = self
            .inner
            .ledger
            .compare_and_swap(kind, id, &[ResourceStatus::Provisioning], |r| {
                if r.migration.is_none() {
                    return Err("no migration in flight".into());
                }
                r.status = ResourceStatus::Failed;
                r.status_message = Some(message.clone());
                r.migration = None;
                Ok(())
            })?;
        warn!(%kind, %id, %message, "migration failed");
        match outcome {
            CasOutcome::Applied { current, .. } => Ok(current),
            CasOutcome::Rejected { current, .. } => Ok(current),
            CasOutcome::Missing => {
                Err(ControlError::NotFound(format!("{kind}/{id}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use hostgrid_ledger::{HealthReport, NodeHealthStatus};

    use super::*;
    use crate::testing::{Fixture, fixture, new_resource};

    fn coordinator(f: &Fixture) -> MigrationCoordinator {
        MigrationCoordinator::new(
            f.ledger.clone(),
            Arc::new(f.executor.clone()),
            f.orchestrator.clone(),
            f.gateway.clone(),
            MigrationConfig::default().with_step_timeout(Duration::from_secs(2)),
            SettleMode::Manual,
        )
    }

    fn healthy(f: &Fixture, node: &str) {
        f.gateway
            .report_health(
                node,
                HealthReport {
                    node_id: String::new(),
                    status: NodeHealthStatus::Healthy,
                    checks: BTreeMap::new(),
                    reconciliation: None,
                    reported_at: 0,
                    received_at: 0,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn copy_then_cutover() {
        let f = fixture();
        f.active_tenant("acme").await;
        f.active_webroot("acme", "site").await;
        healthy(&f, "n2");
        let m = coordinator(&f);

        let accepted = m
            .migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(accepted.status, ResourceStatus::Provisioning);
        assert_eq!(accepted.shard_id.as_deref(), Some("web-1"));
        assert_eq!(
            accepted.migration.as_ref().map(|m| m.phase),
            Some(MigrationPhase::Accepted)
        );
        // Still served from the source while migrating.
        let source_doc = f.orchestrator.desired_state("web-1").unwrap();
        assert!(source_doc.resources.iter().any(|r| r.id == "acme"));

        let done = m
            .drive(ResourceKind::Tenant, "acme", &MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(done.status, ResourceStatus::Active);
        assert_eq!(done.shard_id.as_deref(), Some("web-2"));
        assert!(done.migration.is_none());
        assert_eq!(f.orchestrator.pending().await, vec!["web-1", "web-2"]);

        f.orchestrator.flush().await;
        let target_doc = f.orchestrator.desired_state("web-2").unwrap();
        let ids: Vec<_> = target_doc.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["acme", "site"]);
        assert!(f.orchestrator.desired_state("web-1").unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn failed_copy_keeps_the_source_and_allows_reissue() {
        let f = fixture();
        f.active_tenant("acme").await;
        healthy(&f, "n2");
        f.executor.fail_matching("migrate_copy-", "rsync exited 23").await;
        let m = coordinator(&f);

        m.migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        let failed = m
            .drive(ResourceKind::Tenant, "acme", &MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(failed.status, ResourceStatus::Failed);
        assert_eq!(failed.shard_id.as_deref(), Some("web-1"));
        assert!(failed.migration.is_none());
        assert!(failed.status_message.as_deref().unwrap().contains("rsync exited 23"));
        assert_eq!(
            f.ledger.require_resource(ResourceKind::Tenant, "acme").unwrap().shard_id.as_deref(),
            Some("web-1")
        );

        f.executor.clear_failures().await;
        let again = m
            .migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(again.status, ResourceStatus::Provisioning);
        let done = m
            .drive(ResourceKind::Tenant, "acme", &MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(done.shard_id.as_deref(), Some("web-2"));
    }

    #[tokio::test]
    async fn unhealthy_target_aborts_before_cutover() {
        let f = fixture();
        f.active_tenant("acme").await;
        let m = coordinator(&f);
        m.migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        let failed = m
            .drive(ResourceKind::Tenant, "acme", &MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(failed.status, ResourceStatus::Failed);
        assert_eq!(failed.shard_id.as_deref(), Some("web-1"));
        assert!(failed.status_message.unwrap().contains("n2 (no report)"));
    }

    #[tokio::test]
    async fn rejected_migrations_change_nothing() {
        let f = fixture();
        f.active_tenant("acme").await;
        f.active_webroot("acme", "site").await;
        let m = coordinator(&f);

        let same = m
            .migrate(ResourceKind::Tenant, "acme", "web-1", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(same, ControlError::Precondition(_)));
        let wrong_role = m
            .migrate(ResourceKind::Tenant, "acme", "db-1", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(wrong_role, ControlError::Validation(_)));
        let unplaced = m
            .migrate(ResourceKind::Webroot, "site", "web-2", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(unplaced, ControlError::Validation(_)));
        let missing = m
            .migrate(ResourceKind::Tenant, "acme", "web-9", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, ControlError::NotFound(_)));
        let bad_cascade = m
            .migrate(
                ResourceKind::Tenant,
                "acme",
                "web-2",
                MigrateOptions {
                    cascade: vec![ResourceKind::Webroot],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(bad_cascade, ControlError::Validation(_)));
        assert_eq!(f.executor.started_count("migrate_").await, 0);

        m.migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        let twice = m
            .migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(twice, ControlError::Precondition(_)));
        assert_eq!(f.executor.started_count("migrate_provision-").await, 1);
    }

    #[tokio::test]
    async fn refused_start_restores_the_record() {
        let f = fixture();
        f.active_tenant("acme").await;
        let before = f.ledger.require_resource(ResourceKind::Tenant, "acme").unwrap();
        f.executor.set_unavailable(Some("engine down")).await;
        let m = coordinator(&f);
        let err = m
            .migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::WorkflowStart(_)));
        assert_eq!(f.ledger.require_resource(ResourceKind::Tenant, "acme").unwrap(), before);
    }

    #[tokio::test]
    async fn cascade_failures_stay_with_the_dependent() {
        let f = fixture();
        f.active_tenant("acme").await;
        healthy(&f, "n2");
        for (id, name) in [("good", "good.example"), ("bad", "bad.example")] {
            f.lifecycle
                .create(
                    ResourceKind::Zone,
                    new_resource(id, Some("acme"), None, None, json!({ "name": name })),
                )
                .await
                .unwrap();
            f.lifecycle
                .settle(ResourceKind::Zone, id, Operation::Provision)
                .await
                .unwrap();
        }
        f.executor.fail_matching("migrate_repoint-zone-bad", "dns api 500").await;
        let m = coordinator(&f);
        let options = MigrateOptions {
            cascade: vec![ResourceKind::Zone],
        };

        m.migrate(ResourceKind::Tenant, "acme", "web-2", options.clone())
            .await
            .unwrap();
        let tenant = m.drive(ResourceKind::Tenant, "acme", &options).await.unwrap();
        assert_eq!(tenant.status, ResourceStatus::Active);
        assert_eq!(tenant.shard_id.as_deref(), Some("web-2"));

        let good = f.ledger.require_resource(ResourceKind::Zone, "good").unwrap();
        let bad = f.ledger.require_resource(ResourceKind::Zone, "bad").unwrap();
        assert_eq!(good.status, ResourceStatus::Active);
        assert_eq!(bad.status, ResourceStatus::Failed);
        assert!(bad.status_message.unwrap().contains("dns api 500"));
    }

    #[tokio::test]
    async fn resume_drives_leftover_migrations() {
        let f = fixture();
        f.active_tenant("acme").await;
        healthy(&f, "n2");
        let m = coordinator(&f);
        m.migrate(ResourceKind::Tenant, "acme", "web-2", MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(m.resume_inflight().await.unwrap().resumed, 1);
        let tenant = f.ledger.require_resource(ResourceKind::Tenant, "acme").unwrap();
        assert_eq!(tenant.shard_id.as_deref(), Some("web-2"));
        assert_eq!(m.resume_inflight().await.unwrap(), ResumeReport::default());
    }

    #[tokio::test]
    async fn resume_continues_past_a_stuck_migration() {
        let f = fixture();
        f.active_tenant("acme").await;
        f.active_tenant("beta").await;
        healthy(&f, "n2");
        let m = coordinator(&f);
        for id in ["acme", "beta"] {
            m.migrate(ResourceKind::Tenant, id, "web-2", MigrateOptions::default())
                .await
                .unwrap();
        }
        // Knocked out of provisioning with its marker still set.
        f.ledger
            .compare_and_swap(ResourceKind::Tenant, "beta", &[ResourceStatus::Provisioning], |r| {
                r.status = ResourceStatus::Failed;
                Ok(())
            })
            .unwrap();

        let report = m.resume_inflight().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("tenant/beta: "));
        let acme = f.ledger.require_resource(ResourceKind::Tenant, "acme").unwrap();
        assert_eq!(acme.status, ResourceStatus::Active);
        assert_eq!(acme.shard_id.as_deref(), Some("web-2"));
    }
}
