//! Resource lifecycle operations.
//!
//! Each mutating operation follows the same shape: check preconditions,
//! apply a compare-and-swap write to the ledger, hand a keyed request to the
//! workflow engine, and return as soon as the request is accepted. If the
//! engine refuses the request the ledger write is undone. The outcome of the
//! workflow is applied later by [`Lifecycle::settle`] (or by the periodic
//! [`Lifecycle::reconcile_inflight`] sweep).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use hostgrid_converge::Orchestrator;
use hostgrid_ledger::{
    Action, CasOutcome, Config, Ledger, LedgerResult, ManagedResource, Operation, Page, Placement,
    ResourceKind, ResourceQuery, ResourceStatus, epoch_secs, precondition_message,
    truncate_message, valid_id, validate_config,
};
use hostgrid_workflow::{ExecutorError, WorkflowExecutor, WorkflowKey, WorkflowStatus};

use crate::error::{ControlError, ControlResult};

/// When workflow outcomes are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// Spawn a task per accepted operation that awaits and applies the outcome.
    Background,
    /// Leave settlement to explicit `settle` / `reconcile_inflight` calls.
    Manual,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a settle task waits for a workflow before leaving it to the
    /// reconcile sweep.
    pub settle_timeout: Duration,
    pub settle_mode: SettleMode,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_timeout: Duration::from_secs(600),
            settle_mode: SettleMode::Background,
        }
    }
}

impl LifecycleConfig {
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn with_settle_mode(mut self, mode: SettleMode) -> Self {
        self.settle_mode = mode;
        self
    }
}

/// A create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewResource {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub shard_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub config: Config,
}

/// The workflow key an operation on a resource runs under.
pub fn workflow_key(op: &Operation, kind: ResourceKind, id: &str) -> WorkflowKey {
    WorkflowKey::new(op.name(), kind.as_str(), id)
}

/// Turn a CAS outcome into the written pair or a control error.
pub(crate) fn expect_applied(
    outcome: CasOutcome,
    action: Action,
    kind: ResourceKind,
    id: &str,
) -> ControlResult<(ManagedResource, ManagedResource)> {
    match outcome {
        CasOutcome::Applied { previous, current } => Ok((previous, current)),
        CasOutcome::Rejected { current, reason } => {
            if action.permits(current.status) {
                Err(ControlError::Precondition(reason))
            } else {
                Err(ControlError::Precondition(precondition_message(
                    action,
                    current.status,
                )))
            }
        }
        CasOutcome::Missing => Err(ControlError::NotFound(format!("{kind}/{id}"))),
    }
}

fn not_migrating(r: &ManagedResource) -> Result<(), String> {
    if r.is_migrating() {
        return Err(format!("{} has a migration in flight", r.reference()));
    }
    Ok(())
}

/// Move one active dependent of a suspended parent to `suspended`.
fn suspend_child(
    ledger: &Ledger,
    parent: &ManagedResource,
    child: &ManagedResource,
) -> LedgerResult<CasOutcome> {
    ledger.compare_and_swap(child.kind, &child.id, &[ResourceStatus::Active], |r| {
        not_migrating(r)?;
        r.status = ResourceStatus::Suspended;
        r.suspend_reason = parent.suspend_reason.clone();
        r.suspended_by = Some(parent.id.clone());
        Ok(())
    })
}

struct Inner {
    ledger: Ledger,
    executor: Arc<dyn WorkflowExecutor>,
    orchestrator: Orchestrator,
    config: LifecycleConfig,
}

/// Lifecycle service. Cheap to clone.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(
        ledger: Ledger,
        executor: Arc<dyn WorkflowExecutor>,
        orchestrator: Orchestrator,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                executor,
                orchestrator,
                config,
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, kind: ResourceKind, id: &str) -> ControlResult<ManagedResource> {
        Ok(self.inner.ledger.require_resource(kind, id)?)
    }

    pub fn list(&self, kind: ResourceKind, query: &ResourceQuery) -> ControlResult<Page<ManagedResource>> {
        Ok(self.inner.ledger.query_resources(kind, query)?)
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Validate and persist a new `pending` resource, then request its
    /// provisioning. Validation failures write nothing.
    pub async fn create(&self, kind: ResourceKind, new: NewResource) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        if !valid_id(&new.id) {
            return Err(ControlError::Validation(format!("invalid id: {:?}", new.id)));
        }

        match (kind.is_tenant_scoped(), &new.tenant_id) {
            (true, None) => {
                return Err(ControlError::Validation(format!("{kind} requires tenant_id")));
            }
            (false, Some(_)) => {
                return Err(ControlError::Validation(format!("{kind} does not take tenant_id")));
            }
            (true, Some(tenant_id)) => {
                let tenant = ledger
                    .get_resource(ResourceKind::Tenant, tenant_id)?
                    .ok_or_else(|| ControlError::NotFound(format!("tenant/{tenant_id}")))?;
                if matches!(tenant.status, ResourceStatus::Deleting | ResourceStatus::Deleted) {
                    return Err(ControlError::Precondition(format!(
                        "tenant {tenant_id} is {}",
                        tenant.status
                    )));
                }
            }
            (false, None) => {}
        }

        match (kind.placement(), &new.shard_id) {
            (Placement::Shard(role), Some(shard_id)) => {
                let shard = ledger
                    .get_shard(shard_id)?
                    .ok_or_else(|| ControlError::NotFound(format!("shard {shard_id}")))?;
                if shard.role != role {
                    return Err(ControlError::Validation(format!(
                        "{kind} needs a {role} shard, {shard_id} is {}",
                        shard.role
                    )));
                }
            }
            (Placement::Shard(_), None) => {
                return Err(ControlError::Validation(format!("{kind} requires shard_id")));
            }
            (_, Some(_)) => {
                return Err(ControlError::Validation(format!("{kind} does not take shard_id")));
            }
            (_, None) => {}
        }

        let parent = match (kind.parent_kind(), &new.parent_id) {
            (Some(parent_kind), Some(parent_id)) => {
                let parent = ledger
                    .get_resource(parent_kind, parent_id)?
                    .ok_or_else(|| ControlError::NotFound(format!("{parent_kind}/{parent_id}")))?;
                let owner = match parent.kind {
                    ResourceKind::Tenant => Some(&parent.id),
                    _ => parent.tenant_id.as_ref(),
                };
                if owner != new.tenant_id.as_ref() {
                    return Err(ControlError::Validation(format!(
                        "{} does not belong to the given tenant",
                        parent.reference()
                    )));
                }
                if matches!(parent.status, ResourceStatus::Deleting | ResourceStatus::Deleted) {
                    return Err(ControlError::Precondition(format!(
                        "{} is {}",
                        parent.reference(),
                        parent.status
                    )));
                }
                Some(parent)
            }
            (Some(parent_kind), None) => {
                return Err(ControlError::Validation(format!("{kind} requires a parent {parent_kind}")));
            }
            (None, Some(_)) => {
                return Err(ControlError::Validation(format!("{kind} does not take parent_id")));
            }
            (None, None) => None,
        };

        let config =
            validate_config(kind, &new.config, parent.as_ref()).map_err(ControlError::Validation)?;

        let mut record = ManagedResource::new(new.id, kind, epoch_secs());
        record.tenant_id = new.tenant_id;
        record.shard_id = new.shard_id;
        record.parent_id = new.parent_id;
        record.config = config;
        record.last_operation = Some(Operation::Provision);
        ledger.insert_resource(&record)?;

        if let Err(e) = self.start(&Operation::Provision, &record, json!({})).await {
            ledger.remove_resource(kind, &record.id)?;
            return Err(e);
        }
        info!(resource = %record.reference(), "resource accepted for provisioning");
        self.schedule_settle(kind, &record.id, Operation::Provision);
        Ok(record)
    }

    // ── Update ─────────────────────────────────────────────────────

    /// Merge `patch` into the resource's config. A `null` value removes a
    /// key. Status is left as it is. On a `failed` record the new config is
    /// picked up by the next retry.
    pub async fn update(&self, kind: ResourceKind, id: &str, patch: Config) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let existing = ledger.require_resource(kind, id)?;
        if !Action::Update.permits(existing.status) {
            return Err(ControlError::Precondition(precondition_message(
                Action::Update,
                existing.status,
            )));
        }
        not_migrating(&existing).map_err(ControlError::Precondition)?;

        let mut merged = existing.config.clone();
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }
        let parent = self.parent_of(&existing)?;
        let config = validate_config(kind, &merged, parent.as_ref()).map_err(ControlError::Validation)?;

        let outcome = ledger.compare_and_swap(kind, id, Action::Update.allowed_from(), |r| {
            not_migrating(r)?;
            r.config = config;
            // A failed record keeps the operation that a retry re-issues.
            if r.status != ResourceStatus::Failed {
                r.last_operation = Some(Operation::Update);
            }
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Update, kind, id)?;

        if let Err(e) = self.start(&Operation::Update, &current, json!({})).await {
            ledger.restore(&previous, &[current.status])?;
            return Err(e);
        }
        info!(resource = %current.reference(), "resource update accepted");

        if current.status == ResourceStatus::Active
            && let Some(shard_id) = ledger.effective_shard(&current)?
        {
            self.inner.orchestrator.trigger(&shard_id).await;
        }
        self.schedule_settle(kind, id, Operation::Update);
        Ok(current)
    }

    /// Flip the `enabled` flag of a cron job or daemon.
    pub async fn set_enabled(&self, kind: ResourceKind, id: &str, enabled: bool) -> ControlResult<ManagedResource> {
        if !kind.supports_enable() {
            return Err(ControlError::Validation(format!("{kind} cannot be enabled or disabled")));
        }
        let mut patch = Config::new();
        patch.insert("enabled".into(), Value::Bool(enabled));
        self.update(kind, id, patch).await
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Request de-provisioning. The record stays addressable as `deleting`
    /// until the workflow completes.
    pub async fn delete(&self, kind: ResourceKind, id: &str) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let existing = ledger.require_resource(kind, id)?;
        if !Action::Delete.permits(existing.status) {
            return Err(ControlError::Precondition(precondition_message(
                Action::Delete,
                existing.status,
            )));
        }
        let dependents = ledger.dependents_of(&existing)?;
        if let Some(child) = dependents.first() {
            return Err(ControlError::Precondition(format!(
                "{} still has {} dependent resources (e.g. {})",
                existing.reference(),
                dependents.len(),
                child.reference()
            )));
        }

        let outcome = ledger.compare_and_swap(kind, id, Action::Delete.allowed_from(), |r| {
            not_migrating(r)?;
            r.status = ResourceStatus::Deleting;
            r.status_message = None;
            r.last_operation = Some(Operation::Deprovision);
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Delete, kind, id)?;
        self.start_deprovision(previous, current).await
    }

    async fn start_deprovision(
        &self,
        previous: ManagedResource,
        current: ManagedResource,
    ) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        if let Err(e) = self.start(&Operation::Deprovision, &current, json!({})).await {
            ledger.restore(&previous, &[ResourceStatus::Deleting])?;
            return Err(e);
        }
        info!(resource = %current.reference(), "resource accepted for deletion");
        if let Some(shard_id) = ledger.effective_shard(&current)? {
            self.inner.orchestrator.trigger(&shard_id).await;
        }
        self.schedule_settle(current.kind, &current.id, Operation::Deprovision);
        Ok(current)
    }

    // ── Suspend / Unsuspend ────────────────────────────────────────

    /// Suspend an active resource and every active dependent.
    ///
    /// Each dependent is moved by its own compare-and-swap and tagged with
    /// `suspended_by`; one suspend workflow is issued for the whole group.
    pub async fn suspend(&self, kind: ResourceKind, id: &str, reason: &str) -> ControlResult<ManagedResource> {
        self.suspend_with(kind, id, reason, suspend_child).await
    }

    async fn suspend_with<F>(
        &self,
        kind: ResourceKind,
        id: &str,
        reason: &str,
        mut cascade: F,
    ) -> ControlResult<ManagedResource>
    where
        F: FnMut(&Ledger, &ManagedResource, &ManagedResource) -> LedgerResult<CasOutcome>,
    {
        let ledger = &self.inner.ledger;
        let reason = reason.trim().to_string();
        let outcome = ledger.compare_and_swap(kind, id, Action::Suspend.allowed_from(), |r| {
            not_migrating(r)?;
            r.status = ResourceStatus::Suspended;
            r.suspend_reason = (!reason.is_empty()).then(|| reason.clone());
            r.suspended_by = None;
            r.last_operation = Some(Operation::Suspend);
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Suspend, kind, id)?;

        let mut cascaded = Vec::new();
        let walked = ledger.dependents_of(&current).and_then(|children| {
            for child in children {
                if child.status != ResourceStatus::Active {
                    continue;
                }
                if let CasOutcome::Applied { previous, current } = cascade(ledger, &current, &child)? {
                    cascaded.push((previous, current));
                }
            }
            Ok(())
        });
        if let Err(e) = walked {
            warn!(resource = %current.reference(), error = %e, "suspend cascade failed; reverting");
            self.revert_suspend(&previous, &cascaded)?;
            return Err(e.into());
        }

        let refs: Vec<String> = cascaded.iter().map(|(_, c)| c.reference()).collect();
        let input = json!({ "reason": current.suspend_reason, "cascaded": refs });
        if let Err(e) = self.start(&Operation::Suspend, &current, input).await {
            self.revert_suspend(&previous, &cascaded)?;
            return Err(e);
        }
        info!(
            resource = %current.reference(),
            cascaded = cascaded.len(),
            "resource suspended"
        );

        let touched: Vec<&ManagedResource> =
            std::iter::once(&current).chain(cascaded.iter().map(|(_, c)| c)).collect();
        self.converge_affected(&touched).await?;
        self.schedule_settle(kind, id, Operation::Suspend);
        Ok(current)
    }

    fn revert_suspend(
        &self,
        parent: &ManagedResource,
        cascaded: &[(ManagedResource, ManagedResource)],
    ) -> ControlResult<()> {
        let ledger = &self.inner.ledger;
        for (prev, _) in cascaded {
            ledger.restore(prev, &[ResourceStatus::Suspended])?;
        }
        ledger.restore(parent, &[ResourceStatus::Suspended])?;
        Ok(())
    }

    /// Reactivate a suspended resource and the dependents its suspension
    /// cascaded onto. Dependents suspended for another reason stay suspended.
    pub async fn unsuspend(&self, kind: ResourceKind, id: &str) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let outcome = ledger.compare_and_swap(kind, id, Action::Unsuspend.allowed_from(), |r| {
            not_migrating(r)?;
            r.status = ResourceStatus::Active;
            r.suspend_reason = None;
            r.suspended_by = None;
            r.last_operation = Some(Operation::Unsuspend);
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Unsuspend, kind, id)?;

        let mut restored = Vec::new();
        for child in ledger.dependents_of(&current)? {
            if child.status != ResourceStatus::Suspended
                || child.suspended_by.as_deref() != Some(current.id.as_str())
            {
                continue;
            }
            let parent_id = current.id.clone();
            let outcome =
                ledger.compare_and_swap(child.kind, &child.id, &[ResourceStatus::Suspended], |r| {
                    if r.suspended_by.as_deref() != Some(parent_id.as_str()) {
                        return Err("suspended by another resource".into());
                    }
                    r.status = ResourceStatus::Active;
                    r.suspend_reason = None;
                    r.suspended_by = None;
                    Ok(())
                })?;
            if let CasOutcome::Applied { previous, current } = outcome {
                restored.push((previous, current));
            }
        }

        let refs: Vec<String> = restored.iter().map(|(_, c)| c.reference()).collect();
        if let Err(e) = self
            .start(&Operation::Unsuspend, &current, json!({ "cascaded": refs }))
            .await
        {
            for (prev, _) in &restored {
                ledger.restore(prev, &[ResourceStatus::Active])?;
            }
            ledger.restore(&previous, &[ResourceStatus::Active])?;
            return Err(e);
        }
        info!(
            resource = %current.reference(),
            restored = restored.len(),
            "resource unsuspended"
        );

        let touched: Vec<&ManagedResource> =
            std::iter::once(&current).chain(restored.iter().map(|(_, c)| c)).collect();
        self.converge_affected(&touched).await?;
        self.schedule_settle(kind, id, Operation::Unsuspend);
        Ok(current)
    }

    // ── Retry ──────────────────────────────────────────────────────

    /// Re-issue the operation that left a resource `failed`.
    ///
    /// The same workflow key is reused, so a still-running execution is
    /// joined rather than forked. Retried migrations are routed by the
    /// control plane, not here.
    pub async fn retry(&self, kind: ResourceKind, id: &str) -> ControlResult<ManagedResource> {
        let ledger = &self.inner.ledger;
        let existing = ledger.require_resource(kind, id)?;
        if !Action::Retry.permits(existing.status) {
            return Err(ControlError::Precondition(precondition_message(
                Action::Retry,
                existing.status,
            )));
        }
        let op = existing.last_operation.clone().unwrap_or(Operation::Provision);
        if matches!(op, Operation::Migrate { .. }) {
            return Err(ControlError::Precondition(format!(
                "{} failed during migration; retry it through the control plane",
                existing.reference()
            )));
        }

        let next_status = match op {
            Operation::Deprovision => ResourceStatus::Deleting,
            Operation::Suspend => ResourceStatus::Suspended,
            _ => ResourceStatus::Provisioning,
        };
        let outcome = ledger.compare_and_swap(kind, id, Action::Retry.allowed_from(), |r| {
            not_migrating(r)?;
            r.status = next_status;
            r.status_message = None;
            Ok(())
        })?;
        let (previous, current) = expect_applied(outcome, Action::Retry, kind, id)?;

        if op == Operation::Deprovision {
            return self.start_deprovision(previous, current).await;
        }
        if let Err(e) = self.start(&op, &current, json!({ "retry": true })).await {
            ledger.restore(&previous, &[next_status])?;
            return Err(e);
        }
        info!(resource = %current.reference(), operation = op.name(), "retry accepted");
        self.schedule_settle(kind, id, op);
        Ok(current)
    }

    // ── Settlement ─────────────────────────────────────────────────

    /// Await the workflow of `op` and apply its outcome. Returns the record
    /// as written, or `None` if the workflow did not finish in time or the
    /// outcome needed no write.
    pub async fn settle(
        &self,
        kind: ResourceKind,
        id: &str,
        op: Operation,
    ) -> ControlResult<Option<ManagedResource>> {
        let key = workflow_key(&op, kind, id);
        if op == Operation::Provision {
            self.inner.ledger.compare_and_swap(kind, id, &[ResourceStatus::Pending], |r| {
                r.status = ResourceStatus::Provisioning;
                Ok(())
            })?;
        }
        let status = match self
            .inner
            .executor
            .await_completion(&key, self.inner.config.settle_timeout)
            .await
        {
            Ok(status) => status,
            Err(ExecutorError::Timeout { .. }) => {
                debug!(%key, "settle timed out; leaving to reconcile");
                return Ok(None);
            }
            Err(e) => WorkflowStatus::Failed {
                error: e.to_string(),
            },
        };
        self.apply_outcome(kind, id, &op, &status).await
    }

    fn schedule_settle(&self, kind: ResourceKind, id: &str, op: Operation) {
        if self.inner.config.settle_mode != SettleMode::Background {
            return;
        }
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.settle(kind, &id, op).await {
                error!(%kind, %id, error = %e, "settling workflow outcome failed");
            }
        });
    }

    /// Apply a terminal workflow status to the ledger.
    pub async fn apply_outcome(
        &self,
        kind: ResourceKind,
        id: &str,
        op: &Operation,
        status: &WorkflowStatus,
    ) -> ControlResult<Option<ManagedResource>> {
        let ledger = &self.inner.ledger;
        match status {
            WorkflowStatus::Running => Ok(None),
            WorkflowStatus::Failed { error } => {
                let message = truncate_message(error);
                let outcome = ledger.compare_and_swap(
                    kind,
                    id,
                    &[
                        ResourceStatus::Pending,
                        ResourceStatus::Provisioning,
                        ResourceStatus::Active,
                        ResourceStatus::Suspended,
                        ResourceStatus::Deleting,
                    ],
                    |r| {
                        not_migrating(r)?;
                        if r.last_operation.as_ref() != Some(op) {
                            return Err("a newer operation superseded this one".into());
                        }
                        r.status = ResourceStatus::Failed;
                        r.status_message = Some(message.clone());
                        Ok(())
                    },
                )?;
                let current = outcome.into_current();
                if let Some(r) = &current {
                    warn!(resource = %r.reference(), operation = op.name(), %error, "workflow failed");
                }
                Ok(current)
            }
            WorkflowStatus::Completed { .. } => match op {
                Operation::Deprovision => {
                    let outcome = ledger.compare_and_swap(kind, id, &[ResourceStatus::Deleting], |r| {
                        r.status = ResourceStatus::Deleted;
                        Ok(())
                    })?;
                    let current = outcome.into_current();
                    if let Some(r) = &current {
                        info!(resource = %r.reference(), "resource deleted");
                    }
                    Ok(current)
                }
                // Suspension is written when it is requested, retries included.
                Operation::Migrate { .. } | Operation::Suspend => Ok(None),
                Operation::Provision | Operation::Update | Operation::Unsuspend => {
                    let Some(record) = ledger.get_resource(kind, id)? else {
                        return Ok(None);
                    };
                    match record.status {
                        ResourceStatus::Pending | ResourceStatus::Provisioning => {
                            self.activate(&record).await
                        }
                        _ => Ok(None),
                    }
                }
            },
        }
    }

    /// Finish a successful provisioning. Shard-served resources wait for
    /// convergence to promote them; everything else becomes active here.
    async fn activate(&self, record: &ManagedResource) -> ControlResult<Option<ManagedResource>> {
        let ledger = &self.inner.ledger;
        let (kind, id) = (record.kind, record.id.as_str());
        ledger.compare_and_swap(kind, id, &[ResourceStatus::Pending], |r| {
            r.status = ResourceStatus::Provisioning;
            Ok(())
        })?;
        if let Some(shard_id) = ledger.effective_shard(record)? {
            debug!(resource = %record.reference(), %shard_id, "provisioned; awaiting convergence");
            self.inner.orchestrator.trigger(&shard_id).await;
            return Ok(ledger.get_resource(kind, id)?);
        }
        let outcome = ledger.compare_and_swap(kind, id, &[ResourceStatus::Provisioning], |r| {
            not_migrating(r)?;
            r.status = ResourceStatus::Active;
            r.status_message = None;
            Ok(())
        })?;
        let current = outcome.into_current();
        if let Some(r) = &current {
            info!(resource = %r.reference(), "resource active");
        }
        Ok(current)
    }

    /// Settle every resource awaiting a workflow whose outcome is already
    /// known. Returns how many records were written.
    pub async fn reconcile_inflight(&self) -> ControlResult<usize> {
        let mut settled = 0;
        for record in self.inner.ledger.inflight_resources()? {
            if record.is_migrating() {
                continue;
            }
            let Some(op) = record.last_operation.clone() else {
                continue;
            };
            let key = workflow_key(&op, record.kind, &record.id);
            let status = match self.inner.executor.get_status(&key).await {
                Ok(Some(status)) if !status.is_running() => status,
                Ok(_) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "cannot query workflow status");
                    continue;
                }
            };
            if self
                .apply_outcome(record.kind, &record.id, &op, &status)
                .await?
                .is_some()
            {
                settled += 1;
            }
        }
        if settled > 0 {
            info!(settled, "reconciled in-flight resources");
        }
        Ok(settled)
    }

    // ── Helpers ────────────────────────────────────────────────────

    async fn start(&self, op: &Operation, record: &ManagedResource, extra: Value) -> ControlResult<()> {
        let key = workflow_key(op, record.kind, &record.id);
        let input = json!({
            "operation": op.name(),
            "resource": record,
            "params": extra,
        });
        match self.inner.executor.start_or_signal(&key, input).await {
            Ok(execution) => {
                debug!(%key, run_id = %execution.run_id, joined = execution.joined, "workflow accepted");
                Ok(())
            }
            Err(e) => {
                warn!(%key, error = %e, "workflow engine refused request");
                Err(ControlError::WorkflowStart(e.to_string()))
            }
        }
    }

    fn parent_of(&self, record: &ManagedResource) -> ControlResult<Option<ManagedResource>> {
        match (record.kind.parent_kind(), &record.parent_id) {
            (Some(kind), Some(id)) => Ok(self.inner.ledger.get_resource(kind, id)?),
            _ => Ok(None),
        }
    }

    async fn converge_affected(&self, records: &[&ManagedResource]) -> ControlResult<()> {
        let mut shards = BTreeSet::new();
        for r in records {
            if let Some(shard_id) = self.inner.ledger.effective_shard(r)? {
                shards.insert(shard_id);
            }
        }
        for shard_id in shards {
            self.inner.orchestrator.trigger(&shard_id).await;
        }
        Ok(())
    }
}
