//! Blocking conveniences for tooling and tests.
//!
//! Control operations never wait for their workflows; these helpers do,
//! with an explicit bound.

use std::time::Duration;

use tokio::time::{Instant, sleep};

use hostgrid_ledger::{Ledger, ManagedResource, ResourceKind, ResourceStatus};
use hostgrid_workflow::{ExecutorError, WorkflowExecutor, WorkflowKey, WorkflowStatus};

use crate::error::{ControlError, ControlResult};

/// Poll the ledger until `kind/id` reaches `target`.
///
/// Returns early with the record if it lands in `failed` while waiting for
/// something else, so callers can surface the status message.
pub async fn wait_for_status(
    ledger: &Ledger,
    kind: ResourceKind,
    id: &str,
    target: ResourceStatus,
    timeout: Duration,
    interval: Duration,
) -> ControlResult<ManagedResource> {
    let deadline = Instant::now() + timeout;
    loop {
        let record = ledger.require_resource(kind, id)?;
        if record.status == target
            || (record.status == ResourceStatus::Failed && target != ResourceStatus::Failed)
        {
            return Ok(record);
        }
        if Instant::now() >= deadline {
            return Err(ControlError::Timeout(format!(
                "{kind}/{id} is {} after {timeout:?}, wanted {target}",
                record.status
            )));
        }
        sleep(interval).await;
    }
}

/// Block on an execution that was already started.
pub async fn await_execution(
    executor: &dyn WorkflowExecutor,
    key: &WorkflowKey,
    timeout: Duration,
) -> ControlResult<WorkflowStatus> {
    match executor.await_completion(key, timeout).await {
        Ok(status) => Ok(status),
        Err(ExecutorError::NotFound(key)) => Err(ControlError::NotFound(format!("workflow {key}"))),
        Err(ExecutorError::Timeout { key, waited }) => Err(ControlError::Timeout(format!(
            "workflow {key} still running after {waited:?}"
        ))),
        Err(e) => Err(ControlError::WorkflowStart(e.to_string())),
    }
}
