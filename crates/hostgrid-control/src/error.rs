//! Control-plane error categories.
//!
//! Every synchronous failure of a control operation falls into one of these.
//! A workflow that fails after it was accepted is never an error here; it
//! is recorded on the resource as `failed` plus a status message.

use thiserror::Error;

use hostgrid_agent::AgentError;
use hostgrid_converge::ConvergeError;
use hostgrid_ledger::LedgerError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    /// Malformed input or a violated business rule. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The resource's current state does not allow the operation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The workflow engine did not accept the request. The ledger is as it
    /// was before the call.
    #[error("workflow could not be started: {0}")]
    WorkflowStart(String),

    /// A bounded wait ran out.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<LedgerError> for ControlError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(what) => ControlError::NotFound(what),
            LedgerError::Conflict(what) => ControlError::Precondition(format!("{what} already exists")),
            LedgerError::Precondition(msg) => ControlError::Precondition(msg),
            other => ControlError::Ledger(other),
        }
    }
}

impl From<ConvergeError> for ControlError {
    fn from(e: ConvergeError) -> Self {
        match e {
            ConvergeError::ShardNotFound(id) => ControlError::NotFound(format!("shard {id}")),
            ConvergeError::ClusterNotFound(id) => ControlError::NotFound(format!("cluster {id}")),
            ConvergeError::NoNodes(id) => ControlError::Precondition(format!("shard {id} has no nodes")),
            ConvergeError::Dispatch(msg) => ControlError::WorkflowStart(msg),
            ConvergeError::Ledger(e) => e.into(),
        }
    }
}

impl From<AgentError> for ControlError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::NodeNotFound(id) => ControlError::NotFound(format!("node {id}")),
            AgentError::NodeUnassigned(id) => {
                ControlError::Precondition(format!("node {id} is not assigned to a shard"))
            }
            AgentError::HealthNotFound(id) => ControlError::NotFound(format!("health report for node {id}")),
            AgentError::ShardNotFound(id) => ControlError::NotFound(format!("shard {id}")),
            AgentError::Ledger(e) => e.into(),
            AgentError::Converge(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_categories() {
        assert_eq!(
            ControlError::from(LedgerError::Conflict("tenant/acme".into())),
            ControlError::Precondition("tenant/acme already exists".into())
        );
        assert!(matches!(
            ControlError::from(LedgerError::Write("disk full".into())),
            ControlError::Ledger(_)
        ));
    }
}
