//! hostgrid-workflow: the seam between the control plane and the durable
//! workflow engine that performs remote work.
//!
//! The control plane only ever issues keyed, idempotent requests:
//! [`WorkflowExecutor::start_or_signal`] joins an execution that is still
//! running under the same key instead of forking a new one. Keys are
//! derived from the operation, resource kind and resource id, so a
//! duplicate `Create` or `Retry` collapses onto the in-flight run.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::{DEFAULT_RUN_RETENTION, MemoryExecutor, Runner, StartedRun};

/// Deterministic identity of a workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowKey(String);

impl WorkflowKey {
    /// `{operation}-{kind}-{id}`, e.g. `provision-tenant-acme`.
    pub fn new(operation: &str, kind: &str, id: &str) -> Self {
        Self(format!("{operation}-{kind}-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The operation segment of the key.
    pub fn operation(&self) -> &str {
        self.0.split_once('-').map(|(op, _)| op).unwrap_or(&self.0)
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Observable state of the latest execution under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed { output: Value },
    Failed { error: String },
}

impl WorkflowStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkflowStatus::Running)
    }
}

/// Handle returned when a start request is accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub key: WorkflowKey,
    pub run_id: String,
    /// The request signalled an execution that was already running.
    pub joined: bool,
}

/// Errors surfaced by an executor.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    /// The engine could not accept the request at all.
    #[error("workflow engine unavailable: {0}")]
    Unavailable(String),

    #[error("no execution for key {0}")]
    NotFound(WorkflowKey),

    #[error("execution {key} still running after {waited:?}")]
    Timeout { key: WorkflowKey, waited: Duration },
}

/// Result type alias for executor calls.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// A durable, retryable execution engine.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Start an execution for `key`, or signal the one already running.
    async fn start_or_signal(&self, key: &WorkflowKey, input: Value) -> ExecutorResult<Execution>;

    /// Wait until the latest execution under `key` reaches a terminal state.
    async fn await_completion(
        &self,
        key: &WorkflowKey,
        timeout: Duration,
    ) -> ExecutorResult<WorkflowStatus>;

    /// Current state of the latest execution under `key`, if any.
    async fn get_status(&self, key: &WorkflowKey) -> ExecutorResult<Option<WorkflowStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = WorkflowKey::new("provision", "database_user", "shop-admin");
        assert_eq!(key.as_str(), "provision-database_user-shop-admin");
        assert_eq!(key.operation(), "provision");
        assert_eq!(
            WorkflowKey::new("migrate_copy", "tenant", "acme").operation(),
            "migrate_copy"
        );
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_value(WorkflowStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
