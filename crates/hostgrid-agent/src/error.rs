//! Gateway error types.

use thiserror::Error;

/// Errors returned to node agents.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {0} is not assigned to a shard")]
    NodeUnassigned(String),

    #[error("no health report for node {0}")]
    HealthNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] hostgrid_ledger::LedgerError),

    #[error("convergence error: {0}")]
    Converge(#[from] hostgrid_converge::ConvergeError),
}

pub type AgentResult<T> = Result<T, AgentError>;
