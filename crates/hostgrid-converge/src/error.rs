//! Convergence error types.

use thiserror::Error;

/// Errors that can occur while converging a shard.
///
/// `Clone` so that every caller coalesced onto one run receives the same
/// outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConvergeError {
    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("shard {0} has no nodes")]
    NoNodes(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] hostgrid_ledger::LedgerError),
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;
