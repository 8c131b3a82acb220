//! hostgrid-agent: the node agent gateway.
//!
//! Serves per-node desired state, ingests health snapshots and drift
//! events, and answers whether a shard is healthy enough to take traffic.

pub mod error;
pub mod gateway;

pub use error::{AgentError, AgentResult};
pub use gateway::{
    AgentConfig, DRIFT_LIST_LIMIT, DriftAck, DriftList, Gateway, NodeDesiredState, NodeVerdict,
    ShardHealth,
};
