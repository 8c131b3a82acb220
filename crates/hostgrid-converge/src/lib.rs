//! hostgrid-converge: shard convergence.
//!
//! Computes a shard's desired-state document from the ledger, hands it to
//! the workflow engine for delivery to the shard's nodes, and promotes
//! `provisioning` resources to `active` once nodes acknowledge.

pub mod desired;
pub mod error;
pub mod orchestrator;

pub use desired::{DesiredState, NodeDescriptor, ResourceEntry, compute_desired_state};
pub use error::{ConvergeError, ConvergeResult};
pub use orchestrator::{ConvergeConfig, ConvergeReport, Orchestrator, TriggerMode};
