//! hostgrid-control: the control operations of the hosting plane.
//!
//! The lifecycle service drives every resource kind through the shared
//! status machine, the migration coordinator relocates shard-placed
//! resources with copy-then-cutover, and [`ControlPlane`] assembles both
//! with the orchestrator and the agent gateway.

pub mod error;
pub mod lifecycle;
pub mod migration;
pub mod plane;
pub mod wait;

#[cfg(test)]
mod testing;

pub use error::{ControlError, ControlResult};
pub use lifecycle::{Lifecycle, LifecycleConfig, NewResource, SettleMode, workflow_key};
pub use migration::{
    CascadeReport, MigrateOptions, MigrationConfig, MigrationCoordinator, ResumeReport,
};
pub use plane::{
    ControlPlane, NewCluster, NewNode, NewRegion, NewShard, PlaneConfig, RetryReport,
};
pub use wait::{await_execution, wait_for_status};
