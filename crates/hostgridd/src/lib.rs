//! hostgridd: the hostgrid daemon.
//!
//! The binary lives in `main.rs`; this library half holds configuration and
//! subsystem assembly so integration tests can build the same control plane
//! the daemon serves.

pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::{build_plane, open_ledger, run, run_reconcile_loop};
