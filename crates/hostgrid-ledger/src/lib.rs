//! hostgrid-ledger: the resource ledger for hostgrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the lifecycle record of
//! every managed resource (one table per kind), the cluster topology,
//! the latest health snapshot of each node, and a bounded drift history.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Status changes go through [`Ledger::compare_and_swap`] so concurrent
//! operations on the same resource cannot interleave a read and a write.
//!
//! The `Ledger` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod kinds;
pub mod lifecycle;
pub mod resource;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{LedgerError, LedgerResult};
pub use kinds::{Provisionable, valid_id, validate_config};
pub use lifecycle::{Action, precondition_message, truncate_message};
pub use resource::*;
pub use store::{CasOutcome, Ledger, Page, ResourceQuery, TenantSummary};
pub use types::*;
