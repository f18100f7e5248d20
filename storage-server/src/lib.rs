//! Service node storage server library.
//!
//! The binary in `main.rs` wires these modules together; they are exposed
//! as a library so the workspace property-test suite can drive the swarm
//! model, message store, reachability ledger and signing directly.

pub mod auditor;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod listeners;
pub mod logbuf;
pub mod metrics;
pub mod rate_limit;
pub mod reachability;
pub mod service_node;
pub mod state;
pub mod store;
pub mod swarm;
