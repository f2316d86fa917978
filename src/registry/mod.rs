//! Worker registry: capacity, load and liveness of session hosts.
//!
//! Workers report themselves with periodic heartbeats. The registry derives
//! how many sessions each one can host and ranks the healthy ones for
//! placement.
//!
//! # Components
//!
//! - [`WorkerNode`]: stored heartbeat data plus operator flags
//! - [`WorkerRegistry`]: upsert, ranking, session accounting, status control

pub mod fleet;
pub mod worker;

pub use fleet::{ClusterSummary, StatusChange, WorkerRegistry};
pub use worker::{DrainStatus, HeartbeatInput, WorkerNode, WorkerView};
