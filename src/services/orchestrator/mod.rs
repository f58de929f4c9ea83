//! Orchestrator daemon.
//!
//! A single background loop per coordinator instance. Each tick promotes
//! queued runs under the global cap, advances step states, recovers
//! abandoned leases, reconciles run outcomes, and hands ready steps to the
//! dispatcher.

mod daemon;
mod reconcile;

pub use daemon::{DaemonStatus, OrchestratorDaemon, OrchestratorDeps, TickReport};
