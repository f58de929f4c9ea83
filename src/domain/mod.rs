//! Domain layer for the Conductor orchestration engine
//!
//! This module contains the core models, the port traits adapters implement,
//! and the error taxonomy.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, ErrorClass, StepError};
