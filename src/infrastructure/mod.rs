//! Infrastructure layer module
//!
//! Process-level concerns that are not ports of the domain:
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod logging;
