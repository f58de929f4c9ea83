//! CLI command implementations.

pub mod definition;
pub mod run;
pub mod serve;
pub mod task;
