//! Infrastructure adapters for external systems.

pub mod http;
pub mod notifications;
pub mod providers;
pub mod sqlite;
