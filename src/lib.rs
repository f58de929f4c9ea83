//! Conductor - playbook orchestration engine
//!
//! Conductor executes multi-step playbooks: each run is a set of step
//! instances ordered by declared dependencies, dispatched to system, human,
//! AI or external HTTP workers with retries, idempotency protection and
//! permission gating.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Models, ports and errors
//! - **Service Layer** (`services`): Resolver, dispatcher, daemon and workers
//! - **Adapters** (`adapters`): SQLite persistence, AI providers, HTTP transport
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **Application Layer** (`application`): Engine assembly
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use conductor::{Config, Engine, StartRun};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::open(Config::default()).await?;
//!     engine.daemon.start().await;
//!     let run = engine
//!         .playbooks
//!         .start_run(StartRun::new("onboarding", "acme", serde_json::json!({})))
//!         .await?;
//!     println!("started {}", run.id);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{Engine, EngineBuilder};
pub use domain::errors::{DomainError, DomainResult, StepError};
pub use domain::models::{
    Config, HumanTask, PlaybookDefinition, Run, RunStatus, StepDefinition, StepInstance, StepStatus,
    WorkerType,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{DependencyResolver, PlaybookService, StartRun};
