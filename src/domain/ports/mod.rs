//! Port trait definitions (Hexagonal Architecture)
//!
//! Persistence ports are organization-scoped and implemented by the SQLite
//! adapters. Collaborator ports (AI provider, HTTP transport, notifier,
//! permission provider) let handlers run against test doubles.

pub mod ai_provider;
pub mod definition_repository;
pub mod human_task_repository;
pub mod http_transport;
pub mod idempotency_repository;
pub mod notifier;
pub mod permission_provider;
pub mod record_store;
pub mod run_repository;
pub mod step_repository;
pub mod worker_handler;

pub use ai_provider::{AiProvider, CompletionRequest, CompletionResponse};
pub use definition_repository::DefinitionRepository;
pub use human_task_repository::HumanTaskRepository;
pub use http_transport::{HttpBody, HttpRequest, HttpResponse, HttpTransport, TransportError};
pub use idempotency_repository::IdempotencyRepository;
pub use notifier::{Notification, Notifier};
pub use permission_provider::{PermissionProvider, WILDCARD_PERMISSION};
pub use record_store::RecordStore;
pub use run_repository::{RunFilter, RunRepository};
pub use step_repository::StepRepository;
pub use worker_handler::WorkerHandler;
