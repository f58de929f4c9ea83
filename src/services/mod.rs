pub mod audit_log;
pub mod dependency_resolver;
pub mod dispatcher;
pub mod idempotency_guard;
pub mod orchestrator;
pub mod playbook_service;
pub mod retry_manager;
pub mod security_gate;
pub mod workers;

pub use audit_log::{AuditAction, AuditCategory, AuditEntry, AuditFilter, AuditLevel, AuditLogService};
pub use dependency_resolver::DependencyResolver;
pub use dispatcher::{DispatcherDeps, StepDispatcher};
pub use idempotency_guard::{Guarded, IdempotencyCheck, IdempotencyGuard};
pub use orchestrator::{DaemonStatus, OrchestratorDaemon, OrchestratorDeps, TickReport};
pub use playbook_service::{PlaybookService, PlaybookServiceDeps, RunDetails, StartRun};
pub use retry_manager::{RetryDecision, RetryManager};
pub use security_gate::{SecurityGate, StaticPermissionProvider};
pub use workers::{AiWorker, ExternalWorker, HumanWorker, SystemWorker, WorkerRegistry};
