pub mod config;
pub mod definition;
pub mod human_task;
pub mod idempotency;
pub mod run;
pub mod step;
pub mod worker;

pub use config::{
    AiProvidersConfig, Config, DatabaseConfig, IdempotencyConfig, LogFormat, LoggingConfig,
    OrchestratorConfig, ProviderConfig, ProviderKind, RetryConfig, RotationPolicy, SecurityConfig,
    StepRateLimitConfig, WorkersConfig,
};
pub use definition::{
    AiStepConfig, AssignmentCandidate, AssignmentStrategy, AuthConfig, ExternalRetryPolicy,
    ExternalStepConfig, HttpMethod, HumanStepConfig, JsonType, PlaybookDefinition, ResponseFormat,
    RuleCheck, SecretRef, StepDefinition, SystemOperation, ValidationRule, WorkerSpec,
};
pub use human_task::{HumanTask, HumanTaskStatus};
pub use idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
pub use run::{Run, RunStatus};
pub use step::{Dependency, DependencyKind, StepCondition, StepInstance, StepStatus, WorkerType};
pub use worker::{
    ExecutionOptions, ExecutionReport, StepDescriptor, UpstreamContext, WorkerInfo, WorkerOutput,
};
