//! Engine assembly.
//!
//! Wires repositories, worker handlers, the dispatcher, the daemon and the
//! playbook service from one [`Config`]. Collaborators with side effects
//! (HTTP transport, AI providers, notifier, permission source) can be
//! replaced before building.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::adapters::http::ReqwestTransport;
use crate::adapters::notifications::LogNotifier;
use crate::adapters::providers::build_provider;
use crate::adapters::sqlite::{
    initialize_from_config, SqliteDefinitionRepository, SqliteHumanTaskRepository, SqliteIdempotencyRepository,
    SqliteRecordStore, SqliteRunRepository, SqliteStepRepository,
};
use crate::domain::models::Config;
use crate::domain::ports::{
    AiProvider, DefinitionRepository, HttpTransport, HumanTaskRepository, IdempotencyRepository, Notifier,
    PermissionProvider, RecordStore, RunRepository, StepRepository, WorkerHandler,
};
use crate::services::{
    AiWorker, AuditLogService, DispatcherDeps, ExternalWorker, HumanWorker, IdempotencyGuard, OrchestratorDaemon,
    OrchestratorDeps, PlaybookService, PlaybookServiceDeps, RetryManager, SecurityGate, StaticPermissionProvider,
    StepDispatcher, SystemWorker, WorkerRegistry,
};

/// A fully wired orchestration engine.
pub struct Engine {
    pub config: Config,
    pub pool: SqlitePool,
    pub audit: Arc<AuditLogService>,
    pub daemon: Arc<OrchestratorDaemon>,
    pub playbooks: Arc<PlaybookService>,
    pub records: Arc<dyn RecordStore>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Open the configured database and build with default collaborators.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = initialize_from_config(&config.database)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;
        EngineBuilder::new(config).build(pool)
    }
}

/// Builder for [`Engine`] with overridable collaborators.
pub struct EngineBuilder {
    config: Config,
    transport: Option<Arc<dyn HttpTransport>>,
    providers: Option<(Arc<dyn AiProvider>, Option<Arc<dyn AiProvider>>)>,
    notifier: Option<Arc<dyn Notifier>>,
    permissions: Option<Arc<dyn PermissionProvider>>,
    instance_id: Option<String>,
    handlers: Vec<Arc<dyn WorkerHandler>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            providers: None,
            notifier: None,
            permissions: None,
            instance_id: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_ai_providers(mut self, primary: Arc<dyn AiProvider>, fallback: Option<Arc<dyn AiProvider>>) -> Self {
        self.providers = Some((primary, fallback));
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionProvider>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Replace the built-in handler for the handler's worker type.
    pub fn with_handler(mut self, handler: Arc<dyn WorkerHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Lease owner name; overrides `orchestrator.instance_id`.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Build against an already migrated pool.
    pub fn build(self, pool: SqlitePool) -> Result<Engine> {
        let config = self.config;

        let runs: Arc<dyn RunRepository> = Arc::new(SqliteRunRepository::new(pool.clone()));
        let steps: Arc<dyn StepRepository> = Arc::new(SqliteStepRepository::new(pool.clone()));
        let definitions: Arc<dyn DefinitionRepository> = Arc::new(SqliteDefinitionRepository::new(pool.clone()));
        let human_tasks: Arc<dyn HumanTaskRepository> = Arc::new(SqliteHumanTaskRepository::new(pool.clone()));
        let idempotency_records: Arc<dyn IdempotencyRepository> =
            Arc::new(SqliteIdempotencyRepository::new(pool.clone()));
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool.clone()));

        let audit = Arc::new(AuditLogService::with_defaults());
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(StaticPermissionProvider::from_config(&config.security)));
        let gate = Arc::new(
            SecurityGate::new(config.security.clone(), permissions, audit.clone())
                .context("Invalid security configuration")?,
        );
        let idempotency = Arc::new(IdempotencyGuard::new(idempotency_records, config.idempotency.clone()));
        let retry = RetryManager::new(config.retry.clone());

        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new().context("Failed to create HTTP transport")?),
        };
        let (primary, fallback) = match self.providers {
            Some(providers) => providers,
            None => {
                let ai = &config.workers.ai;
                let primary = build_provider("primary", &ai.primary).context("Invalid primary AI provider")?;
                let fallback = ai
                    .fallback
                    .as_ref()
                    .map(|cfg| build_provider("fallback", cfg))
                    .transpose()
                    .context("Invalid fallback AI provider")?;
                (primary, fallback)
            }
        };

        let mut registry = WorkerRegistry::new()
            .with(Arc::new(SystemWorker::new(
                records.clone(),
                notifier.clone(),
                Duration::from_secs(config.workers.system_timeout_secs),
            )))
            .with(Arc::new(HumanWorker::new(human_tasks.clone(), notifier)))
            .with(Arc::new(AiWorker::new(primary, fallback)))
            .with(Arc::new(ExternalWorker::new(
                transport,
                Duration::from_secs(config.workers.http_timeout_secs),
            )));
        for handler in self.handlers {
            tracing::debug!(worker_type = %handler.worker_type(), "overriding worker handler");
            registry.register(handler);
        }

        let instance_id = self
            .instance_id
            .or_else(|| config.orchestrator.instance_id.clone())
            .unwrap_or_else(|| format!("conductor-{}", Uuid::new_v4()));
        let wake = Arc::new(Notify::new());

        let dispatcher = StepDispatcher::new(
            instance_id,
            config.orchestrator.clone(),
            config.security.service_principal.clone(),
            DispatcherDeps {
                runs: runs.clone(),
                steps: steps.clone(),
                registry: registry.clone(),
                gate,
                idempotency: idempotency.clone(),
                retry: retry.clone(),
                audit: audit.clone(),
            },
            wake.clone(),
        );

        let daemon = Arc::new(OrchestratorDaemon::new(
            config.orchestrator.clone(),
            OrchestratorDeps {
                runs: runs.clone(),
                steps: steps.clone(),
                definitions: definitions.clone(),
                idempotency,
                audit: audit.clone(),
            },
            dispatcher,
            wake,
        ));

        let playbooks = Arc::new(
            PlaybookService::new(
                PlaybookServiceDeps {
                    definitions,
                    runs,
                    steps,
                    human_tasks,
                    audit: audit.clone(),
                },
                registry,
                retry,
            )
            .with_daemon(daemon.clone()),
        );

        tracing::info!(
            instance_id = %daemon.instance_id(),
            database = %config.database.path,
            "engine assembled"
        );

        Ok(Engine {
            config,
            pool,
            audit,
            daemon,
            playbooks,
            records,
        })
    }
}
