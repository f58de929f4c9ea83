use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::models::step::WorkerType;

/// Main configuration structure for Conductor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Scheduling loop and concurrency caps
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Step-level retry ladder
    #[serde(default)]
    pub retry: RetryConfig,

    /// Idempotency window
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Permission grants and rate limits
    #[serde(default)]
    pub security: SecurityConfig,

    /// Worker handler settings
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Orchestrator daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Polling interval of the scheduling loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Global cap on simultaneously active runs
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Per-run cap on simultaneously executing steps
    #[serde(default = "default_max_concurrent_steps_per_run")]
    pub max_concurrent_steps_per_run: usize,

    /// Hard wall-clock budget for one handler invocation
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,

    /// How long `stop()` waits for in-flight steps
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Extra lease time beyond the handler timeout before a claim is considered abandoned
    #[serde(default = "default_lease_grace_secs")]
    pub lease_grace_secs: u64,

    /// Organizations this coordinator serves; empty serves all
    #[serde(default)]
    pub organizations: Vec<String>,

    /// Identifier written into step leases; generated when absent
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Interval between idempotency record expiry sweeps
    #[serde(default = "default_purge_interval_secs")]
    pub idempotency_purge_interval_secs: u64,
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_max_concurrent_runs() -> usize {
    10
}

const fn default_max_concurrent_steps_per_run() -> usize {
    3
}

const fn default_handler_timeout_secs() -> u64 {
    30 * 60
}

const fn default_drain_timeout_secs() -> u64 {
    30
}

const fn default_lease_grace_secs() -> u64 {
    60
}

const fn default_purge_interval_secs() -> u64 {
    3_600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_concurrent_steps_per_run: default_max_concurrent_steps_per_run(),
            handler_timeout_secs: default_handler_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            lease_grace_secs: default_lease_grace_secs(),
            organizations: vec![],
            instance_id: None,
            idempotency_purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn serves(&self, organization_id: &str) -> bool {
        self.organizations.is_empty() || self.organizations.iter().any(|o| o == organization_id)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Backoff ladder indexed by retry attempt; the last entry repeats
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,

    /// Applied to steps whose definition does not set `max_retries`
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Treat rate-limit denials as recoverable
    #[serde(default)]
    pub retry_rate_limited: bool,
}

fn default_delays_ms() -> Vec<u64> {
    vec![1_000, 2_000, 5_000, 10_000, 20_000]
}

const fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delays_ms: default_delays_ms(),
            default_max_retries: default_max_retries(),
            retry_rate_limited: false,
        }
    }
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IdempotencyConfig {
    /// Validity window of a record
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,

    /// Age after which an in-progress record is presumed abandoned
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
}

const fn default_expiration_secs() -> u64 {
    24 * 60 * 60
}

const fn default_stuck_threshold_secs() -> u64 {
    5 * 60
}

const fn default_max_key_length() -> usize {
    255
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            expiration_secs: default_expiration_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            max_key_length: default_max_key_length(),
        }
    }
}

/// Security gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SecurityConfig {
    /// When disabled every check is allowed (and still audited)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Principal used for runs without `requested_by`
    #[serde(default = "default_service_principal")]
    pub service_principal: String,

    /// Principal -> granted permissions; `*` grants everything
    #[serde(default = "default_grants")]
    pub grants: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub rate_limit: StepRateLimitConfig,
}

fn default_true() -> bool {
    true
}

fn default_service_principal() -> String {
    "system".to_string()
}

fn default_grants() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(default_service_principal(), vec!["*".to_string()])])
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_principal: default_service_principal(),
            grants: default_grants(),
            rate_limit: StepRateLimitConfig::default(),
        }
    }
}

/// Per-user, per-worker-type execution rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepRateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Executions allowed per window for worker types without an override
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,

    #[serde(default)]
    pub per_worker: BTreeMap<WorkerType, u32>,
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_max_per_window() -> u32 {
    120
}

impl Default for StepRateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_per_window: default_max_per_window(),
            per_worker: BTreeMap::new(),
        }
    }
}

impl StepRateLimitConfig {
    pub fn limit_for(&self, worker_type: WorkerType) -> u32 {
        self.per_worker
            .get(&worker_type)
            .copied()
            .unwrap_or(self.max_per_window)
    }
}

/// Worker handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkersConfig {
    /// Short default timeout of the system worker
    #[serde(default = "default_system_timeout_secs")]
    pub system_timeout_secs: u64,

    #[serde(default)]
    pub ai: AiProvidersConfig,

    /// Request timeout of the HTTP transport
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

const fn default_system_timeout_secs() -> u64 {
    30
}

const fn default_http_timeout_secs() -> u64 {
    60
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            system_timeout_secs: default_system_timeout_secs(),
            ai: AiProvidersConfig::default(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AiProvidersConfig {
    #[serde(default)]
    pub primary: ProviderConfig,
    #[serde(default)]
    pub fallback: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    /// Offline provider returning a canned response
    Mock,
}

/// AI provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_provider_kind() -> ProviderKind {
    ProviderKind::Mock
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

const fn default_max_tokens() -> u32 {
    2_048
}

const fn default_provider_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".conductor/conductor.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    Daily,
    Hourly,
    Never,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::Daily
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Directory for rolling log files; stdout only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub rotation: RotationPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: RotationPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.orchestrator.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.orchestrator.handler_timeout(), Duration::from_secs(1800));
        assert_eq!(config.retry.delays_ms, vec![1_000, 2_000, 5_000, 10_000, 20_000]);
        assert_eq!(config.idempotency.stuck_threshold_secs, 300);
        assert_eq!(config.security.grants["system"], vec!["*".to_string()]);
    }

    #[test]
    fn test_serves_all_orgs_when_empty() {
        let mut config = OrchestratorConfig::default();
        assert!(config.serves("anything"));
        config.organizations = vec!["org-1".into()];
        assert!(config.serves("org-1"));
        assert!(!config.serves("org-2"));
    }

    #[test]
    fn test_per_worker_rate_limit_override() {
        let yaml = r"
window_secs: 30
max_per_window: 10
per_worker:
  ai: 2
";
        let limits: StepRateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(limits.limit_for(WorkerType::Ai), 2);
        assert_eq!(limits.limit_for(WorkerType::System), 10);
    }

    #[test]
    fn test_database_url() {
        let mut db = DatabaseConfig::default();
        assert_eq!(db.url(), "sqlite:.conductor/conductor.db");
        db.path = "sqlite::memory:".into();
        assert_eq!(db.url(), "sqlite::memory:");
    }
}
