use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {field}: must be at least 1")]
    ZeroValue { field: &'static str },

    #[error("Retry delay ladder cannot be empty")]
    EmptyRetryLadder,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Service principal cannot be empty")]
    EmptyServicePrincipal,

    #[error("Invalid idempotency window: stuck threshold ({0}s) must be below expiration ({1}s)")]
    InvalidIdempotencyWindow(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .conductor/config.yaml (project config)
    /// 3. .conductor/local.yaml (local overrides, optional)
    /// 4. Environment variables (CONDUCTOR_* prefix, `__` separates nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file. Environment overrides still apply.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CONDUCTOR_").split("__"))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".conductor/config.yaml"))
            .merge(Yaml::file(".conductor/local.yaml"))
            .merge(Env::prefixed("CONDUCTOR_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let orchestrator = &config.orchestrator;
        let non_zero: [(&'static str, u64); 7] = [
            ("orchestrator.poll_interval_ms", orchestrator.poll_interval_ms),
            ("orchestrator.max_concurrent_runs", orchestrator.max_concurrent_runs as u64),
            (
                "orchestrator.max_concurrent_steps_per_run",
                orchestrator.max_concurrent_steps_per_run as u64,
            ),
            ("orchestrator.handler_timeout_secs", orchestrator.handler_timeout_secs),
            (
                "orchestrator.idempotency_purge_interval_secs",
                orchestrator.idempotency_purge_interval_secs,
            ),
            ("database.max_connections", u64::from(config.database.max_connections)),
            ("security.rate_limit.window_secs", config.security.rate_limit.window_secs),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue { field });
        }

        if config.retry.delays_ms.is_empty() {
            return Err(ConfigError::EmptyRetryLadder);
        }

        let idempotency = &config.idempotency;
        if idempotency.max_key_length == 0 {
            return Err(ConfigError::ZeroValue {
                field: "idempotency.max_key_length",
            });
        }
        if idempotency.stuck_threshold_secs >= idempotency.expiration_secs {
            return Err(ConfigError::InvalidIdempotencyWindow(
                idempotency.stuck_threshold_secs,
                idempotency.expiration_secs,
            ));
        }

        if config.security.service_principal.trim().is_empty() {
            return Err(ConfigError::EmptyServicePrincipal);
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        if let Some(org) = orchestrator.organizations.iter().find(|o| o.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(format!(
                "organization ids cannot be blank (got {org:?})"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{LogFormat, ProviderKind, RotationPolicy};
    use crate::domain::models::WorkerType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_concurrent_steps_per_run, 3);
        assert_eq!(config.database.path, ".conductor/conductor.db");
        assert_eq!(config.logging.format, LogFormat::Json);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
orchestrator:
  poll_interval_ms: 250
  max_concurrent_runs: 4
  organizations: [org-1, org-2]
retry:
  delays_ms: [10, 20]
  retry_rate_limited: true
security:
  grants:
    alice: [playbook.step.execute.human]
  rate_limit:
    per_worker:
      ai: 5
workers:
  ai:
    primary:
      kind: anthropic
      model: claude-test
logging:
  level: debug
  format: pretty
  rotation: hourly
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.orchestrator.poll_interval_ms, 250);
        assert_eq!(config.orchestrator.max_concurrent_steps_per_run, 3);
        assert!(config.orchestrator.serves("org-2"));
        assert!(!config.orchestrator.serves("org-3"));
        assert_eq!(config.retry.delays_ms, vec![10, 20]);
        assert!(config.retry.retry_rate_limited);
        assert_eq!(config.security.rate_limit.limit_for(WorkerType::Ai), 5);
        assert_eq!(config.security.rate_limit.limit_for(WorkerType::System), 120);
        assert_eq!(config.workers.ai.primary.kind, ProviderKind::Anthropic);
        assert_eq!(config.logging.rotation, RotationPolicy::Hourly);

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent_steps_per_run = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroValue {
                field: "orchestrator.max_concurrent_steps_per_run"
            })
        ));

        let mut config = Config::default();
        config.orchestrator.poll_interval_ms = 0;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::ZeroValue { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_ladder() {
        let mut config = Config::default();
        config.retry.delays_ms.clear();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::EmptyRetryLadder)));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "verbose"),
            other => panic!("Expected InvalidLogLevel, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_inverted_idempotency_window() {
        let mut config = Config::default();
        config.idempotency.stuck_threshold_secs = config.idempotency.expiration_secs;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidIdempotencyWindow(_, _))
        ));
    }

    #[test]
    fn test_invalid_log_format_fails_to_load() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  format: xml").unwrap();
        file.flush().unwrap();
        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "orchestrator:\n  max_concurrent_runs: 7\n  poll_interval_ms: 100\nlogging:\n  level: warn"
        )
        .unwrap();
        file.flush().unwrap();

        temp_env::with_vars(
            [
                ("CONDUCTOR_ORCHESTRATOR__MAX_CONCURRENT_RUNS", Some("12")),
                ("CONDUCTOR_DATABASE__PATH", Some("/tmp/conductor-test.db")),
            ],
            || {
                let config = ConfigLoader::load_from_file(file.path()).unwrap();
                assert_eq!(config.orchestrator.max_concurrent_runs, 12, "env should win");
                assert_eq!(config.orchestrator.poll_interval_ms, 100, "file value should persist");
                assert_eq!(config.logging.level, "warn");
                assert_eq!(config.database.path, "/tmp/conductor-test.db");
            },
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(base_file, "orchestrator:\n  max_concurrent_runs: 5\nlogging:\n  level: info\n  format: json").unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "orchestrator:\n  max_concurrent_runs: 15\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.orchestrator.max_concurrent_runs, 15, "Override should win");
        assert_eq!(config.logging.level, "debug", "Override should win for nested fields");
        assert_eq!(config.logging.format, LogFormat::Json, "Base value should persist when not overridden");
    }
}
