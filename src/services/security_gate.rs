//! Permission and rate-limit enforcement in front of every dispatch.

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult, StepError};
use crate::domain::models::{SecurityConfig, StepInstance, WorkerType};
use crate::domain::ports::{PermissionProvider, WILDCARD_PERMISSION};
use crate::services::audit_log::{
    user_actor, AuditAction, AuditCategory, AuditEntry, AuditLevel, AuditLogService,
};

/// Permission implied by executing a step of the given worker type.
pub fn implied_permission(worker_type: WorkerType) -> String {
    format!("playbook.step.execute.{}", worker_type.as_str())
}

/// Whether a held permission set satisfies `required`.
///
/// `*` grants everything; `prefix.*` grants every permission under `prefix.`.
pub fn permission_granted(held: &HashSet<String>, required: &str) -> bool {
    held.contains(WILDCARD_PERMISSION)
        || held.contains(required)
        || held.iter().any(|p| {
            p.strip_suffix(".*")
                .is_some_and(|prefix| required.starts_with(prefix) && required[prefix.len()..].starts_with('.'))
        })
}

/// Permission provider backed by static grants from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissionProvider {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticPermissionProvider {
    pub fn new<I, P>(grants: I) -> Self
    where
        I: IntoIterator<Item = (String, P)>,
        P: IntoIterator<Item = String>,
    {
        Self {
            grants: grants
                .into_iter()
                .map(|(principal, perms)| (principal, perms.into_iter().collect()))
                .collect(),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.grants.clone())
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissionProvider {
    async fn permissions_for(&self, _organization_id: &str, principal: &str) -> DomainResult<HashSet<String>> {
        Ok(self.grants.get(principal).cloned().unwrap_or_default())
    }
}

pub struct SecurityGate {
    config: SecurityConfig,
    permissions: Arc<dyn PermissionProvider>,
    limiters: HashMap<WorkerType, DefaultKeyedRateLimiter<String>>,
    audit: Arc<AuditLogService>,
}

impl SecurityGate {
    pub fn new(
        config: SecurityConfig,
        permissions: Arc<dyn PermissionProvider>,
        audit: Arc<AuditLogService>,
    ) -> DomainResult<Self> {
        let window = Duration::from_secs(config.rate_limit.window_secs);
        let mut limiters = HashMap::new();

        for worker_type in WorkerType::ALL {
            let limit = config.rate_limit.limit_for(worker_type);
            let burst = NonZeroU32::new(limit).ok_or_else(|| {
                DomainError::Configuration(format!("rate limit for {worker_type} steps must be positive"))
            })?;
            let quota = Quota::with_period(window / limit)
                .ok_or_else(|| {
                    DomainError::Configuration("rate limit window must be positive".to_string())
                })?
                .allow_burst(burst);
            limiters.insert(worker_type, RateLimiter::keyed(quota));
        }

        Ok(Self {
            config,
            permissions,
            limiters,
            audit,
        })
    }

    /// Declared permissions plus the one implied by the worker type.
    pub fn required_permissions(&self, worker_type: WorkerType, declared: &[String]) -> BTreeSet<String> {
        declared
            .iter()
            .cloned()
            .chain(std::iter::once(implied_permission(worker_type)))
            .collect()
    }

    /// Authorize `principal` to execute `step`.
    ///
    /// Permissions are checked before the rate limit so a denied request
    /// does not consume execution budget. Every outcome is audited.
    pub async fn authorize(&self, step: &StepInstance, declared: &[String], principal: &str) -> Result<(), StepError> {
        let required = self.required_permissions(step.worker_type, declared);

        if !self.config.enabled {
            self.audit_check(step, principal, AuditAction::AccessGranted, "security gate disabled", &required, &[])
                .await;
            return Ok(());
        }

        let held = self.permissions.permissions_for(&step.organization_id, principal).await?;
        let missing: Vec<String> = required
            .iter()
            .filter(|p| !permission_granted(&held, p))
            .cloned()
            .collect();

        if !missing.is_empty() {
            tracing::warn!(
                run_id = %step.run_id,
                step_id = %step.id,
                principal,
                missing = ?missing,
                "step execution denied"
            );
            self.audit_check(step, principal, AuditAction::AccessDenied, "permission denied", &required, &missing)
                .await;
            return Err(StepError::Permission { missing });
        }

        let key = format!("{}:{}", step.organization_id, principal);
        let within_limit = self
            .limiters
            .get(&step.worker_type)
            .map_or(true, |limiter| limiter.check_key(&key).is_ok());

        if !within_limit {
            tracing::warn!(
                run_id = %step.run_id,
                step_id = %step.id,
                principal,
                worker_type = %step.worker_type,
                "step execution rate limited"
            );
            self.audit_check(step, principal, AuditAction::RateLimited, "rate limit exceeded", &required, &[])
                .await;
            return Err(StepError::RateLimit {
                user: principal.to_string(),
                worker_type: step.worker_type,
            });
        }

        self.audit_check(step, principal, AuditAction::AccessGranted, "execution authorized", &required, &[])
            .await;
        Ok(())
    }

    /// Forget rate-limit keys whose budget has fully replenished.
    /// Returns the number of keys still tracked.
    pub fn retain_recent(&self) -> usize {
        self.limiters
            .values()
            .map(|limiter| {
                limiter.retain_recent();
                limiter.shrink_to_fit();
                limiter.len()
            })
            .sum()
    }

    async fn audit_check(
        &self,
        step: &StepInstance,
        principal: &str,
        action: AuditAction,
        message: &str,
        required: &BTreeSet<String>,
        missing: &[String],
    ) {
        let level = if action == AuditAction::AccessGranted {
            AuditLevel::Info
        } else {
            AuditLevel::Warning
        };
        self.audit
            .log(
                AuditEntry::new(level, AuditCategory::Security, action, user_actor(principal), message)
                    .with_step(step)
                    .with_metadata("required", serde_json::json!(required))
                    .with_metadata("missing", serde_json::json!(missing)),
            )
            .await;
    }
}
