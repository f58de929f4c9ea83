//! Playbook and step definitions.
//!
//! Definitions are authored as YAML or JSON. The worker spec is a closed
//! tagged enum, so a step naming an unknown worker type fails to parse
//! instead of failing at dispatch time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::step::{Dependency, WorkerType};

/// A multi-step process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub id: String,
    /// `None` makes the definition available to every organization
    #[serde(default)]
    pub organization_id: Option<String>,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

const fn default_version() -> u32 {
    1
}

impl PlaybookDefinition {
    pub fn from_yaml(source: &str) -> DomainResult<Self> {
        serde_yaml::from_str(source).map_err(|e| DomainError::ValidationFailed(format!("invalid playbook definition: {e}")))
    }

    /// Step definition at a 1-based sequence number.
    pub fn step_at(&self, sequence: u32) -> Option<&StepDefinition> {
        sequence
            .checked_sub(1)
            .and_then(|idx| self.steps.get(idx as usize))
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether an organization may invoke this definition.
    pub fn visible_to(&self, organization_id: &str) -> bool {
        self.organization_id
            .as_deref()
            .map_or(true, |org| org == organization_id)
    }

    pub fn worker_types(&self) -> Vec<WorkerType> {
        let mut types: Vec<WorkerType> = self.steps.iter().map(|s| s.worker.worker_type()).collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Definition of one step. Its sequence number is its 1-based position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub worker: WorkerSpec,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Permissions required in addition to those implied by the worker type
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub input: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl StepDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Worker-specific configuration, tagged by worker type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum WorkerSpec {
    System(SystemOperation),
    Human(HumanStepConfig),
    Ai(AiStepConfig),
    External(ExternalStepConfig),
}

impl WorkerSpec {
    pub fn worker_type(&self) -> WorkerType {
        match self {
            Self::System(_) => WorkerType::System,
            Self::Human(_) => WorkerType::Human,
            Self::Ai(_) => WorkerType::Ai,
            Self::External(_) => WorkerType::External,
        }
    }
}

/// Deterministic operations executed by the system worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SystemOperation {
    /// Check the step scope against declarative rules.
    Validate { rules: Vec<ValidationRule> },
    /// Produce a new object from field mappings.
    Transform { mapping: BTreeMap<String, String> },
    /// Send a notification through the notifier port.
    Notify {
        channel: String,
        recipients: Vec<String>,
        subject: String,
        body: String,
    },
    /// Create a record in the external record store.
    CreateRecord {
        entity_type: String,
        fields: BTreeMap<String, String>,
    },
    /// Update a record in the external record store.
    UpdateRecord {
        entity_type: String,
        /// Template resolving to the record id
        record_id: String,
        fields: BTreeMap<String, String>,
    },
}

/// A declarative rule evaluated against a JSON path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    pub check: RuleCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleCheck {
    Required,
    Type { expected: JsonType },
    Min { value: f64 },
    Max { value: f64 },
    MinLength { value: usize },
    MaxLength { value: usize },
    OneOf { values: Vec<serde_json::Value> },
    Equals { value: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl JsonType {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
        }
    }
}

/// Strategy for picking an assignee among candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    SkillMatching,
    WorkloadBalancing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCandidate {
    pub user: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanStepConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Fixed assignee; takes precedence over the strategy
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidates: Vec<AssignmentCandidate>,
    #[serde(default)]
    pub strategy: Option<AssignmentStrategy>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub due_in_hours: Option<u32>,
    #[serde(default = "default_true")]
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

impl Default for ResponseFormat {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiStepConfig {
    /// Prompt template; `{{path}}` placeholders resolve against the step scope
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub include_prior_outputs: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// Outputs scoring below this are flagged for review
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Default for HttpMethod {
    fn default() -> Self {
        Self::Get
    }
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// A secret given inline or read from an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretRef {
    Env { env: String },
    Value(String),
}

impl SecretRef {
    pub fn resolve(&self) -> DomainResult<String> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Env { env } => std::env::var(env)
                .map_err(|_| DomainError::Configuration(format!("environment variable {env} is not set"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    Bearer {
        token: SecretRef,
    },
    Basic {
        username: String,
        password: SecretRef,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: SecretRef,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: SecretRef,
        #[serde(default)]
        scope: Option<String>,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Transient-fault retry policy for a single external call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for ExternalRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalStepConfig {
    /// URL template
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Request body; string leaves are rendered as templates
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Accepted status codes; empty accepts any 2xx
    #[serde(default)]
    pub expected_status: Vec<u16>,
    #[serde(default)]
    pub retry: ExternalRetryPolicy,
    /// Rules evaluated against the response body
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    /// Output field -> response path; empty passes the body through
    #[serde(default)]
    pub response_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONBOARDING: &str = r#"
id: vendor-onboarding
name: Vendor onboarding
steps:
  - id: validate
    worker:
      type: system
      config:
        operation: validate
        rules:
          - field: input.vendor_name
            check: { rule: required }
  - id: review
    worker:
      type: human
      config:
        title: Review vendor
        candidates:
          - user: alice
            skills: [procurement]
        strategy: skill_matching
    depends_on:
      - step: 1
  - id: lookup
    worker:
      type: external
      config:
        url: "https://vendors.example.com/{{input.vendor_id}}"
        auth: { scheme: bearer, token: { env: VENDOR_TOKEN } }
    depends_on:
      - step: 2
        kind: any
    required: false
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let def = PlaybookDefinition::from_yaml(ONBOARDING).unwrap();
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.version, 1);
        assert_eq!(def.step_at(2).unwrap().id, "review");
        assert!(def.step_at(0).is_none());
        assert_eq!(def.steps[1].worker.worker_type(), WorkerType::Human);
        assert!(!def.steps[2].required);
        assert_eq!(
            def.worker_types(),
            vec![WorkerType::System, WorkerType::Human, WorkerType::External]
        );
    }

    #[test]
    fn test_unknown_worker_type_rejected_at_parse() {
        let yaml = r#"
id: broken
name: Broken
steps:
  - id: one
    worker:
      type: robot
      config: {}
"#;
        assert!(matches!(
            PlaybookDefinition::from_yaml(yaml),
            Err(DomainError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_secret_ref_untagged() {
        let inline: SecretRef = serde_json::from_value(serde_json::json!("abc")).unwrap();
        assert_eq!(inline.resolve().unwrap(), "abc");

        let env: SecretRef =
            serde_json::from_value(serde_json::json!({"env": "CONDUCTOR_TEST_UNSET_SECRET"})).unwrap();
        assert!(env.resolve().is_err());
    }

    #[test]
    fn test_visibility() {
        let mut def = PlaybookDefinition::from_yaml(ONBOARDING).unwrap();
        assert!(def.visible_to("any-org"));
        def.organization_id = Some("org-1".into());
        assert!(def.visible_to("org-1"));
        assert!(!def.visible_to("org-2"));
    }
}
