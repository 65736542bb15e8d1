#![deny(unsafe_code)]

//! Configuration loading and validation for PageLens.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure:
//! engine budgets, isolation settings, secret sources, request auth, and the
//! declared integrations that make up the initial registry snapshot.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Request orchestration budgets.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Isolation settings for integration logic.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Secret sources available to integrations.
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Request authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Declared integrations, in registry order.
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

/// Budgets applied by the orchestrator to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Aggregate deadline for one request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default per-integration deadline, in milliseconds.
    #[serde(default = "default_integration_timeout_ms")]
    pub integration_timeout_ms: u64,

    /// Maximum number of integration executions running at once, process-wide.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Cap on items kept per integration (0 = unlimited).
    #[serde(default)]
    pub max_items_per_integration: usize,
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn integration_timeout(&self) -> Duration {
        Duration::from_millis(self.integration_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            integration_timeout_ms: default_integration_timeout_ms(),
            max_concurrent_executions: default_max_concurrent_executions(),
            max_items_per_integration: 0,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_integration_timeout_ms() -> u64 {
    2_000
}

fn default_max_concurrent_executions() -> usize {
    16
}

/// Isolation configuration for command-based integrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Isolation backend: "process" or "inline-only".
    ///
    /// `inline-only` refuses to spawn external commands; only embedded
    /// integrations can run.
    #[serde(default = "default_isolation_backend")]
    pub backend: String,

    /// Working directory for spawned integration processes.
    #[serde(default = "default_isolation_workdir")]
    pub workdir: String,

    /// Host environment variables forwarded to integration processes,
    /// in addition to `PATH` and `HOME`.
    #[serde(default)]
    pub pass_env: Vec<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: default_isolation_backend(),
            workdir: default_isolation_workdir(),
            pass_env: Vec::new(),
        }
    }
}

fn default_isolation_backend() -> String {
    "process".to_string()
}

fn default_isolation_workdir() -> String {
    ".".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty" or "compact".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

/// Secret sources.
///
/// ## TOML Example
///
/// ```toml
/// [[secrets.entries]]
/// name = "GITHUB_TOKEN"
/// source = "env"
///
/// [[secrets.entries]]
/// name = "JIRA_KEY"
/// source = "file"
/// file_path = "/run/secrets/jira"
/// ```
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Named secret entries.
    #[serde(default)]
    pub entries: Vec<SecretEntryConfig>,
}

/// A single secret entry in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntryConfig {
    /// Unique name for this secret (the name integrations declare).
    pub name: String,

    /// Source of the secret value: "env", "file", or "inline".
    #[serde(default = "default_secret_source")]
    pub source: String,

    /// Environment variable to read from (when source = "env").
    /// Defaults to `PAGELENS_SECRET_<NAME>` (uppercased).
    #[serde(default)]
    pub env_var: Option<String>,

    /// File path to read from (when source = "file").
    #[serde(default)]
    pub file_path: Option<String>,

    /// Inline value (when source = "inline"). Avoid in production.
    #[serde(default)]
    pub value: Option<String>,
}

fn default_secret_source() -> String {
    "env".to_string()
}

/// Request authentication.
///
/// ```toml
/// [auth]
/// mode = "token"
/// token_secrets = ["EXTENSION_TOKEN"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "none" (every request allowed) or "token" (bearer token required).
    #[serde(default = "default_auth_mode")]
    pub mode: String,

    /// Names of secrets holding accepted bearer tokens.
    #[serde(default)]
    pub token_secrets: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            token_secrets: Vec::new(),
        }
    }
}

fn default_auth_mode() -> String {
    "none".to_string()
}

/// One declared integration.
///
/// ```toml
/// [[integrations]]
/// name = "ci-status"
/// context_type = "github"
/// command = ["./integrations/ci-status.sh"]
/// required_secrets = ["GITHUB_TOKEN"]
/// cache_ttl = 300
///
/// [integrations.match]
/// "page.repository" = { startsWith = "my-org/" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Unique integration name.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Context type this integration applies to.
    pub context_type: String,

    /// Dot-path → predicate table. Kept as raw JSON so that malformed
    /// predicates surface at registry build time instead of failing the load.
    #[serde(default, rename = "match")]
    pub match_rules: BTreeMap<String, serde_json::Value>,

    /// Secrets this integration needs, in declaration order.
    #[serde(default)]
    pub required_secrets: Vec<String>,

    /// Result cache lifetime in seconds (0 = never cached).
    #[serde(default)]
    pub cache_ttl: u64,

    /// Per-integration deadline override, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Extra context paths folded into the cache key.
    #[serde(default)]
    pub cache_key: Vec<String>,

    /// Command argv executed inside the sandbox.
    pub command: Vec<String>,

    /// JSON data files handed to the integration.
    #[serde(default)]
    pub data_files: Vec<String>,
}

impl IntegrationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            integrations = config.integrations.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.request_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.engine.integration_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.integration_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.engine.max_concurrent_executions == 0 {
            return Err(ConfigError::Validation(
                "engine.max_concurrent_executions must be at least 1".to_string(),
            ));
        }

        let valid_backends = ["process", "inline-only"];
        if !valid_backends.contains(&self.isolation.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "isolation.backend must be one of {:?}, got {:?}",
                valid_backends, self.isolation.backend
            )));
        }

        let valid_formats = ["pretty", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.format must be one of {:?}, got {:?}",
                valid_formats, self.logging.format
            )));
        }

        for (i, entry) in self.secrets.entries.iter().enumerate() {
            if entry.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "secrets.entries[{i}].name must not be empty"
                )));
            }
            let valid_sources = ["env", "file", "inline"];
            if !valid_sources.contains(&entry.source.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "secrets.entries[{i}].source must be one of {:?}, got {:?}",
                    valid_sources, entry.source
                )));
            }
            if entry.source == "file" && entry.file_path.is_none() {
                return Err(ConfigError::Validation(format!(
                    "secrets.entries[{i}].file_path is required when source is \"file\""
                )));
            }
            if entry.source == "inline" && entry.value.is_none() {
                return Err(ConfigError::Validation(format!(
                    "secrets.entries[{i}].value is required when source is \"inline\""
                )));
            }
        }

        let valid_auth_modes = ["none", "token"];
        if !valid_auth_modes.contains(&self.auth.mode.as_str()) {
            return Err(ConfigError::Validation(format!(
                "auth.mode must be one of {:?}, got {:?}",
                valid_auth_modes, self.auth.mode
            )));
        }
        if self.auth.mode == "token" && self.auth.token_secrets.is_empty() {
            return Err(ConfigError::Validation(
                "auth.token_secrets must name at least one secret when mode is \"token\""
                    .to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, integration) in self.integrations.iter().enumerate() {
            if integration.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "integrations[{i}].name must not be empty"
                )));
            }
            if !seen.insert(integration.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "integrations[{i}].name {:?} is declared more than once",
                    integration.name
                )));
            }
            if integration.context_type.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "integrations[{i}].context_type must not be empty"
                )));
            }
            if integration.command.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "integrations[{i}].command must not be empty"
                )));
            }
            if integration.timeout_ms == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "integrations[{i}].timeout_ms must be non-zero"
                )));
            }
        }

        Ok(())
    }

    /// Look up a declared integration by name.
    pub fn integration(&self, name: &str) -> Option<&IntegrationConfig> {
        self.integrations.iter().find(|i| i.name == name)
    }
}
