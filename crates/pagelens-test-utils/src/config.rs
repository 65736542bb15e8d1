//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::collections::BTreeMap;

use pagelens_config::{AppConfig, IntegrationConfig, SecretEntryConfig};
use serde_json::Value;

/// Fluent builder for [`AppConfig`] in tests.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .inline_secret("JIRA_KEY", "k")
///     .integration(TestConfigBuilder::command_integration("jira", "github", &["./jira.sh"]))
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.engine.request_timeout_ms = ms;
        self
    }

    pub fn integration_timeout_ms(mut self, ms: u64) -> Self {
        self.config.engine.integration_timeout_ms = ms;
        self
    }

    pub fn max_concurrent_executions(mut self, n: usize) -> Self {
        self.config.engine.max_concurrent_executions = n;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn isolation_backend(mut self, backend: &str) -> Self {
        self.config.isolation.backend = backend.to_string();
        self
    }

    pub fn inline_secret(mut self, name: &str, value: &str) -> Self {
        self.config.secrets.entries.push(SecretEntryConfig {
            name: name.to_string(),
            source: "inline".to_string(),
            env_var: None,
            file_path: None,
            value: Some(value.to_string()),
        });
        self
    }

    pub fn token_auth(mut self, token_secret: &str) -> Self {
        self.config.auth.mode = "token".to_string();
        self.config.auth.token_secrets.push(token_secret.to_string());
        self
    }

    pub fn integration(mut self, integration: IntegrationConfig) -> Self {
        self.config.integrations.push(integration);
        self
    }

    /// A minimal command integration with no match predicates.
    pub fn command_integration(name: &str, context_type: &str, command: &[&str]) -> IntegrationConfig {
        IntegrationConfig {
            name: name.to_string(),
            description: String::new(),
            context_type: context_type.to_string(),
            match_rules: BTreeMap::<String, Value>::new(),
            required_secrets: Vec::new(),
            cache_ttl: 0,
            timeout_ms: None,
            cache_key: Vec::new(),
            command: command.iter().map(|s| s.to_string()).collect(),
            data_files: Vec::new(),
        }
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
