//! Integrations: declarative metadata plus the logic that produces items.
//!
//! Logic comes in two kinds, both behind [`IntegrationLogic`]:
//!
//! - [`CommandLogic`] wraps an external executable run through a
//!   [`SandboxBackend`]. The invocation is sent as JSON on stdin and the
//!   scoped secrets are also set as environment variables.
//! - [`FnLogic`] wraps an in-process async function.
//!
//! Either way the logic receives an owned [`Invocation`] and nothing else.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pagelens_config::{IntegrationConfig, IsolationConfig};
use pagelens_macros::Redact;
use serde_json::{Value, json};

use crate::BoxFuture;
use crate::context::Context;
use crate::data_files::DataFile;
use crate::isolation::{self, IsolationError, SandboxBackend, SandboxConfig};
use crate::matcher::MatchSpec;
use crate::secrets::ScopedSecrets;

/// Everything one execution may observe.
#[derive(Clone, Redact)]
pub struct Invocation {
    pub integration: String,
    pub context: Context,
    #[redact]
    pub secrets: ScopedSecrets,
    pub data_files: Vec<DataFile>,
}

impl Invocation {
    /// Wire form sent to command logic. Contains secret values.
    pub fn to_json(&self) -> Value {
        json!({
            "integration": self.integration,
            "context": Value::from(self.context.clone()),
            "secrets": self.secrets.to_json(),
            "dataFiles": self.data_files,
        })
    }
}

/// Errors raised by integration logic.
#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error("{0}")]
    Failed(String),

    #[error("sandbox error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("unparsable output: {0}")]
    Output(String),
}

/// Executable logic of an integration.
pub trait IntegrationLogic: Send + Sync {
    /// Short label for logs, e.g. `"command"`.
    fn kind(&self) -> &'static str;

    /// Run once. The returned future owns everything it touches so the
    /// runner can move it onto its own task.
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Value, LogicError>>;
}

// ── Command logic ───────────────────────────────────────────────────────

/// An external executable run in a fresh sandboxed process per invocation.
pub struct CommandLogic {
    command: Vec<String>,
    sandbox: SandboxConfig,
    backend: Arc<dyn SandboxBackend>,
}

impl CommandLogic {
    pub fn new(command: Vec<String>, sandbox: SandboxConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            command,
            sandbox,
            backend,
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

impl IntegrationLogic for CommandLogic {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Value, LogicError>> {
        let command = self.command.clone();
        let backend = Arc::clone(&self.backend);
        let mut config = self.sandbox.clone();
        for (name, value) in invocation.secrets.env_pairs() {
            config = config.with_env(name, value);
        }

        Box::pin(async move {
            let stdin = serde_json::to_vec(&invocation.to_json())
                .map_err(|e| LogicError::Output(e.to_string()))?;
            let result = backend.execute(&config, &command, stdin).await?;

            if !result.success() {
                return Err(LogicError::Failed(format!(
                    "'{}' exited with code {}: {}",
                    invocation.integration,
                    result.exit_code,
                    result.stderr.trim()
                )));
            }
            serde_json::from_str(result.stdout.trim()).map_err(|e| LogicError::Output(e.to_string()))
        })
    }
}

// ── Embedded logic ──────────────────────────────────────────────────────

/// In-process logic backed by an async function.
pub struct FnLogic<F> {
    f: F,
}

impl<F, Fut> IntegrationLogic for FnLogic<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, LogicError>> + Send + 'static,
{
    fn kind(&self) -> &'static str {
        "embedded"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Value, LogicError>> {
        Box::pin((self.f)(invocation))
    }
}

/// Wrap an async function as integration logic.
pub fn fn_logic<F, Fut>(f: F) -> Arc<dyn IntegrationLogic>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, LogicError>> + Send + 'static,
{
    Arc::new(FnLogic { f })
}

// ── Integration ─────────────────────────────────────────────────────────

/// A registered integration. Immutable once part of a registry snapshot.
#[derive(Clone)]
pub struct Integration {
    pub name: String,
    pub description: String,
    pub match_spec: MatchSpec,
    /// Ordered, duplicate-free.
    pub required_secrets: Vec<String>,
    /// Zero disables caching.
    pub cache_ttl: Duration,
    pub timeout: Option<Duration>,
    /// Extra context paths folded into the cache fingerprint.
    pub cache_key: Vec<String>,
    pub logic: Arc<dyn IntegrationLogic>,
}

impl Integration {
    pub fn new(name: impl Into<String>, match_spec: MatchSpec, logic: Arc<dyn IntegrationLogic>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            match_spec,
            required_secrets: Vec::new(),
            cache_ttl: Duration::ZERO,
            timeout: None,
            cache_key: Vec::new(),
            logic,
        }
    }

    /// Build from an `[[integrations]]` entry with sandboxed command logic.
    pub fn from_config(
        config: &IntegrationConfig,
        isolation_config: &IsolationConfig,
        backend: Arc<dyn SandboxBackend>,
    ) -> Self {
        let sandbox = isolation::sandbox_for(isolation_config, &config.name);
        let logic = Arc::new(CommandLogic::new(config.command.clone(), sandbox, backend));
        let mut integration = Self::new(
            &config.name,
            MatchSpec::from_rules(&config.context_type, &config.match_rules),
            logic,
        )
        .with_description(&config.description)
        .with_required_secrets(config.required_secrets.iter().cloned())
        .with_cache_ttl(Duration::from_secs(config.cache_ttl))
        .with_cache_key(config.cache_key.iter().cloned());
        integration.timeout = config.timeout();
        integration
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: declare required secrets. Repeated names are kept once.
    pub fn with_required_secrets<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        for name in names {
            let name = name.into();
            if !self.required_secrets.contains(&name) {
                self.required_secrets.push(name);
            }
        }
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_key<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.cache_key.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Context paths that influence this integration's output.
    pub fn relevant_paths(&self) -> impl Iterator<Item = &str> {
        self.match_spec
            .paths()
            .chain(self.cache_key.iter().map(String::as_str))
    }
}

impl fmt::Debug for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integration")
            .field("name", &self.name)
            .field("context_type", &self.match_spec.context_type())
            .field("required_secrets", &self.required_secrets)
            .field("cache_ttl", &self.cache_ttl)
            .field("timeout", &self.timeout)
            .field("logic", &self.logic.kind())
            .finish()
    }
}
