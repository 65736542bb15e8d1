//! Isolated execution contexts for command-based integration logic.
//!
//! A [`SandboxConfig`] declares what a child process is allowed to see: a
//! cleared environment holding only `PATH`, `HOME`, explicitly forwarded host
//! variables and the integration's scoped secrets; a working directory; a
//! wall-clock limit and an output cap. A [`SandboxBackend`] turns that
//! declaration into a running process.
//!
//! ```text
//!   Runner ──► CommandLogic ──► SandboxConfig ──► SandboxBackend
//!                                                  ├─ ProcessBackend  (child process, kill_on_drop)
//!                                                  └─ DisabledBackend ("inline-only")
//! ```

pub mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pagelens_config::IsolationConfig;

use crate::BoxFuture;

pub use process::ProcessBackend;

/// Errors from sandbox creation and execution.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("sandbox creation failed: {0}")]
    Create(String),

    #[error("sandbox execution failed: {0}")]
    Execution(String),

    #[error("sandbox timeout after {0:?}")]
    Timeout(Duration),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
}

// ── Resource limits ─────────────────────────────────────────────────────

/// Limits enforced on one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock limit. `None` leaves the deadline to the caller.
    pub timeout: Option<Duration>,
    /// Maximum bytes accepted on stdout.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            max_output_bytes: 1024 * 1024,
        }
    }
}

// ── Sandbox configuration ───────────────────────────────────────────────

/// Declarative sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Human-readable label for this sandbox (used in logs).
    pub label: String,
    pub limits: ResourceLimits,
    /// Variables set in the child's otherwise empty environment.
    pub env: BTreeMap<String, String>,
    /// Host variables forwarded when present, besides `PATH` and `HOME`.
    pub pass_env: Vec<String>,
    pub workdir: PathBuf,
}

impl SandboxConfig {
    /// Create a minimal sandbox configuration.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            limits: ResourceLimits::default(),
            env: BTreeMap::new(),
            pass_env: Vec::new(),
            workdir: std::env::temp_dir(),
        }
    }

    /// Builder: set an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builder: forward a host environment variable.
    pub fn with_pass_env(mut self, name: impl Into<String>) -> Self {
        self.pass_env.push(name.into());
        self
    }

    /// Builder: set execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = Some(timeout);
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.limits.max_output_bytes = bytes;
        self
    }

    /// Builder: set working directory.
    pub fn with_workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = path.into();
        self
    }

    /// Validate the configuration for obvious errors.
    pub fn validate(&self) -> Result<(), IsolationError> {
        if self.label.is_empty() {
            return Err(IsolationError::Create(
                "sandbox label must not be empty".to_string(),
            ));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(IsolationError::Create(
                "output limit must be non-zero".to_string(),
            ));
        }
        if self.limits.timeout == Some(Duration::ZERO) {
            return Err(IsolationError::Create(
                "timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Execution result ────────────────────────────────────────────────────

/// The outcome of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock execution time.
    pub elapsed: Duration,
}

impl SandboxResult {
    /// Whether the sandboxed process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ── Backend trait ───────────────────────────────────────────────────────

/// Platform-specific isolation backend.
pub trait SandboxBackend: Send + Sync {
    /// Human-readable name of this backend (e.g. "process").
    fn name(&self) -> &str;

    /// Whether this backend can run commands at all.
    fn available(&self) -> bool;

    /// Run `command` (argv) under `config`, writing `stdin` to the child.
    fn execute(
        &self,
        config: &SandboxConfig,
        command: &[String],
        stdin: Vec<u8>,
    ) -> BoxFuture<'_, Result<SandboxResult, IsolationError>>;
}

/// Backend for `backend = "inline-only"`: refuses every command.
pub struct DisabledBackend;

impl SandboxBackend for DisabledBackend {
    fn name(&self) -> &str {
        "inline-only"
    }

    fn available(&self) -> bool {
        false
    }

    fn execute(
        &self,
        config: &SandboxConfig,
        _command: &[String],
        _stdin: Vec<u8>,
    ) -> BoxFuture<'_, Result<SandboxResult, IsolationError>> {
        let label = config.label.clone();
        Box::pin(async move {
            tracing::warn!(backend = "inline-only", label = %label, "Command logic refused");
            Err(IsolationError::UnsupportedBackend(
                "command logic is disabled (inline-only)".to_string(),
            ))
        })
    }
}

/// Isolation backend preference from `[isolation] backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    #[default]
    Process,
    InlineOnly,
}

impl BackendPreference {
    pub fn parse(s: &str) -> Result<Self, IsolationError> {
        match s {
            "process" => Ok(BackendPreference::Process),
            "inline-only" => Ok(BackendPreference::InlineOnly),
            other => Err(IsolationError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Process => write!(f, "process"),
            BackendPreference::InlineOnly => write!(f, "inline-only"),
        }
    }
}

/// Select the isolation backend named by the config.
pub fn select_backend(config: &IsolationConfig) -> Result<Arc<dyn SandboxBackend>, IsolationError> {
    let backend: Arc<dyn SandboxBackend> = match BackendPreference::parse(&config.backend)? {
        BackendPreference::Process => Arc::new(ProcessBackend),
        BackendPreference::InlineOnly => Arc::new(DisabledBackend),
    };
    tracing::debug!(backend = backend.name(), "Isolation backend selected");
    Ok(backend)
}

/// Base sandbox config derived from `[isolation]`, labelled for one integration.
pub fn sandbox_for(config: &IsolationConfig, label: &str) -> SandboxConfig {
    let mut sandbox = SandboxConfig::new(label);
    if !config.workdir.is_empty() {
        sandbox = sandbox.with_workdir(&config.workdir);
    }
    for name in &config.pass_env {
        sandbox = sandbox.with_pass_env(name);
    }
    sandbox
}

// ── Tests ───────────────────────────────────────────────────────────────
