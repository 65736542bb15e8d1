#![deny(unsafe_code)]

//! Secrets management and least-privilege scoping.
//!
//! The full secret set lives behind a [`SecretProvider`]. Nothing but
//! [`scope`] ever reads from it on behalf of an integration: each invocation
//! receives a [`ScopedSecrets`] containing exactly the names that integration
//! declared, re-read from the provider on every request so rotated values
//! take effect immediately.
//!
//! Secrets can be loaded from:
//!
//! - Environment variables (`PAGELENS_SECRET_<NAME>` by default)
//! - Files (one secret per file)
//! - Inline config values (testing only)
//!
//! ## Security Properties
//!
//! - All secret values implement `Zeroize` and are cleared on drop.
//! - Secret values are redacted in `Debug` output (shown as `[REDACTED]`).
//! - The store never logs or displays secret values.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use pagelens_config::SecretsConfig;
use serde_json::{Map, Value};
use zeroize::Zeroize;

use crate::BoxFuture;

/// A single secret value with automatic zeroization.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    inner: String,
}

impl SecretValue {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Get the secret value as a string slice.
    ///
    /// Only the isolation boundary should need this.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("inner", &"[REDACTED]")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// The source from which a secret was loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Inline value from the config file.
    Inline,
    /// Loaded from an environment variable.
    Environment(String),
    /// Loaded from a file.
    File(PathBuf),
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Inline => write!(f, "inline"),
            SecretSource::Environment(var) => write!(f, "env:{var}"),
            SecretSource::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Errors from secret store operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("failed to read secret file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("environment variable '{0}' not set")]
    EnvNotSet(String),

    #[error("secret value is empty for '{0}'")]
    EmptyValue(String),

    #[error("unknown secret source '{kind}' for '{name}'")]
    UnknownSource { name: String, kind: String },
}

/// In-memory secret store with automatic zeroization.
///
/// Tracks the source of each secret for audit purposes.
#[derive(Default)]
pub struct SecretStore {
    secrets: HashMap<String, SecretValue>,
    sources: HashMap<String, SecretSource>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret to the store. Empty values are rejected.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: SecretValue,
        source: SecretSource,
    ) -> Result<(), SecretError> {
        let name = name.into();
        if value.is_empty() {
            return Err(SecretError::EmptyValue(name));
        }
        self.secrets.insert(name.clone(), value);
        self.sources.insert(name, source);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.secrets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    pub fn source(&self, name: &str) -> Option<&SecretSource> {
        self.sources.get(name)
    }

    /// List all secret names (without exposing values).
    pub fn names(&self) -> Vec<&str> {
        self.secrets.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Load a secret from an environment variable.
    ///
    /// Without an explicit variable, looks for `PAGELENS_SECRET_<NAME>` (uppercased).
    pub fn load_from_env(&mut self, name: &str, env_var: Option<&str>) -> Result<(), SecretError> {
        let env_key = env_var
            .map(str::to_string)
            .unwrap_or_else(|| format!("PAGELENS_SECRET_{}", name.to_uppercase()));
        let value = std::env::var(&env_key).map_err(|_| SecretError::EnvNotSet(env_key.clone()))?;
        self.insert(name, SecretValue::new(value), SecretSource::Environment(env_key))
    }

    /// Load a secret from a file; trailing newlines are trimmed.
    pub async fn load_from_file(&mut self, name: &str, path: &Path) -> Result<(), SecretError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| SecretError::FileRead {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        let value = content.trim_end_matches(['\n', '\r']).to_string();
        self.insert(name, SecretValue::new(value), SecretSource::File(path.to_path_buf()))
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("count", &self.secrets.len())
            .field("names", &self.names())
            .finish()
    }
}

// ── Provider seam ───────────────────────────────────────────────────────

/// Source of the full secret set.
///
/// The engine never assumes a particular backend; it only asks for one name
/// at a time.
pub trait SecretProvider: Send + Sync {
    /// Current value of a secret, or `None` if absent.
    fn get(&self, name: &str) -> Option<SecretValue>;

    /// Populate the provider from its backing source.
    fn load(&self) -> BoxFuture<'_, Result<(), SecretError>>;

    /// Re-read the backing source. Defaults to a full [`load`](Self::load).
    fn refresh(&self) -> BoxFuture<'_, Result<(), SecretError>> {
        self.load()
    }
}

/// Secret provider driven by the `[secrets]` config section.
///
/// Every load builds a fresh [`SecretStore`] and swaps it in atomically, so
/// readers never observe a half-refreshed set. A failed refresh keeps the
/// previous store.
pub struct ConfiguredSecrets {
    config: SecretsConfig,
    store: ArcSwap<SecretStore>,
}

impl ConfiguredSecrets {
    pub fn new(config: SecretsConfig) -> Self {
        Self {
            config,
            store: ArcSwap::from_pointee(SecretStore::new()),
        }
    }

    /// Number of secrets currently loaded.
    pub fn loaded(&self) -> usize {
        self.store.load().len()
    }

    async fn build_store(&self) -> Result<SecretStore, SecretError> {
        let mut store = SecretStore::new();
        for entry in &self.config.entries {
            match entry.source.as_str() {
                "env" => match store.load_from_env(&entry.name, entry.env_var.as_deref()) {
                    Ok(()) => {}
                    // An unset variable is an absent secret, not a load failure.
                    Err(SecretError::EnvNotSet(var)) => {
                        tracing::debug!(secret = %entry.name, var = %var, "Secret not set in environment");
                    }
                    Err(e) => return Err(e),
                },
                "file" => {
                    let path = entry.file_path.as_deref().unwrap_or_default();
                    store.load_from_file(&entry.name, Path::new(path)).await?;
                }
                "inline" => {
                    let value = entry.value.clone().unwrap_or_default();
                    store.insert(&entry.name, SecretValue::new(value), SecretSource::Inline)?;
                }
                other => {
                    return Err(SecretError::UnknownSource {
                        name: entry.name.clone(),
                        kind: other.to_string(),
                    });
                }
            }
        }
        Ok(store)
    }
}

impl SecretProvider for ConfiguredSecrets {
    fn get(&self, name: &str) -> Option<SecretValue> {
        self.store.load().get(name).cloned()
    }

    fn load(&self) -> BoxFuture<'_, Result<(), SecretError>> {
        Box::pin(async move {
            let store = self.build_store().await?;
            tracing::info!(
                configured = self.config.entries.len(),
                loaded = store.len(),
                "Secrets loaded"
            );
            self.store.store(Arc::new(store));
            Ok(())
        })
    }
}

// ── Scoping ─────────────────────────────────────────────────────────────

/// The least-privilege secret subset visible to one integration invocation.
///
/// Holds exactly the declared names, in declaration order; absent secrets are
/// recorded explicitly as `None`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ScopedSecrets {
    entries: Vec<(String, Option<SecretValue>)>,
}

impl ScopedSecrets {
    /// Build directly from name/value pairs. Later duplicates are ignored.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, Option<SecretValue>)>,
    ) -> Self {
        let mut scoped = Self::default();
        for (name, value) in entries {
            if !scoped.entries.iter().any(|(n, _)| *n == name) {
                scoped.entries.push((name, value));
            }
        }
        scoped
    }

    /// Value of a scoped secret. `None` when absent or not in scope.
    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Whether `name` is part of this scope (present or not).
    pub fn in_scope(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// First declared name whose value is absent.
    pub fn first_missing(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| v.is_none())
            .map(|(n, _)| n.as_str())
    }

    /// `(name, present)` pairs, in declaration order.
    pub fn presence(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.is_some()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object of name → value (`null` when absent). Exposes values.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(n, v)| {
                let value = v
                    .as_ref()
                    .map(|s| Value::String(s.expose().to_string()))
                    .unwrap_or(Value::Null);
                (n.clone(), value)
            })
            .collect();
        Value::Object(map)
    }

    /// Present secrets as `(name, value)` pairs for environment injection.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(n, v)| v.as_ref().map(|s| (n.clone(), s.expose().to_string())))
            .collect()
    }
}

impl fmt::Debug for ScopedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.entries {
            map.entry(name, &if value.is_some() { "[REDACTED]" } else { "<absent>" });
        }
        map.finish()
    }
}

/// Derive the scoped secret set for one integration.
///
/// Queries the provider once per distinct required name. Missing names are
/// kept as explicit absences; deciding what to do about them is the runner's
/// job.
pub fn scope(provider: &dyn SecretProvider, required: &[String]) -> ScopedSecrets {
    ScopedSecrets::from_entries(
        dedup(required).map(|name| (name.to_string(), provider.get(name))),
    )
}

fn dedup(names: &[String]) -> impl Iterator<Item = &str> {
    names
        .iter()
        .enumerate()
        .filter(|(i, n)| !names[..*i].contains(n))
        .map(|(_, n)| n.as_str())
}
