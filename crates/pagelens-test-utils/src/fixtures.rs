//! In-memory collaborators and builders for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pagelens_core::integration::LogicError;
use pagelens_core::secrets::SecretError;
use pagelens_core::{
    BoxFuture, Context, Integration, IntegrationLogic, Invocation, MatchSpec, Predicate,
    SecretProvider, SecretValue,
};
use serde_json::{Value, json};

// ── Secrets ─────────────────────────────────────────────────────────────

/// In-memory [`SecretProvider`] that can be rotated mid-test and records
/// every lookup.
#[derive(Default)]
pub struct MapSecrets {
    values: Mutex<HashMap<String, String>>,
    lookups: Mutex<Vec<String>>,
}

impl MapSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Self {
        let secrets = Self::new();
        for (name, value) in pairs {
            secrets.set(name, value);
        }
        secrets
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values
            .lock()
            .expect("secrets lock")
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.values.lock().expect("secrets lock").remove(name);
    }

    /// Names looked up so far, in order.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().expect("lookups lock").clone()
    }
}

impl SecretProvider for MapSecrets {
    fn get(&self, name: &str) -> Option<SecretValue> {
        self.lookups
            .lock()
            .expect("lookups lock")
            .push(name.to_string());
        self.values
            .lock()
            .expect("secrets lock")
            .get(name)
            .map(SecretValue::new)
    }

    fn load(&self) -> BoxFuture<'_, Result<(), SecretError>> {
        Box::pin(async { Ok(()) })
    }
}

// ── Logic ───────────────────────────────────────────────────────────────

/// Logic that returns a fixed value after an optional delay, counting calls
/// and keeping every invocation it received.
pub struct CountingLogic {
    response: Value,
    delay: Duration,
    calls: AtomicUsize,
    seen: Arc<Mutex<Vec<Invocation>>>,
}

impl CountingLogic {
    pub fn returning(response: Value) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Logic returning one text item.
    pub fn text(content: &str) -> Self {
        Self::returning(json!([{ "type": "text", "content": content }]))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.seen.lock().expect("invocations lock").clone()
    }
}

impl IntegrationLogic for CountingLogic {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Value, LogicError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.response.clone();
        let delay = self.delay;
        let seen = Arc::clone(&self.seen);
        Box::pin(async move {
            seen.lock().expect("invocations lock").push(invocation);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(response)
        })
    }
}

/// Logic that always raises `message`.
pub struct FailingLogic(pub String);

impl IntegrationLogic for FailingLogic {
    fn kind(&self) -> &'static str {
        "failing"
    }

    fn invoke(&self, _invocation: Invocation) -> BoxFuture<'static, Result<Value, LogicError>> {
        let message = self.0.clone();
        Box::pin(async move { Err(LogicError::Failed(message)) })
    }
}

// ── Integrations ────────────────────────────────────────────────────────

/// Fluent builder for [`Integration`] in tests.
pub struct IntegrationBuilder {
    name: String,
    spec: MatchSpec,
    secrets: Vec<String>,
    ttl: Duration,
    timeout: Option<Duration>,
    cache_key: Vec<String>,
    logic: Option<Arc<dyn IntegrationLogic>>,
}

impl IntegrationBuilder {
    /// Matches every `github` context unless narrowed.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec: MatchSpec::new("github"),
            secrets: Vec::new(),
            ttl: Duration::ZERO,
            timeout: None,
            cache_key: Vec::new(),
            logic: None,
        }
    }

    pub fn context_type(mut self, context_type: &str) -> Self {
        let mut spec = MatchSpec::new(context_type);
        for (path, predicate) in self.spec.predicates() {
            spec = spec.with(path.clone(), predicate.clone());
        }
        self.spec = spec;
        self
    }

    pub fn starts_with(mut self, path: &str, prefix: &str) -> Self {
        self.spec = self.spec.with(path, Predicate::StartsWith(prefix.to_string()));
        self
    }

    pub fn equals(mut self, path: &str, value: Value) -> Self {
        self.spec = self.spec.with(path, Predicate::Equals(value));
        self
    }

    pub fn exists(mut self, path: &str) -> Self {
        self.spec = self.spec.with(path, Predicate::Exists);
        self
    }

    pub fn secrets(mut self, names: &[&str]) -> Self {
        self.secrets = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn ttl_secs(mut self, secs: u64) -> Self {
        self.ttl = Duration::from_secs(secs);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_key(mut self, path: &str) -> Self {
        self.cache_key.push(path.to_string());
        self
    }

    pub fn logic(mut self, logic: Arc<dyn IntegrationLogic>) -> Self {
        self.logic = Some(logic);
        self
    }

    /// Without explicit logic, returns one text item named after the integration.
    pub fn build(self) -> Integration {
        let logic = self
            .logic
            .unwrap_or_else(|| Arc::new(CountingLogic::text(&self.name)));
        let mut integration = Integration::new(self.name, self.spec, logic)
            .with_required_secrets(self.secrets)
            .with_cache_ttl(self.ttl)
            .with_cache_key(self.cache_key);
        integration.timeout = self.timeout;
        integration
    }
}

// ── Contexts ────────────────────────────────────────────────────────────

/// A `github` context for the given repository.
pub fn github_context(repository: &str) -> Context {
    Context::new(json!({
        "contextType": "github",
        "page": { "repository": repository }
    }))
    .expect("valid context")
}
