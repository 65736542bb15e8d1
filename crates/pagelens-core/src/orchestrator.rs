//! Per-request entry point.
//!
//! ```text
//! credential ─► AuthCheck ─► RegistrySnapshot::matching ─► for each match, concurrently:
//!                                                             scope secrets, data files,
//!                                                             ResultCache::resolve ─► Runner
//!                             ordered merge ◄─ aggregate deadline ◄───────┘
//! ```
//!
//! One integration's failure never affects its siblings; only an auth denial
//! or an unavailable registry fails the whole request.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;

use crate::auth::{AllowAll, AuthCheck, AuthDecision, Credential};
use crate::cache::ResultCache;
use crate::context::Context;
use crate::data_files::{DataFileProvider, NoDataFiles};
use crate::integration::Integration;
use crate::items::ResultItem;
use crate::registry::{RegistryError, RegistryProvider};
use crate::runner::{ErrorKind, ExecutionOutcome, Runner};
use crate::secrets::{self, SecretProvider};

/// Whole-request failures.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("request denied: {0}")]
    AuthDenied(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to one matched integration during a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Diagnostic {
    Contributed { items: usize, duration_ms: u64 },
    Skipped { reason: String },
    Failed { kind: ErrorKind, message: String, duration_ms: u64 },
    /// Not ready when the request deadline passed; excluded from the response.
    DeadlineExceeded,
}

impl Diagnostic {
    fn from_outcome(outcome: &ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Success { items, duration_ms } => Diagnostic::Contributed {
                items: items.len(),
                duration_ms: *duration_ms,
            },
            ExecutionOutcome::Skipped { reason } => Diagnostic::Skipped {
                reason: reason.clone(),
            },
            ExecutionOutcome::Failed {
                kind,
                message,
                duration_ms,
            } => Diagnostic::Failed {
                kind: *kind,
                message: message.clone(),
                duration_ms: *duration_ms,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationReport {
    pub integration: String,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

/// Merged items plus one diagnostic per matched integration, in registry order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestReport {
    pub items: Vec<ResultItem>,
    pub integrations: Vec<IntegrationReport>,
    pub snapshot_version: u64,
}

impl RequestReport {
    pub fn diagnostic(&self, integration: &str) -> Option<&Diagnostic> {
        self.integrations
            .iter()
            .find(|r| r.integration == integration)
            .map(|r| &r.diagnostic)
    }
}

/// Request-level time limits.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    /// Aggregate limit for the whole request.
    pub request: Duration,
    /// Default per-integration limit when the integration sets none.
    pub integration: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            request: Duration::from_millis(3000),
            integration: Duration::from_millis(2000),
        }
    }
}

/// Handles requests against the current registry snapshot.
pub struct Orchestrator {
    registry: Arc<dyn RegistryProvider>,
    secrets: Arc<dyn SecretProvider>,
    data_files: Arc<dyn DataFileProvider>,
    auth: Arc<dyn AuthCheck>,
    cache: ResultCache,
    runner: Runner,
    deadlines: Deadlines,
}

impl Orchestrator {
    pub fn builder(
        registry: Arc<dyn RegistryProvider>,
        secrets: Arc<dyn SecretProvider>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            secrets,
            data_files: None,
            auth: None,
            cache: None,
            runner: None,
            deadlines: Deadlines::default(),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Items for this context, merged in registry order.
    pub async fn handle(
        &self,
        credential: &Credential,
        context: &Context,
    ) -> Result<Vec<ResultItem>, OrchestratorError> {
        Ok(self.handle_detailed(credential, context).await?.items)
    }

    /// Like [`handle`](Self::handle), with a diagnostic per matched integration.
    pub async fn handle_detailed(
        &self,
        credential: &Credential,
        context: &Context,
    ) -> Result<RequestReport, OrchestratorError> {
        let span = tracing::info_span!("request", context_type = %context.context_type());
        self.process(credential, context).instrument(span).await
    }

    async fn process(
        &self,
        credential: &Credential,
        context: &Context,
    ) -> Result<RequestReport, OrchestratorError> {
        if let AuthDecision::Deny(reason) = self.auth.check(credential).await {
            tracing::info!(reason = %reason, "Request denied");
            return Err(OrchestratorError::AuthDenied(reason));
        }

        let snapshot = self.registry.snapshot()?;
        let matched = snapshot.matching(context);
        let request_deadline = Instant::now() + self.deadlines.request;

        let resolved = join_all(matched.iter().map(|integration| {
            let resolve = self.resolve(Arc::clone(integration), context, request_deadline);
            async move { tokio::time::timeout_at(request_deadline, resolve).await.ok() }
        }))
        .await;

        let mut report = RequestReport {
            items: Vec::new(),
            integrations: Vec::with_capacity(matched.len()),
            snapshot_version: snapshot.version(),
        };
        for (integration, outcome) in matched.iter().zip(resolved) {
            let diagnostic = match outcome {
                Some(outcome) => {
                    report.items.extend_from_slice(outcome.items());
                    Diagnostic::from_outcome(&outcome)
                }
                None => {
                    tracing::warn!(
                        integration = %integration.name,
                        outcome = "deadline_exceeded",
                        "Excluded: not ready before the request deadline"
                    );
                    Diagnostic::DeadlineExceeded
                }
            };
            report.integrations.push(IntegrationReport {
                integration: integration.name.clone(),
                diagnostic,
            });
        }

        tracing::info!(
            snapshot = report.snapshot_version,
            matched = matched.len(),
            items = report.items.len(),
            "Request handled"
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        integration: Arc<Integration>,
        context: &Context,
        request_deadline: Instant,
    ) -> Arc<ExecutionOutcome> {
        let scoped = secrets::scope(self.secrets.as_ref(), &integration.required_secrets);
        let data_files = self.data_files.data_files(&integration.name);
        // A cached computation outlives this request, so only an uncached one
        // is cut at the request deadline.
        let own_deadline = Instant::now() + integration.timeout.unwrap_or(self.deadlines.integration);
        let deadline = if integration.cache_ttl.is_zero() {
            own_deadline.min(request_deadline)
        } else {
            own_deadline
        };

        let compute = {
            let runner = self.runner.clone();
            let integration = Arc::clone(&integration);
            let context = context.clone();
            let scoped = scoped.clone();
            let data_files = data_files.clone();
            move || async move {
                runner
                    .execute(&integration, &context, scoped, data_files, deadline)
                    .await
            }
        };
        self.cache
            .resolve(&integration, context, &scoped, &data_files, compute)
            .await
    }
}

/// Builder for [`Orchestrator`]. Unset parts default to allow-all auth, no
/// data files, an in-memory cache and a default runner.
pub struct OrchestratorBuilder {
    registry: Arc<dyn RegistryProvider>,
    secrets: Arc<dyn SecretProvider>,
    data_files: Option<Arc<dyn DataFileProvider>>,
    auth: Option<Arc<dyn AuthCheck>>,
    cache: Option<ResultCache>,
    runner: Option<Runner>,
    deadlines: Deadlines,
}

impl OrchestratorBuilder {
    pub fn with_auth(mut self, auth: Arc<dyn AuthCheck>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_data_files(mut self, data_files: Arc<dyn DataFileProvider>) -> Self {
        self.data_files = Some(data_files);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.deadlines.request = timeout;
        self
    }

    pub fn with_integration_timeout(mut self, timeout: Duration) -> Self {
        self.deadlines.integration = timeout;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            registry: self.registry,
            secrets: self.secrets,
            data_files: self.data_files.unwrap_or_else(|| Arc::new(NoDataFiles)),
            auth: self.auth.unwrap_or_else(|| Arc::new(AllowAll)),
            cache: self.cache.unwrap_or_else(ResultCache::in_memory),
            runner: self.runner.unwrap_or_default(),
            deadlines: self.deadlines,
        }
    }
}
