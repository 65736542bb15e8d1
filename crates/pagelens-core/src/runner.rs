//! Runs one integration's logic under a deadline and turns whatever happens
//! into an [`ExecutionOutcome`].
//!
//! The runner never propagates an error. Missing secrets, panics, timeouts,
//! sandbox failures and malformed output all become outcomes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::context::Context;
use crate::data_files::DataFile;
use crate::integration::{Integration, Invocation, LogicError};
use crate::isolation::IsolationError;
use crate::items::{ResultItem, validate_items};
use crate::secrets::ScopedSecrets;

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RuntimeError,
    InvalidResultShape,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::RuntimeError => write!(f, "runtime_error"),
            ErrorKind::InvalidResultShape => write!(f, "invalid_result_shape"),
        }
    }
}

/// Result of running one integration once.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success {
        items: Vec<ResultItem>,
        duration_ms: u64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        duration_ms: u64,
    },
}

impl ExecutionOutcome {
    /// Items to merge into the response; empty unless `Success`.
    pub fn items(&self) -> &[ResultItem] {
        match self {
            ExecutionOutcome::Success { items, .. } => items,
            _ => &[],
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::Skipped { .. } => "skipped",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    fn failed(kind: ErrorKind, message: impl Into<String>, elapsed: Duration) -> Self {
        ExecutionOutcome::Failed {
            kind,
            message: message.into(),
            duration_ms: millis(elapsed),
        }
    }
}

/// Reason string for a skip caused by an absent secret.
pub fn missing_secret_reason(name: &str) -> String {
    format!("missing-secret:{name}")
}

/// Executes integration logic with bounded process-wide concurrency.
#[derive(Clone)]
pub struct Runner {
    permits: Arc<Semaphore>,
    max_items: usize,
}

impl Runner {
    /// `max_concurrent` executions at once; `max_items` truncates each
    /// success (0 = unlimited).
    pub fn new(max_concurrent: usize, max_items: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_items,
        }
    }

    /// Run `integration` once against the given inputs.
    ///
    /// The deadline is absolute. It comes from the integration timeout, and
    /// for uncached integrations also from the request deadline.
    pub async fn execute(
        &self,
        integration: &Integration,
        context: &Context,
        secrets: ScopedSecrets,
        data_files: Vec<DataFile>,
        deadline: Instant,
    ) -> ExecutionOutcome {
        let name = integration.name.as_str();

        if let Some(missing) = secrets.first_missing() {
            tracing::debug!(integration = %name, secret = %missing, "Skipping: required secret absent");
            return ExecutionOutcome::Skipped {
                reason: missing_secret_reason(missing),
            };
        }

        let start = Instant::now();
        let timeout_message = || format!("'{name}' did not finish before its deadline");

        let Ok(permit) = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await
        else {
            return ExecutionOutcome::failed(ErrorKind::Timeout, timeout_message(), start.elapsed());
        };
        let Ok(permit) = permit else {
            return ExecutionOutcome::failed(ErrorKind::RuntimeError, "runner shut down", start.elapsed());
        };

        let invocation = Invocation {
            integration: name.to_string(),
            context: context.clone(),
            secrets,
            data_files,
        };
        let logic = Arc::clone(&integration.logic);
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            logic.invoke(invocation).await
        });

        let joined = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                let outcome = ExecutionOutcome::failed(ErrorKind::Timeout, timeout_message(), start.elapsed());
                log_outcome(name, &outcome);
                return outcome;
            }
        };
        let elapsed = start.elapsed();

        let outcome = match joined {
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("'{name}' panicked")
                } else {
                    format!("'{name}' was cancelled")
                };
                ExecutionOutcome::failed(ErrorKind::RuntimeError, message, elapsed)
            }
            Ok(Err(LogicError::Isolation(IsolationError::Timeout(_)))) => {
                ExecutionOutcome::failed(ErrorKind::Timeout, timeout_message(), elapsed)
            }
            Ok(Err(e)) => ExecutionOutcome::failed(ErrorKind::RuntimeError, e.to_string(), elapsed),
            Ok(Ok(raw)) => match validate_items(raw) {
                Err(e) => ExecutionOutcome::failed(ErrorKind::InvalidResultShape, e.to_string(), elapsed),
                Ok(validated) => {
                    for rejected in &validated.rejected {
                        tracing::warn!(
                            integration = %name,
                            item = %rejected.path,
                            reason = %rejected.reason,
                            "Dropping malformed result item"
                        );
                    }
                    let mut items = validated.items;
                    if self.max_items > 0 && items.len() > self.max_items {
                        tracing::debug!(integration = %name, returned = items.len(), kept = self.max_items, "Truncating items");
                        items.truncate(self.max_items);
                    }
                    ExecutionOutcome::Success {
                        items,
                        duration_ms: millis(elapsed),
                    }
                }
            },
        };
        log_outcome(name, &outcome);
        outcome
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(16, 0)
    }
}

fn log_outcome(name: &str, outcome: &ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Success { items, duration_ms } => tracing::debug!(
            integration = %name,
            outcome = "success",
            items = items.len(),
            duration_ms,
            "Integration executed"
        ),
        ExecutionOutcome::Failed {
            kind,
            message,
            duration_ms,
        } => tracing::warn!(
            integration = %name,
            outcome = "failed",
            kind = %kind,
            duration_ms,
            error = %message,
            "Integration failed"
        ),
        ExecutionOutcome::Skipped { .. } => {}
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
