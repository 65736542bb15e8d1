//! Result cache: fingerprinted TTL memoization with global single-flight.
//!
//! Every lookup goes through one `claim_or_join` step under a single lock:
//!
//! - a computation already in flight for the fingerprint → subscribe to it;
//! - a live stored entry → return it;
//! - otherwise → claim the fingerprint and spawn the computation as a
//!   detached task.
//!
//! The detached task always runs to completion and stores its outcome, even
//! if every caller that was waiting on it has gone away.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::context::Context;
use crate::data_files::DataFile;
use crate::integration::Integration;
use crate::runner::{ErrorKind, ExecutionOutcome};
use crate::secrets::ScopedSecrets;

// ── Fingerprint ─────────────────────────────────────────────────────────

/// Cache key: SHA-256 (hex) over everything that can change an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint one execution.
    ///
    /// Covers the integration name and context type, the context fields the
    /// integration depends on, which scoped secrets are present (never their
    /// values), and the data files.
    ///
    /// Without a `cache_key` the whole context is covered. A declared
    /// `cache_key` narrows it to the match paths plus the `cache_key` paths.
    pub fn compute(
        integration: &Integration,
        context: &Context,
        secrets: &ScopedSecrets,
        data_files: &[DataFile],
    ) -> Self {
        let presence: Vec<Value> = secrets
            .presence()
            .map(|(name, present)| json!([name, present]))
            .collect();
        let material = json!({
            "integration": integration.name,
            "contextType": context.context_type(),
            "fields": relevant_fields(integration, context),
            "secrets": presence,
            "dataFiles": data_files,
        });

        let mut hasher = Sha256::new();
        hasher.update(material.to_string().as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn relevant_fields(integration: &Integration, context: &Context) -> Value {
    if integration.cache_key.is_empty() {
        Value::Object(context.as_map().clone())
    } else {
        json!(context.project(integration.relevant_paths()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Storage ─────────────────────────────────────────────────────────────

/// A stored outcome and when it stops being served.
#[derive(Debug, Clone)]
pub struct CachedOutcome {
    pub outcome: Arc<ExecutionOutcome>,
    pub expires_at: Instant,
}

impl CachedOutcome {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Errors from a cache storage backend. The cache fails open on all of them.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store lock poisoned")]
    Poisoned,

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Storage behind the result cache.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &Fingerprint) -> Result<Option<CachedOutcome>, CacheError>;
    fn put(&self, key: Fingerprint, entry: CachedOutcome) -> Result<(), CacheError>;
    fn remove(&self, key: &Fingerprint) -> Result<(), CacheError>;
}

/// In-process cache store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Fingerprint, CachedOutcome>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &Fingerprint) -> Result<Option<CachedOutcome>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: Fingerprint, entry: CachedOutcome) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key, entry);
        Ok(())
    }

    fn remove(&self, key: &Fingerprint) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

// ── Result cache ────────────────────────────────────────────────────────

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from a live entry.
    pub hits: u64,
    /// Claimed a fingerprint and started a computation.
    pub misses: u64,
    /// Joined a computation started by someone else.
    pub joins: u64,
}

type OutcomeSlot = watch::Receiver<Option<Arc<ExecutionOutcome>>>;

enum Claim {
    Ready(Arc<ExecutionOutcome>),
    Join(OutcomeSlot),
    Claimed(watch::Sender<Option<Arc<ExecutionOutcome>>>, OutcomeSlot),
}

struct Inner {
    store: Arc<dyn CacheStore>,
    in_flight: Mutex<HashMap<Fingerprint, OutcomeSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
}

/// Memoizes execution outcomes per fingerprint.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                in_flight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                joins: AtomicU64::new(0),
            }),
        }
    }

    /// A cache backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            joins: self.inner.joins.load(Ordering::Relaxed),
        }
    }

    /// Return the outcome for this execution, computing it at most once per
    /// fingerprint across all concurrent callers.
    ///
    /// With a zero TTL the cache is bypassed and `compute` always runs.
    pub async fn resolve<F, Fut>(
        &self,
        integration: &Integration,
        context: &Context,
        secrets: &ScopedSecrets,
        data_files: &[DataFile],
        compute: F,
    ) -> Arc<ExecutionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExecutionOutcome> + Send + 'static,
    {
        let ttl = integration.cache_ttl;
        if ttl.is_zero() {
            return Arc::new(compute().await);
        }

        let key = Fingerprint::compute(integration, context, secrets, data_files);
        let slot = match self.inner.claim_or_join(&key) {
            Claim::Ready(outcome) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(integration = %integration.name, outcome = outcome.label(), "Cache hit");
                return outcome;
            }
            Claim::Join(slot) => {
                self.inner.joins.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(integration = %integration.name, "Joining in-flight computation");
                slot
            }
            Claim::Claimed(tx, slot) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(integration = %integration.name, fingerprint = %key, "Cache miss");
                let inner = Arc::clone(&self.inner);
                let computation = compute();
                tokio::spawn(async move {
                    let outcome = match AssertUnwindSafe(computation).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => ExecutionOutcome::Failed {
                            kind: ErrorKind::RuntimeError,
                            message: "computation panicked".to_string(),
                            duration_ms: 0,
                        },
                    };
                    inner.complete(key, Arc::new(outcome), ttl, tx);
                });
                slot
            }
        };

        wait(slot).await
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<Fingerprint, OutcomeSlot>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim_or_join(&self, key: &Fingerprint) -> Claim {
        let mut in_flight = self.in_flight();
        if let Some(slot) = in_flight.get(key) {
            return Claim::Join(slot.clone());
        }

        match self.store.get(key) {
            Ok(Some(entry)) if entry.is_live(Instant::now()) => return Claim::Ready(entry.outcome),
            Ok(Some(_)) => {
                if let Err(e) = self.store.remove(key) {
                    tracing::warn!(error = %e, "Failed to evict expired cache entry");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Cache read failed; treating as miss"),
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.clone(), rx.clone());
        Claim::Claimed(tx, rx)
    }

    /// Store the outcome, release the fingerprint, then wake every waiter.
    fn complete(
        &self,
        key: Fingerprint,
        outcome: Arc<ExecutionOutcome>,
        ttl: Duration,
        tx: watch::Sender<Option<Arc<ExecutionOutcome>>>,
    ) {
        let entry = CachedOutcome {
            outcome: Arc::clone(&outcome),
            expires_at: Instant::now() + ttl,
        };
        if let Err(e) = self.store.put(key.clone(), entry) {
            tracing::warn!(error = %e, "Cache write failed; outcome not stored");
        }
        self.in_flight().remove(&key);
        tx.send_replace(Some(outcome));
    }
}

async fn wait(mut slot: OutcomeSlot) -> Arc<ExecutionOutcome> {
    let outcome = slot
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|value| (*value).clone());
    outcome.unwrap_or_else(|| {
        Arc::new(ExecutionOutcome::Failed {
            kind: ErrorKind::RuntimeError,
            message: "cached computation was abandoned".to_string(),
            duration_ms: 0,
        })
    })
}
