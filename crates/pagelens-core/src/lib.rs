#![deny(unsafe_code)]

//! PageLens integration execution engine.
//!
//! Decides which registered integrations apply to the page context a user is
//! looking at, runs them inside an isolation boundary with least-privilege
//! secrets, memoizes their output, and merges everything into one ordered
//! list of widgets for the client overlay.

use std::future::Future;
use std::pin::Pin;

/// Boxed `Send` future returned by the async methods of object-safe traits
/// (`SecretProvider`, `AuthCheck`, `IntegrationLogic`, `SandboxBackend`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request authentication gate.
pub mod auth;
/// Fingerprinted result cache with single-flight de-duplication.
pub mod cache;
/// Page context tree and dot-path resolution.
pub mod context;
/// Static data files handed to integrations.
pub mod data_files;
/// Wiring of a full engine from configuration.
pub mod engine;
/// Integration definitions and their executable logic.
pub mod integration;
/// Process isolation backends for command integrations.
pub mod isolation;
/// Widget items produced by integrations, with shape validation.
pub mod items;
/// Context matcher.
pub mod matcher;
/// Per-request fan-out, deadline, and merge.
pub mod orchestrator;
/// Immutable registry snapshots.
pub mod registry;
/// Runs one integration under a deadline.
pub mod runner;
/// Secret providers and least-privilege scoping.
pub mod secrets;

pub use auth::{AllowAll, AuthCheck, AuthDecision, Credential, DenyAll, TokenAuth};
pub use cache::{CacheError, CacheStore, CachedOutcome, Fingerprint, MemoryStore, ResultCache};
pub use context::{Context, ContextError};
pub use data_files::{DataFile, DataFileProvider, NoDataFiles, StaticDataFiles};
pub use engine::{Engine, EngineError};
pub use integration::{CommandLogic, Integration, IntegrationLogic, Invocation, LogicError, fn_logic};
pub use items::{ItemKind, ItemStatus, ResultItem};
pub use matcher::{MatchSpec, MatchSpecError, Predicate, matches};
pub use orchestrator::{Diagnostic, Orchestrator, OrchestratorError, RequestReport};
pub use registry::{RegistryProvider, RegistrySnapshot, SnapshotRegistry};
pub use runner::{ErrorKind, ExecutionOutcome, Runner};
pub use secrets::{ConfiguredSecrets, ScopedSecrets, SecretError, SecretProvider, SecretStore, SecretValue, scope};
