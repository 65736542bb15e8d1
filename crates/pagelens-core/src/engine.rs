//! Assemble a ready-to-serve [`Orchestrator`] from an [`AppConfig`].

use std::sync::Arc;

use pagelens_config::AppConfig;

use crate::auth::{self, Credential};
use crate::context::Context;
use crate::data_files::{DataFileError, StaticDataFiles};
use crate::integration::Integration;
use crate::isolation::{self, IsolationError};
use crate::items::ResultItem;
use crate::orchestrator::{Orchestrator, OrchestratorError, RequestReport};
use crate::registry::{RegistryError, RegistryProvider, RegistrySnapshot, SnapshotRegistry};
use crate::runner::Runner;
use crate::secrets::{ConfiguredSecrets, SecretError, SecretProvider};

/// Errors while building the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("secrets: {0}")]
    Secrets(#[from] SecretError),

    #[error("data files: {0}")]
    DataFiles(#[from] DataFileError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("isolation: {0}")]
    Isolation(#[from] IsolationError),
}

/// A configured orchestrator together with the handles needed to refresh it.
pub struct Engine {
    orchestrator: Orchestrator,
    registry: Arc<SnapshotRegistry>,
    secrets: Arc<ConfiguredSecrets>,
}

impl Engine {
    /// Load secrets and data files, publish the integrations and wire up the
    /// orchestrator.
    pub async fn from_config(config: &AppConfig) -> Result<Self, EngineError> {
        let backend = isolation::select_backend(&config.isolation)?;

        let secrets = Arc::new(ConfiguredSecrets::new(config.secrets.clone()));
        secrets.load().await?;

        let data_files = StaticDataFiles::load(&config.integrations).await?;

        let registry = Arc::new(SnapshotRegistry::new());
        registry.publish(
            config
                .integrations
                .iter()
                .map(|i| Integration::from_config(i, &config.isolation, Arc::clone(&backend)))
                .collect(),
        )?;

        let secret_provider: Arc<dyn SecretProvider> = secrets.clone();
        let orchestrator = Orchestrator::builder(registry.clone(), Arc::clone(&secret_provider))
            .with_auth(auth::from_config(&config.auth, secret_provider))
            .with_data_files(Arc::new(data_files))
            .with_runner(Runner::new(
                config.engine.max_concurrent_executions,
                config.engine.max_items_per_integration,
            ))
            .with_request_timeout(config.engine.request_timeout())
            .with_integration_timeout(config.engine.integration_timeout())
            .build();

        tracing::info!(
            integrations = config.integrations.len(),
            secrets = secrets.loaded(),
            backend = %config.isolation.backend,
            "Engine ready"
        );

        Ok(Self {
            orchestrator,
            registry,
            secrets,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The snapshot currently served.
    pub fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        self.registry.snapshot()
    }

    /// Replace the integration set atomically.
    pub fn publish(&self, integrations: Vec<Integration>) -> Result<u64, RegistryError> {
        self.registry.publish(integrations)
    }

    /// Re-read every configured secret.
    pub async fn refresh_secrets(&self) -> Result<(), SecretError> {
        self.secrets.refresh().await
    }

    pub async fn handle(
        &self,
        credential: &Credential,
        context: &Context,
    ) -> Result<Vec<ResultItem>, OrchestratorError> {
        self.orchestrator.handle(credential, context).await
    }

    pub async fn handle_detailed(
        &self,
        credential: &Credential,
        context: &Context,
    ) -> Result<RequestReport, OrchestratorError> {
        self.orchestrator.handle_detailed(credential, context).await
    }
}
