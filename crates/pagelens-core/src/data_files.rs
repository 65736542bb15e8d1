//! Static data files handed to integrations untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use pagelens_config::IntegrationConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque JSON resource, passed to the integration as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub id: String,
    pub data: Value,
}

impl DataFile {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Errors from loading data files.
#[derive(Debug, thiserror::Error)]
pub enum DataFileError {
    #[error("failed to read data file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("data file '{path}' is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Source of the data files belonging to an integration.
pub trait DataFileProvider: Send + Sync {
    /// Data files for `integration`, in declaration order. Empty when none.
    fn data_files(&self, integration: &str) -> Vec<DataFile>;
}

/// Provider for deployments without data files.
pub struct NoDataFiles;

impl DataFileProvider for NoDataFiles {
    fn data_files(&self, _integration: &str) -> Vec<DataFile> {
        Vec::new()
    }
}

/// Data files read once from the paths named in each `[[integrations]]` entry.
///
/// The file stem becomes the [`DataFile::id`].
#[derive(Debug, Default)]
pub struct StaticDataFiles {
    files: HashMap<String, Vec<DataFile>>,
}

impl StaticDataFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: attach a data file to an integration.
    pub fn with(mut self, integration: impl Into<String>, file: DataFile) -> Self {
        self.files.entry(integration.into()).or_default().push(file);
        self
    }

    /// Read every data file named in the integration configs.
    pub async fn load(integrations: &[IntegrationConfig]) -> Result<Self, DataFileError> {
        let mut provider = Self::new();
        for integration in integrations {
            for path in &integration.data_files {
                let file = read_data_file(Path::new(path)).await?;
                tracing::debug!(integration = %integration.name, id = %file.id, "Data file loaded");
                provider = provider.with(&integration.name, file);
            }
        }
        Ok(provider)
    }
}

impl DataFileProvider for StaticDataFiles {
    fn data_files(&self, integration: &str) -> Vec<DataFile> {
        self.files.get(integration).cloned().unwrap_or_default()
    }
}

async fn read_data_file(path: &Path) -> Result<DataFile, DataFileError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DataFileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
    let data = serde_json::from_str(&text).map_err(|e| DataFileError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(DataFile { id, data })
}
