//! Engine test helpers.
//!
//! Build an [`Engine`] from a TOML string via a temporary config file, the
//! same way the CLI does.

use std::path::PathBuf;

use pagelens_config::AppConfig;
use pagelens_core::Engine;
use tempfile::TempDir;

/// A test-scoped engine with an owned temp directory.
///
/// The directory (config file plus any data files written next to it) is
/// deleted when this value is dropped.
pub struct TestEngine {
    pub engine: Engine,
    pub config: AppConfig,
    pub config_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Build an engine from the given TOML.
    ///
    /// `{dir}` in the TOML is replaced by the temp directory path, so data
    /// files written with [`write_file`] can be referenced.
    pub async fn with_toml(toml_content: &str, files: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        for (name, content) in files {
            write_file(&temp_dir, name, content).await;
        }

        let config_path = temp_dir.path().join("pagelens.toml");
        let rendered = toml_content.replace("{dir}", &temp_dir.path().display().to_string());
        tokio::fs::write(&config_path, rendered)
            .await
            .expect("failed to write test config");

        let config = AppConfig::load(&config_path)
            .await
            .expect("failed to parse test config");
        let engine = Engine::from_config(&config)
            .await
            .expect("failed to build engine");

        Self {
            engine,
            config,
            config_path,
            _temp_dir: temp_dir,
        }
    }
}

/// Write a file into the temp directory.
pub async fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, content)
        .await
        .expect("failed to write test file");
    path
}
