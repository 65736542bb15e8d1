//! Tracing initialisation helpers for tests.
//!
//! The subscriber is installed at most once per process, so every test may
//! call [`init_test_tracing`].

use tracing_subscriber::EnvFilter;

/// Install a subscriber writing to the test-harness writer, filtered by
/// `RUST_LOG` (default `info`). Later calls are ignored.
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     pagelens_test_utils::tracing_setup::init_test_tracing();
///     tracing::info!("visible when RUST_LOG=info");
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
