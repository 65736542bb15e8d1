//! Versioned, atomically published sets of integrations.
//!
//! A request takes exactly one [`RegistrySnapshot`] and uses it throughout, so
//! a concurrent [`SnapshotRegistry::publish`] never produces a mixed view.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use crate::context::Context;
use crate::integration::Integration;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("integration '{0}' declared more than once")]
    DuplicateName(String),
}

/// An immutable, versioned list of integrations in declaration order.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    integrations: Vec<Arc<Integration>>,
}

impl RegistrySnapshot {
    /// Build a snapshot. Names must be unique.
    ///
    /// Integrations whose match spec could not be understood are kept (they
    /// never match) and reported here, once.
    pub fn new(version: u64, integrations: Vec<Integration>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for integration in &integrations {
            if !seen.insert(integration.name.as_str()) {
                return Err(RegistryError::DuplicateName(integration.name.clone()));
            }
            if let Some(defect) = integration.match_spec.defect() {
                tracing::warn!(
                    integration = %integration.name,
                    error = %defect,
                    "Invalid match spec; integration will never match"
                );
            }
        }
        Ok(Self {
            version,
            integrations: integrations.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Integrations whose spec matches, in declaration order.
    pub fn matching(&self, context: &Context) -> Vec<Arc<Integration>> {
        self.integrations
            .iter()
            .filter(|i| i.match_spec.matches(context))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Integration>> {
        self.integrations.iter().find(|i| i.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Integration>> {
        self.integrations.iter()
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }
}

/// Source of registry snapshots.
pub trait RegistryProvider: Send + Sync {
    /// The current snapshot. Each call is atomic.
    fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, RegistryError>;
}

/// In-process registry; `publish` swaps in a new snapshot atomically.
pub struct SnapshotRegistry {
    current: ArcSwap<RegistrySnapshot>,
    next_version: AtomicU64,
}

impl SnapshotRegistry {
    /// An empty registry at version 0.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Replace the integration set. Returns the new snapshot version.
    ///
    /// On error the current snapshot stays in place.
    pub fn publish(&self, integrations: Vec<Integration>) -> Result<u64, RegistryError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let snapshot = RegistrySnapshot::new(version, integrations)?;
        tracing::info!(version, integrations = snapshot.len(), "Registry snapshot published");
        self.current.store(Arc::new(snapshot));
        Ok(version)
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryProvider for SnapshotRegistry {
    fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        Ok(self.current.load_full())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::integration::fn_logic;
    use crate::matcher::{MatchSpec, Predicate};

    fn integration(name: &str, spec: MatchSpec) -> Integration {
        Integration::new(name, spec, fn_logic(|_| async { Ok(json!([])) }))
    }

    fn github(repo: &str) -> Context {
        Context::new(json!({ "contextType": "github", "page": { "repository": repo } })).unwrap()
    }

    #[test]
    fn test_matching_preserves_declaration_order() {
        let snapshot = RegistrySnapshot::new(
            1,
            vec![
                integration("zeta", MatchSpec::new("github")),
                integration("aws", MatchSpec::new("aws")),
                integration(
                    "alpha",
                    MatchSpec::new("github")
                        .with("page.repository", Predicate::StartsWith("my-org/".into())),
                ),
            ],
        )
        .unwrap();

        let names: Vec<String> = snapshot
            .matching(&github("my-org/x"))
            .iter()
            .map(|i| i.name.clone())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(snapshot.matching(&github("other/x")).len(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = RegistrySnapshot::new(
            1,
            vec![
                integration("jira", MatchSpec::new("github")),
                integration("jira", MatchSpec::new("aws")),
            ],
        );
        assert!(matches!(result, Err(RegistryError::DuplicateName(name)) if name == "jira"));
    }

    #[test]
    fn test_invalid_spec_kept_but_never_matches() {
        let mut rules = BTreeMap::new();
        rules.insert("page.repository".to_string(), json!({ "regex": ".*" }));
        let snapshot = RegistrySnapshot::new(
            1,
            vec![integration("broken", MatchSpec::from_rules("github", &rules))],
        )
        .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.matching(&github("a/b")).is_empty());
    }

    #[test]
    fn test_publish_swaps_atomically() {
        let registry = SnapshotRegistry::new();
        let before = registry.snapshot().unwrap();
        assert_eq!(before.version(), 0);
        assert!(before.is_empty());

        let v1 = registry
            .publish(vec![integration("one", MatchSpec::new("github"))])
            .unwrap();
        let held = registry.snapshot().unwrap();

        let v2 = registry
            .publish(vec![
                integration("one", MatchSpec::new("github")),
                integration("two", MatchSpec::new("github")),
            ])
            .unwrap();
        assert!(v2 > v1);

        // A snapshot taken earlier is unaffected by later publishes.
        assert_eq!(held.version(), v1);
        assert_eq!(held.len(), 1);
        assert_eq!(registry.snapshot().unwrap().len(), 2);
        assert!(registry.snapshot().unwrap().get("two").is_some());
    }

    #[test]
    fn test_failed_publish_keeps_current() {
        let registry = SnapshotRegistry::new();
        registry
            .publish(vec![integration("one", MatchSpec::new("github"))])
            .unwrap();
        let result = registry.publish(vec![
            integration("dup", MatchSpec::new("github")),
            integration("dup", MatchSpec::new("github")),
        ]);
        assert!(result.is_err());
        assert!(registry.snapshot().unwrap().get("one").is_some());
    }
}
