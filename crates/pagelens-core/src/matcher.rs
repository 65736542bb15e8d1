//! Context matcher: decides whether an integration applies to a context.
//!
//! A [`MatchSpec`] names the context type it applies to and a conjunction of
//! dot-path predicates:
//!
//! ```text
//! { "page.repository": { "startsWith": "my-org/" },
//!   "page.pullRequest": { "exists": true } }
//! ```
//!
//! Matching is pure and infallible. Specs that cannot be understood are kept
//! with their defect recorded and never match; the registry logs the defect
//! once when a snapshot is built.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::context::Context;

/// Why a declared match spec could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchSpecError {
    #[error("predicate for `{path}` must be an object with exactly one key")]
    NotAPredicate { path: String },

    #[error("unknown predicate `{key}` for `{path}`")]
    UnknownPredicate { path: String, key: String },

    #[error("`startsWith` for `{path}` must be a string")]
    PrefixNotString { path: String },

    #[error("empty path in match spec")]
    EmptyPath,
}

/// A single condition on one dot-path.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Resolved value strictly equals the literal (type and value).
    Equals(Value),
    /// Resolved value is a string starting with the prefix.
    StartsWith(String),
    /// Path resolves to any non-null value.
    Exists,
}

impl Predicate {
    /// Parse the JSON form: `{"equals": V}`, `{"startsWith": "s"}`, `{"exists": true}`.
    pub fn from_json(path: &str, raw: &Value) -> Result<Self, MatchSpecError> {
        let obj = raw
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| MatchSpecError::NotAPredicate {
                path: path.to_string(),
            })?;
        let Some((key, arg)) = obj.iter().next() else {
            return Err(MatchSpecError::NotAPredicate {
                path: path.to_string(),
            });
        };
        match key.as_str() {
            "equals" => Ok(Predicate::Equals(arg.clone())),
            "startsWith" => arg
                .as_str()
                .map(|p| Predicate::StartsWith(p.to_string()))
                .ok_or_else(|| MatchSpecError::PrefixNotString {
                    path: path.to_string(),
                }),
            // The literal is not inspected: `{exists: false}` still means "exists".
            "exists" => Ok(Predicate::Exists),
            other => Err(MatchSpecError::UnknownPredicate {
                path: path.to_string(),
                key: other.to_string(),
            }),
        }
    }

    /// Resolve `path` for this predicate. `equals: null` sees a present null;
    /// every other predicate treats null as absent.
    fn lookup<'c>(&self, context: &'c Context, path: &str) -> Option<&'c Value> {
        match self {
            Predicate::Equals(Value::Null) => context.lookup(path),
            _ => context.resolve(path),
        }
    }

    /// Evaluate against an already-resolved value (`None` = absent).
    pub fn holds(&self, resolved: Option<&Value>) -> bool {
        match (self, resolved) {
            (_, None) => false,
            (Predicate::Equals(expected), Some(actual)) => expected == actual,
            (Predicate::StartsWith(prefix), Some(actual)) => actual
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            (Predicate::Exists, Some(_)) => true,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Equals(v) => write!(f, "equals {v}"),
            Predicate::StartsWith(p) => write!(f, "startsWith {p:?}"),
            Predicate::Exists => write!(f, "exists"),
        }
    }
}

/// Declarative match specification for one integration.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSpec {
    context_type: String,
    predicates: BTreeMap<String, Predicate>,
    defect: Option<MatchSpecError>,
}

impl MatchSpec {
    /// A spec matching every context of the given type.
    pub fn new(context_type: impl Into<String>) -> Self {
        Self {
            context_type: context_type.into(),
            predicates: BTreeMap::new(),
            defect: None,
        }
    }

    /// Builder: add a predicate on a dot-path.
    pub fn with(mut self, path: impl Into<String>, predicate: Predicate) -> Self {
        let path = path.into();
        if path.is_empty() && self.defect.is_none() {
            self.defect = Some(MatchSpecError::EmptyPath);
        }
        self.predicates.insert(path, predicate);
        self
    }

    /// Build a spec from declared JSON rules.
    ///
    /// Never fails: the first malformed rule is recorded as the spec's defect
    /// and the spec will never match.
    pub fn from_rules(context_type: impl Into<String>, rules: &BTreeMap<String, Value>) -> Self {
        let mut spec = Self::new(context_type);
        for (path, raw) in rules {
            if path.is_empty() {
                spec.defect.get_or_insert(MatchSpecError::EmptyPath);
                continue;
            }
            match Predicate::from_json(path, raw) {
                Ok(predicate) => {
                    spec.predicates.insert(path.clone(), predicate);
                }
                Err(e) => {
                    spec.defect.get_or_insert(e);
                }
            }
        }
        spec
    }

    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    /// The dot-paths this spec inspects, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }

    pub fn predicates(&self) -> &BTreeMap<String, Predicate> {
        &self.predicates
    }

    /// The load-time defect, if the spec could not be understood.
    pub fn defect(&self) -> Option<&MatchSpecError> {
        self.defect.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.defect.is_none()
    }

    /// Whether this spec matches the context.
    pub fn matches(&self, context: &Context) -> bool {
        matches(context, self)
    }
}

/// Evaluate a match spec against a context.
///
/// False as soon as the context type differs; otherwise every predicate must
/// hold. An empty predicate map matches any context of the right type.
pub fn matches(context: &Context, spec: &MatchSpec) -> bool {
    if context.context_type() != spec.context_type {
        return false;
    }
    if spec.defect.is_some() {
        return false;
    }
    spec.predicates
        .iter()
        .all(|(path, predicate)| predicate.holds(predicate.lookup(context, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        Context::new(value).unwrap()
    }

    fn rules(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_starts_with_scenario() {
        let spec = MatchSpec::from_rules(
            "github",
            &rules(json!({ "page.repository": { "startsWith": "my-org/" } })),
        );
        assert!(spec.is_valid());

        let hit = ctx(json!({ "contextType": "github", "page": { "repository": "my-org/webshop" } }));
        let miss = ctx(json!({ "contextType": "github", "page": { "repository": "other/x" } }));
        assert!(matches(&hit, &spec));
        assert!(!matches(&miss, &spec));
    }

    #[test]
    fn test_context_type_mismatch_always_false() {
        let context = ctx(json!({ "contextType": "aws", "page": { "repository": "my-org/a" } }));
        let specs = [
            MatchSpec::new("github"),
            MatchSpec::new("github").with("page.repository", Predicate::Exists),
            MatchSpec::new("github")
                .with("page.repository", Predicate::StartsWith("my-org/".into())),
            MatchSpec::new("github").with("page.repository", Predicate::Equals(json!("my-org/a"))),
        ];
        for spec in &specs {
            assert!(!spec.matches(&context), "{spec:?} should not match");
        }
    }

    #[test]
    fn test_empty_spec_matches_any_context_of_type() {
        let spec = MatchSpec::new("generic");
        assert!(spec.matches(&ctx(json!({ "contextType": "generic" }))));
        assert!(spec.matches(&ctx(json!({ "contextType": "generic", "x": { "y": 1 } }))));
    }

    #[test]
    fn test_equals_is_strict() {
        let spec = MatchSpec::new("github").with("page.pr", Predicate::Equals(json!(42)));
        assert!(spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": 42 } }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": "42" } }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": {} }))));

        let flag = MatchSpec::new("github").with("page.draft", Predicate::Equals(json!(false)));
        assert!(flag.matches(&ctx(json!({ "contextType": "github", "page": { "draft": false } }))));
        assert!(!flag.matches(&ctx(json!({ "contextType": "github", "page": { "draft": 0 } }))));
    }

    #[test]
    fn test_equals_null_needs_present_null() {
        let spec = MatchSpec::new("github").with("page.labels", Predicate::Equals(Value::Null));
        assert!(spec.matches(&ctx(json!({ "contextType": "github", "page": { "labels": null } }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": {} }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": { "labels": [] } }))));

        let exists = MatchSpec::new("github").with("page.labels", Predicate::Exists);
        assert!(!exists.matches(&ctx(json!({ "contextType": "github", "page": { "labels": null } }))));
    }

    #[test]
    fn test_starts_with_requires_string() {
        let spec = MatchSpec::new("github").with("page.pr", Predicate::StartsWith("4".into()));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": 42 } }))));
        assert!(spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": "42" } }))));
    }

    #[test]
    fn test_exists_ignores_literal_and_type() {
        let spec = MatchSpec::from_rules("github", &rules(json!({ "page.pr": { "exists": false } })));
        assert!(spec.is_valid());
        assert!(spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": 0 } }))));
        assert!(spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": { "n": 1 } } }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": {} }))));
        assert!(!spec.matches(&ctx(json!({ "contextType": "github", "page": { "pr": null } }))));
    }

    #[test]
    fn test_predicates_are_conjunctive() {
        let spec = MatchSpec::new("github")
            .with("page.repository", Predicate::StartsWith("my-org/".into()))
            .with("page.pr", Predicate::Exists);
        assert!(spec.matches(&ctx(
            json!({ "contextType": "github", "page": { "repository": "my-org/a", "pr": 1 } })
        )));
        assert!(!spec.matches(&ctx(
            json!({ "contextType": "github", "page": { "repository": "my-org/a" } })
        )));
    }

    #[test]
    fn test_malformed_specs_never_match() {
        let context = ctx(json!({ "contextType": "github", "page": { "repository": "my-org/a" } }));

        let unknown = MatchSpec::from_rules(
            "github",
            &rules(json!({ "page.repository": { "contains": "org" } })),
        );
        assert!(matches!(
            unknown.defect(),
            Some(MatchSpecError::UnknownPredicate { key, .. }) if key == "contains"
        ));
        assert!(!unknown.matches(&context));

        let two_keys = MatchSpec::from_rules(
            "github",
            &rules(json!({ "page.repository": { "exists": true, "equals": "x" } })),
        );
        assert!(matches!(two_keys.defect(), Some(MatchSpecError::NotAPredicate { .. })));
        assert!(!two_keys.matches(&context));

        let bad_prefix = MatchSpec::from_rules(
            "github",
            &rules(json!({ "page.repository": { "startsWith": 5 } })),
        );
        assert!(matches!(bad_prefix.defect(), Some(MatchSpecError::PrefixNotString { .. })));

        let bare = MatchSpec::from_rules("github", &rules(json!({ "page.repository": "my-org/a" })));
        assert!(!bare.is_valid());
        assert!(!bare.matches(&context));
    }

    #[test]
    fn test_matching_is_deterministic() {
        let spec = MatchSpec::new("github").with("page.repository", Predicate::Exists);
        let context = ctx(json!({ "contextType": "github", "page": { "repository": "a/b" } }));
        let first = spec.matches(&context);
        for _ in 0..10 {
            assert_eq!(spec.matches(&context), first);
        }
    }

    #[test]
    fn test_paths_sorted() {
        let spec = MatchSpec::new("github")
            .with("z.last", Predicate::Exists)
            .with("a.first", Predicate::Exists);
        assert_eq!(spec.paths().collect::<Vec<_>>(), vec!["a.first", "z.last"]);
    }

    #[test]
    fn test_predicate_display() {
        assert_eq!(Predicate::Exists.to_string(), "exists");
        assert_eq!(Predicate::StartsWith("a/".into()).to_string(), "startsWith \"a/\"");
        assert_eq!(Predicate::Equals(json!(1)).to_string(), "equals 1");
    }
}
