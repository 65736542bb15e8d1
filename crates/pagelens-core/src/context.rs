//! Page context supplied by the client for each request.
//!
//! A [`Context`] is a JSON object with a mandatory `contextType` string and an
//! arbitrary tree of string/number/boolean leaves, addressed by dot-paths such
//! as `page.repository`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the discriminator field every context carries.
pub const CONTEXT_TYPE_FIELD: &str = "contextType";

/// Errors from context construction.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context must be a JSON object")]
    NotAnObject,

    #[error("context is missing a string `contextType` field")]
    MissingType,

    #[error("context is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The page/work-item context a user is currently viewing.
///
/// Immutable once built; every request gets a fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Context {
    context_type: String,
    root: Map<String, Value>,
}

impl Context {
    /// Build a context from a JSON value.
    pub fn new(value: Value) -> Result<Self, ContextError> {
        let Value::Object(root) = value else {
            return Err(ContextError::NotAnObject);
        };
        let context_type = match root.get(CONTEXT_TYPE_FIELD) {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(ContextError::MissingType),
        };
        Ok(Self { context_type, root })
    }

    /// Parse a context from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ContextError> {
        Self::new(serde_json::from_str(text)?)
    }

    /// The discriminator, e.g. `"github"` or `"aws"`.
    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    /// Resolve a dot-path by descending nested objects.
    ///
    /// Returns `None` when any segment is missing, when an intermediate node
    /// is not an object, or when the leaf is `null`.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        self.lookup(path).filter(|v| !v.is_null())
    }

    /// Like [`resolve`](Self::resolve), but a present `null` leaf is returned.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Project the given paths into a sorted map, with `null` for absent paths.
    ///
    /// Used to build cache keys from only the fields an integration depends on.
    pub fn project<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> BTreeMap<&'a str, Value> {
        paths
            .into_iter()
            .map(|p| (p, self.resolve(p).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Borrow the full tree.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.root
    }
}

impl TryFrom<Value> for Context {
    type Error = ContextError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Context> for Value {
    fn from(ctx: Context) -> Self {
        Value::Object(ctx.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github() -> Context {
        Context::new(json!({
            "contextType": "github",
            "page": {
                "repository": "my-org/webshop",
                "pullRequest": 42,
                "draft": false,
                "labels": null
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_context_type() {
        assert_eq!(github().context_type(), "github");
    }

    #[test]
    fn test_rejects_missing_or_non_string_type() {
        assert!(matches!(
            Context::new(json!({ "page": {} })),
            Err(ContextError::MissingType)
        ));
        assert!(matches!(
            Context::new(json!({ "contextType": 7 })),
            Err(ContextError::MissingType)
        ));
        assert!(matches!(
            Context::new(json!(["github"])),
            Err(ContextError::NotAnObject)
        ));
    }

    #[test]
    fn test_resolve_nested_paths() {
        let ctx = github();
        assert_eq!(ctx.resolve("page.repository"), Some(&json!("my-org/webshop")));
        assert_eq!(ctx.resolve("page.pullRequest"), Some(&json!(42)));
        assert_eq!(ctx.resolve("page.draft"), Some(&json!(false)));
        assert_eq!(ctx.resolve("contextType"), Some(&json!("github")));
    }

    #[test]
    fn test_resolve_absent_paths() {
        let ctx = github();
        assert_eq!(ctx.resolve("page.missing"), None);
        assert_eq!(ctx.resolve("nothing.here"), None);
        // Descending through a leaf is absent, not an error.
        assert_eq!(ctx.resolve("page.repository.owner"), None);
        assert_eq!(ctx.resolve("page.labels"), None);
        assert_eq!(ctx.resolve(""), None);
        assert_eq!(ctx.lookup("page.labels"), Some(&Value::Null));
        assert_eq!(ctx.lookup("page.missing"), None);
    }

    #[test]
    fn test_project_fills_absent_with_null() {
        let ctx = github();
        let projected = ctx.project(["page.repository", "page.nope"]);
        assert_eq!(projected["page.repository"], json!("my-org/webshop"));
        assert_eq!(projected["page.nope"], Value::Null);
    }

    #[test]
    fn test_serde_roundtrip_through_value() {
        let ctx: Context =
            serde_json::from_str(r#"{"contextType":"aws","account":"123"}"#).unwrap();
        assert_eq!(ctx.context_type(), "aws");
        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back, json!({ "contextType": "aws", "account": "123" }));

        let bad: Result<Context, _> = serde_json::from_str(r#"{"account":"123"}"#);
        assert!(bad.is_err());
    }
}
