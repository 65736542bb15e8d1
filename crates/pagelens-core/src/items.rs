//! Result items contributed by integrations, and validation of raw output.
//!
//! Integration logic returns untrusted JSON. [`validate_items`] turns it into
//! typed [`ResultItem`]s, dropping (and reporting) individual malformed items
//! rather than failing the whole batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rendering kind of a result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Text,
    Link,
    Dropdown,
}

impl ItemKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ItemKind::Text),
            "link" => Some(ItemKind::Link),
            "dropdown" => Some(ItemKind::Dropdown),
            _ => None,
        }
    }
}

/// Visual emphasis of a result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Neutral,
    Relevant,
    Important,
    Success,
}

impl ItemStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "neutral" => Some(ItemStatus::Neutral),
            "relevant" => Some(ItemStatus::Relevant),
            "important" => Some(ItemStatus::Important),
            "success" => Some(ItemStatus::Success),
            _ => None,
        }
    }
}

/// One renderable entry returned by an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    /// Children, only for dropdowns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ResultItem>,
}

impl ResultItem {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Text,
            content: content.into(),
            href: None,
            icon: None,
            status: None,
            items: Vec::new(),
        }
    }

    pub fn link(content: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Link,
            href: Some(href.into()),
            ..Self::text(content)
        }
    }

    pub fn dropdown(content: impl Into<String>, items: Vec<ResultItem>) -> Self {
        Self {
            kind: ItemKind::Dropdown,
            items,
            ..Self::text(content)
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

// ── Validation ──────────────────────────────────────────────────────────

/// The whole return value was unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("expected a JSON array of items, got {0}")]
    NotAnArray(&'static str),
}

/// Why a single item was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemShapeError {
    #[error("item is not an object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("unknown item type `{0}`")]
    UnknownKind(String),

    #[error("unknown status `{0}`")]
    UnknownStatus(String),

    #[error("dropdown items cannot contain dropdowns")]
    NestedDropdown,

    #[error("link item requires `href`")]
    MissingHref,
}

/// An item that failed validation.
///
/// `path` locates it in the returned array: `"2"` for a top-level element,
/// `"2.items.0"` for a dropdown child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub path: String,
    pub reason: ItemShapeError,
}

impl fmt::Display for RejectedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item {}: {}", self.path, self.reason)
    }
}

/// Outcome of validating an integration's raw return value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedItems {
    pub items: Vec<ResultItem>,
    pub rejected: Vec<RejectedItem>,
}

/// Validate an integration's raw return value.
///
/// Anything other than an array is a [`ShapeError`]. Inside an array, each
/// malformed element is dropped and listed in `rejected`; the rest keep
/// their order. The same applies to dropdown children, one level down.
pub fn validate_items(raw: Value) -> Result<ValidatedItems, ShapeError> {
    let Value::Array(elements) = raw else {
        return Err(ShapeError::NotAnArray(json_type(&raw)));
    };
    let mut out = ValidatedItems::default();
    for (index, element) in elements.iter().enumerate() {
        let path = index.to_string();
        match parse_item(element, false, &path, &mut out.rejected) {
            Ok(item) => out.items.push(item),
            Err(reason) => out.rejected.push(RejectedItem { path, reason }),
        }
    }
    Ok(out)
}

/// Parse one item. `nested` is set for dropdown children.
fn parse_item(
    raw: &Value,
    nested: bool,
    path: &str,
    rejected: &mut Vec<RejectedItem>,
) -> Result<ResultItem, ItemShapeError> {
    let obj = raw.as_object().ok_or(ItemShapeError::NotAnObject)?;

    let kind_str = required_str(obj, "type")?;
    let kind =
        ItemKind::parse(kind_str).ok_or_else(|| ItemShapeError::UnknownKind(kind_str.to_string()))?;
    let content = required_str(obj, "content")?.to_string();
    let href = optional_str(obj, "href")?.map(str::to_string);
    let icon = optional_str(obj, "icon")?.map(str::to_string);
    let status = match optional_str(obj, "status")? {
        Some(s) => Some(ItemStatus::parse(s).ok_or_else(|| ItemShapeError::UnknownStatus(s.to_string()))?),
        None => None,
    };

    let mut item = ResultItem {
        kind,
        content,
        href,
        icon,
        status,
        items: Vec::new(),
    };

    match kind {
        ItemKind::Link if item.href.is_none() => return Err(ItemShapeError::MissingHref),
        ItemKind::Dropdown if nested => return Err(ItemShapeError::NestedDropdown),
        ItemKind::Dropdown => {
            let children = match obj.get("items") {
                Some(Value::Array(children)) => children,
                Some(_) => return Err(ItemShapeError::WrongType("items")),
                None => return Err(ItemShapeError::MissingField("items")),
            };
            for (index, child) in children.iter().enumerate() {
                let child_path = format!("{path}.items.{index}");
                match parse_item(child, true, &child_path, rejected) {
                    Ok(parsed) => item.items.push(parsed),
                    Err(reason) => rejected.push(RejectedItem {
                        path: child_path,
                        reason,
                    }),
                }
            }
        }
        _ => {}
    }
    Ok(item)
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ItemShapeError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ItemShapeError::WrongType(field)),
        None => Err(ItemShapeError::MissingField(field)),
    }
}

fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ItemShapeError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ItemShapeError::WrongType(field)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
