#![deny(unsafe_code)]

//! Procedural macros for PageLens.
//!
//! - `#[derive(Redact)]`: hide sensitive fields in Debug output

extern crate proc_macro;

mod redact;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derive macro for redacting sensitive fields in Debug output.
///
/// Fields annotated with `#[redact]` display as `[REDACTED]` in the
/// generated `Debug` implementation. `Option` fields keep their presence
/// visible: `Some([REDACTED])` or `None`.
///
/// # Example
///
/// ```ignore
/// use pagelens_macros::Redact;
///
/// #[derive(Redact)]
/// struct Credential {
///     pub scheme: String,
///     #[redact]
///     pub token: Option<String>,
/// }
/// ```
#[proc_macro_derive(Redact, attributes(redact))]
pub fn derive_redact(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    redact::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
