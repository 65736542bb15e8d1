//! Fuzz target for result-item validation.
//!
//! Run with: cargo +nightly fuzz run fuzz_item_validation
//!
//! Any JSON value an integration returns must either be rejected as a whole
//! or split into accepted and rejected items, without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pagelens_core::items::validate_items;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    if let Ok(validated) = validate_items(value) {
        for item in &validated.items {
            assert!(item.items.iter().all(|child| child.items.is_empty()));
        }
    }
});
