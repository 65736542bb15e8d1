//! Fuzz target for match-spec construction and evaluation.
//!
//! Run with: cargo +nightly fuzz run fuzz_match_eval
//!
//! The first byte splits the input into a JSON object of match rules and a
//! JSON context. Neither building the spec nor evaluating it may panic.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use pagelens_core::{Context, MatchSpec};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let split = (data[0] as usize % (data.len() - 1)) + 1;
    let (Ok(rules), Ok(context)) = (
        std::str::from_utf8(&data[1..split]),
        std::str::from_utf8(&data[split..]),
    ) else {
        return;
    };

    let Ok(rules) = serde_json::from_str::<BTreeMap<String, Value>>(rules) else {
        return;
    };
    let Ok(context) = Context::from_json(context) else {
        return;
    };

    let spec = MatchSpec::from_rules(context.context_type().to_string(), &rules);
    let matched = spec.matches(&context);
    if matched {
        assert!(spec.is_valid());
    }
});
