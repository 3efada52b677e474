// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

/// Normalize a tool parameter schema into the shape every backend accepts.
///
/// Some backends reject schemas whose top level omits `type` or
/// `properties`; external servers emit both shapes freely.  Non-object
/// inputs are replaced with the empty object schema.
pub fn normalize_parameters(schema: Value) -> Value {
    let mut obj = match schema {
        Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    obj.entry("type").or_insert_with(|| json!("object"));
    obj.entry("properties").or_insert_with(|| json!({}));
    Value::Object(obj)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
