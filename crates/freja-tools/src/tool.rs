// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation, arguments already parsed.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier issued by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub args: Value,
}

/// Behaviour hints attached to a tool definition.
///
/// Absent hints mean "unknown"; consumers fall back to conservative
/// defaults (confirm before running) or to name-based classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

impl ToolAnnotations {
    pub fn read_only() -> Self {
        Self { read_only_hint: Some(true), ..Default::default() }
    }

    pub fn destructive() -> Self {
        Self { destructive_hint: Some(true), ..Default::default() }
    }

    /// Whether a call must be confirmed by the user under an asking policy:
    /// anything destructive, and anything not known to be read-only.
    pub fn requires_confirmation(&self) -> bool {
        self.destructive_hint.unwrap_or(false) || !self.read_only_hint.unwrap_or(false)
    }
}

/// Declarative half of a tool: everything the model and the client see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object, already normalized
    /// (see [`crate::schema::normalize_parameters`]).
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: crate::schema::normalize_parameters(parameters),
            output_schema: None,
            annotations: ToolAnnotations::default(),
        }
    }

    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = annotations;
        self
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally (the message is the error body).
    pub is_error: bool,
    /// Structured side payload forwarded verbatim to event consumers
    /// (e.g. the todo list snapshot that becomes a plan update).
    pub meta: Option<Value>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            meta: None,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Executable half of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the call.  Failures should be expressed as
    /// [`ToolOutput::err`]; a returned `Err` is treated the same way by the
    /// runtime but loses any structured detail.
    async fn call(&self, call: &ToolCall) -> ToolOutput;
}

/// A complete tool: definition plus handler.
#[derive(Clone)]
pub struct Tool {
    pub def: ToolDef,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(def: ToolDef, handler: Arc<dyn ToolHandler>) -> Self {
        Self { def, handler }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("def", &self.def).finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn def_normalizes_parameters() {
        let def = ToolDef::new("t", "d", json!({}));
        assert_eq!(def.parameters["type"], "object");
        assert!(def.parameters["properties"].is_object());
    }

    #[test]
    fn read_only_does_not_require_confirmation() {
        assert!(!ToolAnnotations::read_only().requires_confirmation());
    }

    #[test]
    fn destructive_requires_confirmation() {
        assert!(ToolAnnotations::destructive().requires_confirmation());
    }

    #[test]
    fn unknown_hints_require_confirmation() {
        assert!(ToolAnnotations::default().requires_confirmation());
    }

    #[test]
    fn destructive_wins_even_if_marked_read_only() {
        let a = ToolAnnotations {
            read_only_hint: Some(true),
            destructive_hint: Some(true),
            ..Default::default()
        };
        assert!(a.requires_confirmation());
    }

    #[test]
    fn output_ok_and_err() {
        let ok = ToolOutput::ok("c", "fine");
        assert!(!ok.is_error);
        let err = ToolOutput::err("c", "broken");
        assert!(err.is_error);
        assert_eq!(err.content, "broken");
    }

    #[test]
    fn output_meta_attaches() {
        let out = ToolOutput::ok("c", "x").with_meta(json!({"todos": []}));
        assert!(out.meta.unwrap()["todos"].is_array());
    }

    #[test]
    fn annotations_serde_skips_absent_hints() {
        let json = serde_json::to_string(&ToolAnnotations::read_only()).unwrap();
        assert!(json.contains("read_only_hint"));
        assert!(!json.contains("destructive_hint"), "{json}");
    }
}
