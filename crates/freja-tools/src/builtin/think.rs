// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput};
use crate::toolset::ToolSet;

/// Reasoning scratchpad.  The tool does nothing except hand the thought
/// back, which is enough: writing it forces the model to articulate the
/// plan, and the transcript keeps it for later turns.
#[derive(Default)]
pub struct ThinkToolSet;

#[async_trait]
impl ToolSet for ThinkToolSet {
    fn name(&self) -> &str {
        "think"
    }

    async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(vec![Tool::new(
            ToolDef::new(
                "think",
                "Think about something without taking any action. \
                 Use it to reason through a problem, weigh options, or plan \
                 next steps before committing to them.",
                json!({
                    "type": "object",
                    "properties": {
                        "thought": { "type": "string", "description": "The thought to record" }
                    },
                    "required": ["thought"]
                }),
            )
            .with_annotations(ToolAnnotations::read_only()),
            Arc::new(ThinkHandler),
        )])
    }
}

struct ThinkHandler;

#[async_trait]
impl ToolHandler for ThinkHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        match call.args.get("thought").and_then(|v| v.as_str()) {
            Some(thought) => ToolOutput::ok(&call.id, thought),
            None => ToolOutput::err(&call.id, "missing 'thought'"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn think_echoes_the_thought() {
        let tools = ThinkToolSet.tools().await.unwrap();
        let out = tools[0]
            .handler
            .call(&ToolCall {
                id: "c".into(),
                name: "think".into(),
                args: json!({ "thought": "first read, then edit" }),
            })
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "first read, then edit");
    }

    #[tokio::test]
    async fn think_is_read_only() {
        let tools = ThinkToolSet.tools().await.unwrap();
        assert_eq!(tools[0].def.annotations.read_only_hint, Some(true));
    }

    #[tokio::test]
    async fn missing_thought_is_error() {
        let tools = ThinkToolSet.tools().await.unwrap();
        let out = tools[0]
            .handler
            .call(&ToolCall { id: "c".into(), name: "think".into(), args: json!({}) })
            .await;
        assert!(out.is_error);
    }
}
