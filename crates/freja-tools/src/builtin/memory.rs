// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput};
use crate::toolset::ToolSet;

/// File-backed note store.  Notes accumulate in a single markdown file the
/// agent can re-read across sessions.
pub struct MemoryToolSet {
    path: PathBuf,
}

impl MemoryToolSet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ToolSet for MemoryToolSet {
    fn name(&self) -> &str {
        "memory"
    }

    async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(vec![
            Tool::new(
                ToolDef::new(
                    "memory_read",
                    "Read the saved notes.",
                    json!({ "type": "object", "properties": {} }),
                )
                .with_annotations(ToolAnnotations::read_only()),
                Arc::new(ReadHandler { path: self.path.clone() }),
            ),
            Tool::new(
                ToolDef::new(
                    "memory_write",
                    "Append a note to the saved notes. Use it for durable \
                     facts worth remembering across sessions.",
                    json!({
                        "type": "object",
                        "properties": {
                            "note": { "type": "string", "description": "The note to append" }
                        },
                        "required": ["note"]
                    }),
                ),
                Arc::new(WriteHandler { path: self.path.clone() }),
            ),
        ])
    }
}

struct ReadHandler {
    path: PathBuf,
}

#[async_trait]
impl ToolHandler for ReadHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => ToolOutput::ok(&call.id, "no notes yet"),
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ToolOutput::ok(&call.id, "no notes yet")
            }
            Err(e) => ToolOutput::err(&call.id, format!("read error: {e}")),
        }
    }
}

struct WriteHandler {
    path: PathBuf,
}

#[async_trait]
impl ToolHandler for WriteHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let note = match call.args.get("note").and_then(|v| v.as_str()) {
            Some(n) => n,
            None => return ToolOutput::err(&call.id, "missing 'note'"),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        let mut text = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("- {note}\n"));
        match tokio::fs::write(&self.path, text).await {
            Ok(()) => ToolOutput::ok(&call.id, "note saved"),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn handlers(path: &std::path::Path) -> (Tool, Tool) {
        let set = MemoryToolSet::new(path);
        let mut tools = set.tools().await.unwrap();
        let write = tools.pop().unwrap();
        let read = tools.pop().unwrap();
        (read, write)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall { id: "m1".into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn read_of_missing_file_reports_no_notes() {
        let dir = tempfile::tempdir().unwrap();
        let (read, _) = handlers(&dir.path().join("memory.md")).await;
        let out = read.handler.call(&call("memory_read", json!({}))).await;
        assert_eq!(out.content, "no notes yet");
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        let (read, write) = handlers(&path).await;

        let out = write
            .handler
            .call(&call("memory_write", json!({ "note": "prefers tabs" })))
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = read.handler.call(&call("memory_read", json!({}))).await;
        assert!(out.content.contains("- prefers tabs"));
    }

    #[tokio::test]
    async fn notes_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        let (read, write) = handlers(&path).await;

        write.handler.call(&call("memory_write", json!({ "note": "first" }))).await;
        write.handler.call(&call("memory_write", json!({ "note": "second" }))).await;
        let out = read.handler.call(&call("memory_read", json!({}))).await;
        let first = out.content.find("first").unwrap();
        let second = out.content.find("second").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn write_without_note_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, write) = handlers(&dir.path().join("memory.md")).await;
        let out = write.handler.call(&call("memory_write", json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn read_is_read_only_and_write_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let (read, write) = handlers(&dir.path().join("memory.md")).await;
        assert!(!read.def.annotations.requires_confirmation());
        assert!(write.def.annotations.requires_confirmation());
    }
}
