// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput};
use crate::toolset::{Instructable, ToolSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

/// Shared task list.  The full list snapshot rides the tool output's meta
/// payload so event consumers can render it as a plan without re-parsing
/// tool arguments.
#[derive(Default)]
pub struct TodoToolSet {
    todos: Arc<Mutex<Vec<TodoItem>>>,
}

impl TodoToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Arc<Mutex<Vec<TodoItem>>> {
        self.todos.clone()
    }
}

#[async_trait]
impl ToolSet for TodoToolSet {
    fn name(&self) -> &str {
        "todo"
    }

    async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(vec![
            Tool::new(
                ToolDef::new(
                    "todo_write",
                    "Replace the task list with the given items. \
                     Use it to plan multi-step work and to mark progress as you go.",
                    json!({
                        "type": "object",
                        "properties": {
                            "todos": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "id": { "type": "string" },
                                        "content": { "type": "string" },
                                        "status": {
                                            "type": "string",
                                            "enum": ["pending", "in_progress", "completed"]
                                        }
                                    },
                                    "required": ["id", "content", "status"]
                                }
                            }
                        },
                        "required": ["todos"]
                    }),
                )
                .with_annotations(ToolAnnotations::read_only()),
                Arc::new(TodoWriteHandler { todos: self.todos.clone() }),
            ),
            Tool::new(
                ToolDef::new(
                    "todo_read",
                    "Read the current task list.",
                    json!({ "type": "object", "properties": {} }),
                )
                .with_annotations(ToolAnnotations::read_only()),
                Arc::new(TodoReadHandler { todos: self.todos.clone() }),
            ),
        ])
    }

    fn as_instructable(&self) -> Option<&dyn Instructable> {
        Some(self)
    }
}

impl Instructable for TodoToolSet {
    fn instructions(&self) -> Option<String> {
        Some(
            "Keep the shared task list up to date with todo_write: \
             add the planned steps before starting and mark each one \
             completed as soon as it is done."
                .into(),
        )
    }
}

fn render(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "no tasks".into();
    }
    todos
        .iter()
        .map(|t| {
            let mark = match t.status {
                TodoStatus::Pending => " ",
                TodoStatus::InProgress => ">",
                TodoStatus::Completed => "x",
            };
            format!("[{mark}] {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct TodoWriteHandler {
    todos: Arc<Mutex<Vec<TodoItem>>>,
}

#[async_trait]
impl ToolHandler for TodoWriteHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let items: Vec<TodoItem> = match call
            .args
            .get("todos")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(items)) => items,
            Some(Err(e)) => return ToolOutput::err(&call.id, format!("invalid todos: {e}")),
            None => return ToolOutput::err(&call.id, "missing 'todos'"),
        };
        let mut todos = self.todos.lock().await;
        *todos = items;
        let meta = json!({ "todos": *todos });
        ToolOutput::ok(&call.id, render(&todos)).with_meta(meta)
    }
}

struct TodoReadHandler {
    todos: Arc<Mutex<Vec<TodoItem>>>,
}

#[async_trait]
impl ToolHandler for TodoReadHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let todos = self.todos.lock().await;
        let meta = json!({ "todos": *todos });
        ToolOutput::ok(&call.id, render(&todos)).with_meta(meta)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
