// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use freja_tools::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput};

use crate::team::Team;

/// Tool name the runtime loop intercepts to switch the current agent.
pub const TRANSFER_TOOL_NAME: &str = "transfer_task";

/// Parsed arguments of a transfer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferArgs {
    pub agent: String,
    pub task: String,
    pub expected_output: Option<String>,
}

/// Extract transfer arguments from the raw call args.
pub fn parse_transfer_args(args: &Value) -> anyhow::Result<TransferArgs> {
    let agent = args
        .get("agent")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing 'agent'"))?;
    let task = args
        .get("task")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'task'"))?;
    Ok(TransferArgs {
        agent: agent.to_string(),
        task: task.to_string(),
        expected_output: args
            .get("expected_output")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

/// Build the handoff tool for `agent_name`, or `None` when the agent has no
/// sub-agents.  The sub-agent names are baked into the schema as an enum so
/// the model cannot invent targets.
pub fn transfer_tool(team: &Team, agent_name: &str) -> Option<Tool> {
    let subs = team.sub_agents(agent_name);
    if subs.is_empty() {
        return None;
    }

    let mut lines = Vec::new();
    for sub in &subs {
        let desc = if sub.config.description.is_empty() {
            sub.config.instruction.lines().next().unwrap_or("").to_string()
        } else {
            sub.config.description.clone()
        };
        lines.push(format!("- {}: {desc}", sub.name));
    }
    let names: Vec<&str> = subs.iter().map(|a| a.name.as_str()).collect();

    let def = ToolDef::new(
        TRANSFER_TOOL_NAME,
        format!(
            "Hand the given task to another agent and continue with its result.\n\
             Available agents:\n{}",
            lines.join("\n")
        ),
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": names,
                    "description": "Name of the agent to hand the task to"
                },
                "task": {
                    "type": "string",
                    "description": "What the agent should do"
                },
                "expected_output": {
                    "type": "string",
                    "description": "What the result should look like"
                }
            },
            "required": ["agent", "task"]
        }),
    )
    .with_annotations(ToolAnnotations::read_only());

    Some(Tool::new(def, Arc::new(TransferHandler)))
}

/// The loop handles the agent switch itself; the handler only renders the
/// confirmation that becomes the tool result.
struct TransferHandler;

#[async_trait]
impl ToolHandler for TransferHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        match parse_transfer_args(&call.args) {
            Ok(args) => ToolOutput::ok(
                &call.id,
                format!("Task transferred to agent '{}'.", args.agent),
            ),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
