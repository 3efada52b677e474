// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use freja_model::ToolCall;
use freja_tools::ToolDef;

/// Events emitted by the runtime during one turn.  Consumers (the client
/// bridge, tests) subscribe to these to drive their output; events for one
/// session are totally ordered.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A fragment of answer text, emitted as deltas arrive.
    Choice(String),
    /// A fragment of reasoning text.
    ChoiceReasoning(String),
    /// A tool call awaits user consent; the loop is paused until a
    /// [`ResumeRequest`] arrives.
    ToolCallConfirmation { call: ToolCall, def: ToolDef },
    /// A tool call is about to execute.
    ToolCallStarted { call: ToolCall, def: ToolDef },
    /// A tool call finished (or was rejected / failed validation).
    ToolCallResponse {
        call: ToolCall,
        response: String,
        is_error: bool,
        /// Structured side payload from the tool, forwarded verbatim
        /// (todo tools ship the plan snapshot here).
        meta: Option<Value>,
    },
    /// Fatal turn error; the stream closes after this.
    Error(String),
    /// The iteration bound was hit; the loop is paused until a
    /// [`ResumeRequest`] arrives.
    MaxIterationsReached(u32),
}

/// Answer delivered into a paused turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRequest {
    /// Run the pending tool call (or continue past the iteration bound).
    Approve,
    /// Approve and remember the decision for the rest of the session.
    ApproveSession,
    /// Skip the pending tool call (or end the turn at the iteration bound).
    Reject,
}
