// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation sequencing validation and self-repair.
//!
//! Providers reject a request when an assistant tool call has no matching
//! tool result before the next assistant message (a 400 at the worst
//! possible moment — after the user already waited for the previous turn).
//! Histories can get into that state through interrupted turns, client-side
//! edits, or resumed sessions, so the drivers scan and repair the message
//! list before dispatch instead of forwarding the corruption.

use tracing::warn;

use crate::{Message, Role};

/// Body used for synthesized results of calls that never completed.
pub const FAILED_RESULT_PLACEHOLDER: &str = "(tool execution failed)";

/// Check that every assistant tool call is answered by a tool message with
/// the matching `tool_call_id` before the next assistant message.
///
/// Returns the ids of unanswered calls, in conversation order.  An empty
/// result means the list is dispatchable.
pub fn unanswered_tool_calls(messages: &[Message]) -> Vec<String> {
    let mut missing = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            let mut answered: Vec<&str> = Vec::new();
            let mut j = i + 1;
            while j < messages.len() && messages[j].role != Role::Assistant {
                if messages[j].role == Role::Tool {
                    if let Some(id) = messages[j].tool_call_id.as_deref() {
                        answered.push(id);
                    }
                }
                j += 1;
            }
            for tc in &m.tool_calls {
                if !answered.contains(&tc.id.as_str()) {
                    missing.push(tc.id.clone());
                }
            }
        }
        i += 1;
    }
    missing
}

/// Insert a synthetic failure-placeholder tool result for every unanswered
/// tool call, directly after the last answered result of its group (or after
/// the assistant message when none were answered).
///
/// Idempotent: repairing an already-repaired list changes nothing.
pub fn repair(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(m) = iter.next() {
        let is_tool_call_turn = m.role == Role::Assistant && !m.tool_calls.is_empty();
        let expected = m.tool_calls.clone();
        out.push(m);
        if !is_tool_call_turn {
            continue;
        }

        // Drain the run of messages belonging to this tool group.
        let mut group: Vec<Message> = Vec::new();
        while let Some(next) = iter.peek() {
            if next.role == Role::Assistant {
                break;
            }
            group.push(iter.next().expect("peeked"));
        }

        let answered: Vec<String> = group
            .iter()
            .filter(|g| g.role == Role::Tool)
            .filter_map(|g| g.tool_call_id.clone())
            .collect();

        // Split the group at the end of its tool-result run so synthesized
        // results stay contiguous with the real ones.
        let tail_start = group
            .iter()
            .position(|g| g.role != Role::Tool)
            .unwrap_or(group.len());
        let tail = group.split_off(tail_start);
        out.extend(group);

        for tc in &expected {
            if !answered.contains(&tc.id) {
                warn!(
                    tool_call_id = %tc.id,
                    tool_name = %tc.name,
                    "tool call has no result; inserting failure placeholder"
                );
                out.push(Message::tool_result(
                    tc.id.clone(),
                    tc.name.clone(),
                    FAILED_RESULT_PLACEHOLDER,
                ));
            }
        }
        out.extend(tail);
    }
    out
}

/// Repair the list and verify the result is dispatchable.
///
/// Failure here is a request-build error: the history is structurally broken
/// in a way insertion cannot fix and must not reach the provider.
pub fn ensure_dispatchable(messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
    let repaired = repair(messages);
    let missing = unanswered_tool_calls(&repaired);
    if !missing.is_empty() {
        anyhow::bail!(
            "conversation could not be repaired; unanswered tool calls: {}",
            missing.join(", ")
        );
    }
    Ok(repaired)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
