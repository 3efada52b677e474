// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reassembly of a provider event stream into one assistant turn.
//!
//! Providers deliver tool calls as fragments interleaved by `index` —
//! the opening chunk carries `id`/`name`, continuation chunks often carry
//! only argument bytes (and some dialects omit the id on every continuation).
//! The assembler keeps a per-stream index→id map, fills in missing ids, and
//! concatenates argument fragments verbatim without intermediate JSON
//! parsing, so any chunking of the same stream reconstructs byte-identical
//! results.

use std::collections::{BTreeMap, HashMap};

use crate::{FinishReason, Message, StreamEvent, ToolCall, Usage};

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// The fully reassembled result of one provider stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTurn {
    pub text: String,
    pub reasoning: String,
    pub thinking_signature: Option<String>,
    /// Complete tool calls ordered by provider index.
    pub tool_calls: Vec<ToolCall>,
    pub finish: FinishReason,
    pub usage: Option<Usage>,
}

impl AssembledTurn {
    /// Project this turn into the assistant message appended to the session.
    pub fn into_message(self) -> Message {
        let reasoning = if self.reasoning.is_empty() { None } else { Some(self.reasoning) };
        Message::assistant_with_tool_calls(
            self.text,
            self.tool_calls,
            reasoning,
            self.thinking_signature,
        )
    }
}

/// Accumulates [`StreamEvent`]s into an [`AssembledTurn`].
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    reasoning: String,
    signature: Option<String>,
    // BTreeMap keeps tool calls ordered by provider index on finish.
    pending: BTreeMap<u32, PendingToolCall>,
    index_ids: HashMap<u32, String>,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one stream event.  `Done` is a no-op here; the caller decides
    /// when the stream is exhausted and calls [`finish`](Self::finish).
    pub fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(t) => self.text.push_str(t),
            StreamEvent::ReasoningDelta(t) => self.reasoning.push_str(t),
            StreamEvent::ReasoningSignature(sig) => {
                // Signatures are not chunked; a later one replaces an earlier
                // one (one per reasoning block, last block wins).
                self.signature = Some(sig.clone());
            }
            StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                let slot = self.pending.entry(*index).or_default();
                if !id.is_empty() {
                    slot.id = id.clone();
                    self.index_ids.insert(*index, id.clone());
                } else if slot.id.is_empty() {
                    // Continuation chunk from a dialect that repeats the id
                    // only on the opening chunk.
                    if let Some(known) = self.index_ids.get(index) {
                        slot.id = known.clone();
                    }
                }
                if !name.is_empty() {
                    slot.name = name.clone();
                }
                slot.arguments.push_str(arguments);
            }
            StreamEvent::Usage(u) => {
                let total = self.usage.get_or_insert(Usage::default());
                // Providers split usage across chunks (input at stream start,
                // output in the trailer); merge by taking field maxima.
                total.input_tokens = total.input_tokens.max(u.input_tokens);
                total.output_tokens = total.output_tokens.max(u.output_tokens);
            }
            StreamEvent::Finish(reason) => self.finish = Some(*reason),
            StreamEvent::RateLimit(_) | StreamEvent::Done => {}
        }
    }

    /// Whether any tool-call fragment has been observed.
    pub fn has_tool_calls(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn finish(self) -> AssembledTurn {
        let had_tool_calls = !self.pending.is_empty();
        let tool_calls: Vec<ToolCall> = self
            .pending
            .into_iter()
            .map(|(index, p)| ToolCall {
                id: p.id,
                name: p.name,
                arguments: p.arguments,
                index: Some(index),
            })
            .collect();
        // Streams that end without an explicit finish chunk (some
        // OpenAI-compatible servers) are classified by content.
        let finish = self.finish.unwrap_or(if had_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        AssembledTurn {
            text: self.text,
            reasoning: self.reasoning,
            thinking_signature: self.signature,
            tool_calls,
            finish,
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(events: &[StreamEvent]) -> AssembledTurn {
        let mut asm = StreamAssembler::new();
        for ev in events {
            asm.absorb(ev);
        }
        asm.finish()
    }

    fn tc(index: u32, id: &str, name: &str, args: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    #[test]
    fn text_deltas_concatenate() {
        let turn = assemble(&[
            StreamEvent::TextDelta("hel".into()),
            StreamEvent::TextDelta("lo".into()),
            StreamEvent::Finish(FinishReason::Stop),
        ]);
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.finish, FinishReason::Stop);
    }

    #[test]
    fn tool_call_arguments_concatenate_across_chunks() {
        let turn = assemble(&[
            tc(0, "t1", "read_file", ""),
            tc(0, "", "", r#"{"path":"#),
            tc(0, "", "", r#""a.txt"}"#),
            StreamEvent::Finish(FinishReason::ToolCalls),
        ]);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "t1");
        assert_eq!(turn.tool_calls[0].name, "read_file");
        assert_eq!(turn.tool_calls[0].arguments, r#"{"path":"a.txt"}"#);
    }

    #[test]
    fn missing_id_filled_from_index_map() {
        let turn = assemble(&[
            tc(0, "call_a", "alpha", "{"),
            tc(1, "call_b", "beta", "{"),
            tc(0, "", "", "}"),
            tc(1, "", "", "}"),
            StreamEvent::Finish(FinishReason::ToolCalls),
        ]);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(turn.tool_calls[0].arguments, "{}");
        assert_eq!(turn.tool_calls[1].id, "call_b");
        assert_eq!(turn.tool_calls[1].arguments, "{}");
    }

    #[test]
    fn tool_calls_ordered_by_index_not_arrival() {
        let turn = assemble(&[
            tc(2, "late", "z", "{}"),
            tc(0, "early", "a", "{}"),
            StreamEvent::Finish(FinishReason::ToolCalls),
        ]);
        assert_eq!(turn.tool_calls[0].id, "early");
        assert_eq!(turn.tool_calls[1].id, "late");
        assert_eq!(turn.tool_calls[0].index, Some(0));
    }

    #[test]
    fn reasoning_and_signature_captured() {
        let turn = assemble(&[
            StreamEvent::ReasoningDelta("let me ".into()),
            StreamEvent::ReasoningDelta("think".into()),
            StreamEvent::ReasoningSignature("sig-1".into()),
            StreamEvent::TextDelta("answer".into()),
            StreamEvent::Finish(FinishReason::Stop),
        ]);
        assert_eq!(turn.reasoning, "let me think");
        assert_eq!(turn.thinking_signature.as_deref(), Some("sig-1"));
        assert_eq!(turn.text, "answer");
    }

    #[test]
    fn usage_fields_merge_across_chunks() {
        let turn = assemble(&[
            StreamEvent::Usage(Usage { input_tokens: 120, output_tokens: 0 }),
            StreamEvent::TextDelta("x".into()),
            StreamEvent::Usage(Usage { input_tokens: 0, output_tokens: 34 }),
            StreamEvent::Finish(FinishReason::Stop),
        ]);
        assert_eq!(turn.usage, Some(Usage { input_tokens: 120, output_tokens: 34 }));
    }

    #[test]
    fn missing_finish_defaults_by_content() {
        let text_only = assemble(&[StreamEvent::TextDelta("x".into())]);
        assert_eq!(text_only.finish, FinishReason::Stop);

        let with_calls = assemble(&[tc(0, "t", "f", "{}")]);
        assert_eq!(with_calls.finish, FinishReason::ToolCalls);
    }

    /// Reassembly is invariant under how the provider chunks the stream:
    /// splitting every delta into single-character fragments reconstructs a
    /// byte-identical turn.
    #[test]
    fn reassembly_invariant_under_arbitrary_partition() {
        let whole = vec![
            StreamEvent::ReasoningDelta("consider the file".into()),
            StreamEvent::ReasoningSignature("sig-xyz".into()),
            StreamEvent::TextDelta("reading now".into()),
            tc(0, "t1", "read_file", r#"{"path":"src/main.rs","line":42}"#),
            tc(1, "t2", "grep", r#"{"pattern":"fn main"}"#),
            StreamEvent::Finish(FinishReason::ToolCalls),
        ];

        // Shred every text-bearing event into 1-char fragments, keeping the
        // id/name only on the opening fragment (as providers do).
        let mut shredded: Vec<StreamEvent> = Vec::new();
        for ev in &whole {
            match ev {
                StreamEvent::TextDelta(t) => {
                    shredded.extend(t.chars().map(|c| StreamEvent::TextDelta(c.to_string())));
                }
                StreamEvent::ReasoningDelta(t) => {
                    shredded
                        .extend(t.chars().map(|c| StreamEvent::ReasoningDelta(c.to_string())));
                }
                StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                    shredded.push(tc(*index, id, name, ""));
                    shredded.extend(
                        arguments.chars().map(|c| tc(*index, "", "", &c.to_string())),
                    );
                }
                other => shredded.push(other.clone()),
            }
        }

        assert_eq!(assemble(&whole), assemble(&shredded));
    }

    #[test]
    fn into_message_carries_everything() {
        let turn = assemble(&[
            StreamEvent::ReasoningDelta("r".into()),
            StreamEvent::ReasoningSignature("s".into()),
            StreamEvent::TextDelta("t".into()),
            tc(0, "id", "f", "{}"),
            StreamEvent::Finish(FinishReason::ToolCalls),
        ]);
        let msg = turn.into_message();
        assert_eq!(msg.content, "t");
        assert_eq!(msg.reasoning_content.as_deref(), Some("r"));
        assert_eq!(msg.thinking_signature.as_deref(), Some("s"));
        assert_eq!(msg.tool_calls.len(), 1);
    }
}
