// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::EventStream, CompletionRequest, FinishReason, Role, StreamEvent};

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Finish(FinishReason::Stop)),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted provider.  Each `complete` call pops the next event script
/// from the front of the queue, so tests can express exact multi-round
/// streams — including tool calls and failures — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<anyhow::Result<StreamEvent>>>>,
    /// The last `CompletionRequest` seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|s| s.into_iter().map(Ok).collect())
                    .collect(),
            ),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Scripts where individual rounds may end with a stream error.
    pub fn with_results(scripts: Vec<Vec<anyhow::Result<StreamEvent>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: a single round that streams `reply` and stops.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::Finish(FinishReason::Stop),
            StreamEvent::Done,
        ]])
    }

    /// Convenience: one tool-call round followed by a text round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::Finish(FinishReason::ToolCalls),
                StreamEvent::Done,
            ],
            vec![
                StreamEvent::TextDelta(final_text.into()),
                StreamEvent::Finish(FinishReason::Stop),
                StreamEvent::Done,
            ],
        ])
    }
}

#[async_trait]
impl crate::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback once all scripts are consumed.
                vec![
                    Ok(StreamEvent::TextDelta("[no more scripts]".into())),
                    Ok(StreamEvent::Finish(FinishReason::Stop)),
                    Ok(StreamEvent::Done),
                ]
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
