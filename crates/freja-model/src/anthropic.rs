// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    provider::EventStream, sequence, CompletionRequest, FinishReason, Message, RateLimit, Role,
    StreamEvent, Usage,
};

/// Tokens held back from the context ceiling when clamping `max_tokens`
/// after a context-length rejection, absorbing tokenizer drift between the
/// count endpoint and the real request.
const CLAMP_SAFETY_MARGIN: u32 = 1024;

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    /// Context window ceiling used by the automatic max_tokens clamp.
    /// `None` disables the clamp retry.
    context_window: Option<u32>,
    /// Send the interleaved-thinking beta header and replay prior-turn
    /// thinking blocks with their signatures.
    interleaved_thinking: bool,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        context_window: Option<u32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            context_window,
            interleaved_thinking: false,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_interleaved_thinking(mut self, enabled: bool) -> Self {
        self.interleaved_thinking = enabled;
        self
    }

    fn request_builder(&self, url: String, key: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(url)
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01");
        if self.interleaved_thinking {
            rb = rb.header("anthropic-beta", "interleaved-thinking-2025-05-14");
        }
        rb
    }

    /// Ask the provider how many input tokens the request occupies.
    /// Used only for the clamp retry after a context-length rejection.
    async fn count_tokens(&self, key: &str, body: &Value) -> anyhow::Result<u32> {
        let count_body = json!({
            "model": body["model"],
            "messages": body["messages"],
            "system": body.get("system").cloned().unwrap_or(Value::Null),
            "tools": body.get("tools").cloned().unwrap_or(json!([])),
        });
        let resp = self
            .request_builder(format!("{}/v1/messages/count_tokens", self.base_url), key)
            .json(&count_body)
            .send()
            .await
            .context("token count request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("token count error {status}: {text}");
        }
        let v: Value = resp.json().await.context("token count response invalid")?;
        v["input_tokens"]
            .as_u64()
            .map(|n| n as u32)
            .context("token count response missing input_tokens")
    }
}

#[async_trait]
impl crate::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let key = self
            .api_key
            .as_deref()
            .context("Anthropic API key not set")?
            .to_string();

        let messages = sequence::ensure_dispatchable(req.messages)?;
        let (system_text, mut wire_messages) =
            build_anthropic_messages(&messages, self.interleaved_thinking);
        attach_cache_markers(&mut wire_messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": req.stream,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, tool_count = tools.len(), "sending anthropic request");

        let mut resp = self
            .request_builder(format!("{}/v1/messages", self.base_url), &key)
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();

            // One automatic retry when the request blew the context window:
            // ask the count endpoint what the prompt actually occupies, lower
            // max_tokens to what still fits, and reissue the same request.
            let retried = if is_context_length_error(&text) {
                match self.context_window {
                    Some(limit) => {
                        let used = self.count_tokens(&key, &body).await?;
                        let clamped = clamp_max_tokens(limit, used, self.max_tokens);
                        if clamped < self.max_tokens {
                            warn!(
                                prompt_tokens = used,
                                context_window = limit,
                                max_tokens = clamped,
                                "context length exceeded; retrying with clamped max_tokens"
                            );
                            body["max_tokens"] = json!(clamped);
                            Some(
                                self.request_builder(
                                    format!("{}/v1/messages", self.base_url),
                                    &key,
                                )
                                .json(&body)
                                .send()
                                .await
                                .context("Anthropic retry failed")?,
                            )
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            } else {
                None
            };

            match retried {
                Some(r) if r.status().is_success() => resp = r,
                Some(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    bail!("Anthropic error {status}: {text}");
                }
                None => bail!("Anthropic error {status}: {text}"),
            }
        }

        let rate_limit = parse_rate_limit_headers(resp.headers());

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete '\n'-terminated lines are parsed.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                    out.extend(parse_anthropic_event(&v).into_iter().map(Ok));
                                }
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        let head = futures::stream::iter(
            rate_limit
                .map(|rl| Ok(StreamEvent::RateLimit(rl)))
                .into_iter()
                .collect::<Vec<_>>(),
        );
        Ok(Box::pin(head.chain(event_stream)))
    }
}

/// `max_tokens` that still fits under `limit` after `used` prompt tokens
/// plus the safety margin, never above the configured value and never zero.
pub fn clamp_max_tokens(limit: u32, used: u32, configured: u32) -> u32 {
    let available = limit
        .saturating_sub(used)
        .saturating_sub(CLAMP_SAFETY_MARGIN);
    configured.min(available).max(1)
}

/// Detect Anthropic's context-window rejection in an error body.
fn is_context_length_error(body: &str) -> bool {
    body.contains("prompt is too long") || body.contains("context_length")
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimit> {
    let get_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let requests_remaining = get_u64("anthropic-ratelimit-requests-remaining");
    let tokens_remaining = get_u64("anthropic-ratelimit-tokens-remaining");
    let reset = headers
        .get("anthropic-ratelimit-tokens-reset")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if requests_remaining.is_none() && tokens_remaining.is_none() && reset.is_none() {
        return None;
    }
    Some(RateLimit { requests_remaining, tokens_remaining, reset })
}

/// Map one SSE data object to zero or more normalized events.
pub(crate) fn parse_anthropic_event(v: &Value) -> Vec<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return vec![StreamEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                })];
            }
            vec![]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                return vec![StreamEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }];
            }
            vec![]
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => match delta["text"].as_str() {
                    Some(t) if !t.is_empty() => vec![StreamEvent::TextDelta(t.to_string())],
                    _ => vec![],
                },
                "input_json_delta" => vec![StreamEvent::ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                "thinking_delta" => match delta["thinking"].as_str() {
                    Some(t) if !t.is_empty() => vec![StreamEvent::ReasoningDelta(t.to_string())],
                    _ => vec![],
                },
                // The signature blob validates the thinking block on replay.
                // Opaque; captured verbatim, never rendered.
                "signature_delta" => match delta["signature"].as_str() {
                    Some(s) if !s.is_empty() => {
                        vec![StreamEvent::ReasoningSignature(s.to_string())]
                    }
                    _ => vec![],
                },
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                let finish = match reason {
                    "tool_use" => FinishReason::ToolCalls,
                    "max_tokens" => FinishReason::MaxTokens,
                    _ => FinishReason::Stop,
                };
                events.push(StreamEvent::Finish(finish));
            }
            if let Some(usage) = v.get("usage") {
                events.push(StreamEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                }));
            }
            events
        }
        "message_stop" => vec![StreamEvent::Done],
        _ => vec![],
    }
}

/// Convert the internal message list into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`; the system message is a
/// top-level `system` field, not a conversation turn.  Consecutive tool-role
/// messages merge into one user message carrying multiple `tool_result`
/// blocks.  Assistant blocks follow the conventional order
/// thinking → text → tool_use; prior-turn thinking is replayed with its
/// signature intact when the interleaved-thinking beta is enabled.
pub(crate) fn build_anthropic_messages(
    messages: &[Message],
    interleaved_thinking: bool,
) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        match m.role {
            Role::System => {
                if !m.content.is_empty() {
                    system_text = m.content.clone();
                }
                i += 1;
            }
            Role::Tool => {
                // Merge the contiguous run of tool results into one user turn.
                let mut blocks: Vec<Value> = Vec::new();
                while i < messages.len() && messages[i].role == Role::Tool {
                    let t = &messages[i];
                    blocks.push(json!({
                        "type": "tool_result",
                        "tool_use_id": t.tool_call_id.as_deref().unwrap_or(""),
                        "content": t.content,
                    }));
                    i += 1;
                }
                out.push(json!({ "role": "user", "content": blocks }));
            }
            Role::User => {
                let blocks: Vec<Value> = match &m.multi_content {
                    Some(parts) => parts.iter().map(content_part_to_block).collect(),
                    None => vec![json!({ "type": "text", "text": m.content })],
                };
                out.push(json!({ "role": "user", "content": blocks }));
                i += 1;
            }
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                if interleaved_thinking {
                    if let (Some(thinking), Some(sig)) =
                        (&m.reasoning_content, &m.thinking_signature)
                    {
                        blocks.push(json!({
                            "type": "thinking",
                            "thinking": thinking,
                            "signature": sig,
                        }));
                    }
                }
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for tc in &m.tool_calls {
                    // tool_use ids must match ^[a-zA-Z0-9_-]+$; an empty id
                    // (dropped content_block_start) gets a stable fallback so
                    // the request is not rejected outright.
                    let safe_id = if tc.id.is_empty() {
                        warn!(tool_name = %tc.name, "tool call has empty id; using fallback");
                        "tc_fallback".to_string()
                    } else {
                        tc.id.clone()
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": safe_id,
                        "name": tc.name,
                        "input": serde_json::from_str::<Value>(&tc.arguments)
                            .unwrap_or(json!({})),
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
                i += 1;
            }
        }
    }
    (system_text, out)
}

fn content_part_to_block(part: &crate::ContentPart) -> Value {
    match part {
        crate::ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        crate::ContentPart::Image { image_url, .. } => {
            if let Ok((mime, data)) = crate::types::parse_data_url_parts(image_url) {
                json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": mime, "data": data }
                })
            } else {
                json!({
                    "type": "image",
                    "source": { "type": "url", "url": image_url }
                })
            }
        }
    }
}

/// Attach an ephemeral cache marker to the last content block of the last
/// two messages, so the conversation prefix up to the previous turn is
/// served from the provider cache.
pub(crate) fn attach_cache_markers(messages: &mut [Value]) {
    let len = messages.len();
    for msg in messages.iter_mut().skip(len.saturating_sub(2)) {
        if let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
            // Walk backwards past thinking blocks, which do not accept
            // cache_control.
            for block in blocks.iter_mut().rev() {
                if block["type"].as_str() != Some("thinking") {
                    block["cache_control"] = json!({ "type": "ephemeral" });
                    break;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
