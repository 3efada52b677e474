// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-compatible chat completion APIs.
//!
//! Dozens of providers speak the same `/chat/completions` SSE wire format;
//! this module implements it once and every such driver configures it with
//! its own URL, auth style, and headers.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::EventStream, sequence, CompletionRequest, FinishReason, Message, RateLimit, Role,
    StreamEvent, Usage,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — most providers.
    Bearer,
    /// `api-key: <key>` — Azure OpenAI style.
    ApiKeyHeader,
    /// No authentication header — local servers.
    None,
}

pub struct OpenAICompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
}

impl OpenAICompatProvider {
    /// `base_url` ends before `/chat/completions`,
    /// e.g. `https://api.groq.com/openai/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
        }
    }
}

#[async_trait]
impl crate::Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let messages = sequence::ensure_dispatchable(req.messages)?;
        let wire_messages = build_openai_messages(&messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = wire_messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.header("api-key", key)
            }
            AuthStyle::None => http_req,
        };
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {}", self.driver_name, normalize_error_body(&text));
        }

        let rate_limit = parse_rate_limit_headers(resp.headers());

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets; a line buffer carries
        // the incomplete tail forward between chunks.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
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

/// Rewrite provider error bodies into the canonical
/// `{"error": {...}}` envelope.
///
/// Some gateways return a bare string, an array, or an object without an
/// `error` key; parsing such bodies with the standard envelope shape would
/// discard the detail entirely.
pub(crate) fn normalize_error_body(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => {
            if v.get("error").map(|e| e.is_object()).unwrap_or(false) {
                text.to_string()
            } else {
                json!({ "error": v }).to_string()
            }
        }
        Err(_) => json!({ "error": { "message": text } }).to_string(),
    }
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimit> {
    let get_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let requests_remaining = get_u64("x-ratelimit-remaining-requests");
    let tokens_remaining = get_u64("x-ratelimit-remaining-tokens");
    let reset = headers
        .get("x-ratelimit-reset-tokens")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if requests_remaining.is_none() && tokens_remaining.is_none() && reset.is_none() {
        return None;
    }
    Some(RateLimit { requests_remaining, tokens_remaining, reset })
}

/// Drain all complete `\n`-terminated SSE lines from `buf`; the trailing
/// incomplete line stays behind for the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(data) = line.strip_prefix("data: ") {
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                events.push(Ok(StreamEvent::Done));
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(data) {
                events.extend(parse_sse_chunk(&v).into_iter().map(Ok));
            }
        }
    }
    events
}

/// Map one SSE chunk to zero or more normalized events.
pub(crate) fn parse_sse_chunk(v: &Value) -> Vec<StreamEvent> {
    // Usage-only trailer chunk (stream_options.include_usage), emitted after
    // the final choice chunk with an empty choices array.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return vec![StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })];
    }

    let choice = &v["choices"][0];
    let mut events = Vec::new();

    let delta = &choice["delta"];

    // Parallel tool calls arrive interleaved, each element tagged with the
    // accumulation index; the id appears only on the opening chunk in most
    // dialects.
    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            events.push(StreamEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            });
        }
    }

    // Reasoning text travels under two field names across dialects:
    // `reasoning_content` (DeepSeek, llama.cpp, Qwen) and `reasoning`
    // (OpenRouter and other aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            events.push(StreamEvent::ReasoningDelta(t.to_string()));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        let finish = match reason {
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::MaxTokens,
            _ => FinishReason::Stop,
        };
        events.push(StreamEvent::Finish(finish));
    }

    events
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert the internal message list into the OpenAI wire-format array.
///
/// Free function so it can be unit-tested without HTTP.
pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    use crate::ContentPart;

    messages
        .iter()
        .map(|m| {
            if m.role == Role::Assistant && !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments },
                        })
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "tool_calls": calls });
                if !m.content.is_empty() {
                    msg["content"] = json!(m.content);
                }
                return msg;
            }

            if m.role == Role::Tool {
                return json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id.as_deref().unwrap_or(""),
                    "content": m.content,
                });
            }

            if let Some(parts) = &m.multi_content {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url, detail } => {
                            let mut img = json!({ "url": image_url });
                            if let Some(d) = detail {
                                img["detail"] = json!(d);
                            }
                            json!({ "type": "image_url", "image_url": img })
                        }
                    })
                    .collect();
                return json!({ "role": role_str(&m.role), "content": content });
            }

            json!({ "role": role_str(&m.role), "content": m.content })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Provider, ToolCall};

    fn make_provider() -> OpenAICompatProvider {
        OpenAICompatProvider::new(
            "test-compat",
            "test-model".into(),
            None,
            "http://localhost:9999/v1",
            Some(1024),
            Some(0.0),
            vec![],
            AuthStyle::None,
        )
    }

    #[test]
    fn chat_url_appends_path() {
        assert_eq!(make_provider().chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAICompatProvider::new(
            "x",
            "m".into(),
            None,
            "http://localhost:1234/v1/",
            None,
            None,
            vec![],
            AuthStyle::None,
        );
        assert_eq!(p.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn name_returns_driver_name() {
        assert_eq!(make_provider().name(), "test-compat");
    }

    // ── parse_sse_chunk ───────────────────────────────────────────────────────

    #[test]
    fn parse_text_delta() {
        let v = json!({ "choices": [{ "delta": { "content": "hi" } }] });
        assert_eq!(parse_sse_chunk(&v), vec![StreamEvent::TextDelta("hi".into())]);
    }

    #[test]
    fn parse_reasoning_content_delta() {
        let v = json!({ "choices": [{ "delta": { "reasoning_content": "think" } }] });
        assert_eq!(parse_sse_chunk(&v), vec![StreamEvent::ReasoningDelta("think".into())]);
    }

    #[test]
    fn parse_openrouter_reasoning_field() {
        let v = json!({ "choices": [{ "delta": { "reasoning": "ponder" } }] });
        assert_eq!(parse_sse_chunk(&v), vec![StreamEvent::ReasoningDelta("ponder".into())]);
    }

    #[test]
    fn parse_tool_call_delta_with_index() {
        let v = json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 1,
                "id": "call_9",
                "function": { "name": "grep", "arguments": "{\"p" }
            }] } }]
        });
        assert_eq!(
            parse_sse_chunk(&v),
            vec![StreamEvent::ToolCallDelta {
                index: 1,
                id: "call_9".into(),
                name: "grep".into(),
                arguments: "{\"p".into(),
            }]
        );
    }

    #[test]
    fn parse_multiple_tool_calls_in_one_chunk() {
        let v = json!({
            "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "a", "function": { "name": "f", "arguments": "" } },
                { "index": 1, "id": "b", "function": { "name": "g", "arguments": "" } }
            ] } }]
        });
        assert_eq!(parse_sse_chunk(&v).len(), 2);
    }

    #[test]
    fn parse_finish_reasons() {
        for (wire, expected) in [
            ("stop", FinishReason::Stop),
            ("tool_calls", FinishReason::ToolCalls),
            ("length", FinishReason::MaxTokens),
        ] {
            let v = json!({ "choices": [{ "delta": {}, "finish_reason": wire }] });
            assert_eq!(parse_sse_chunk(&v), vec![StreamEvent::Finish(expected)]);
        }
    }

    #[test]
    fn content_and_finish_in_one_chunk_emit_both() {
        let v = json!({ "choices": [{ "delta": { "content": "end" }, "finish_reason": "stop" }] });
        let events = parse_sse_chunk(&v);
        assert_eq!(events[0], StreamEvent::TextDelta("end".into()));
        assert_eq!(events[1], StreamEvent::Finish(FinishReason::Stop));
    }

    #[test]
    fn usage_only_trailer_chunk_parsed_without_choices() {
        let v = json!({ "choices": [], "usage": { "prompt_tokens": 7, "completion_tokens": 3 } });
        assert_eq!(
            parse_sse_chunk(&v),
            vec![StreamEvent::Usage(Usage { input_tokens: 7, output_tokens: 3 })]
        );
    }

    #[test]
    fn null_usage_is_ignored() {
        let v = json!({ "choices": [{ "delta": { "content": "x" } }], "usage": null });
        assert_eq!(parse_sse_chunk(&v), vec![StreamEvent::TextDelta("x".into())]);
    }

    // ── drain_complete_sse_lines ──────────────────────────────────────────────

    #[test]
    fn done_sentinel_yields_done() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
    }

    #[test]
    fn incomplete_line_stays_in_buffer() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: {\"cho".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "data: {\"cho");
    }

    #[test]
    fn crlf_lines_are_handled() {
        let mut buf = "data: [DONE]\r\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
        assert!(buf.is_empty());
    }

    // ── normalize_error_body ──────────────────────────────────────────────────

    #[test]
    fn error_object_passes_through_unchanged() {
        let body = r#"{"error":{"message":"bad request","code":400}}"#;
        assert_eq!(normalize_error_body(body), body);
    }

    #[test]
    fn error_string_field_gets_wrapped() {
        // `error` present but not an object — wrap the whole body.
        let body = r#"{"error":"overloaded"}"#;
        let out: Value = serde_json::from_str(&normalize_error_body(body)).unwrap();
        assert_eq!(out["error"]["error"], "overloaded");
    }

    #[test]
    fn bare_json_body_gets_wrapped() {
        let body = r#"{"detail":"not found"}"#;
        let out: Value = serde_json::from_str(&normalize_error_body(body)).unwrap();
        assert_eq!(out["error"]["detail"], "not found");
    }

    #[test]
    fn non_json_body_becomes_message() {
        let out: Value =
            serde_json::from_str(&normalize_error_body("502 Bad Gateway")).unwrap();
        assert_eq!(out["error"]["message"], "502 Bad Gateway");
    }

    // ── build_openai_messages ─────────────────────────────────────────────────

    #[test]
    fn plain_roles_serialize_directly() {
        let wire = build_openai_messages(&[
            Message::system("sys"),
            Message::user("u"),
            Message::assistant("a"),
        ]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "u");
        assert_eq!(wire[2]["role"], "assistant");
    }

    #[test]
    fn assistant_tool_calls_form_array() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCall { id: "a".into(), name: "one".into(), arguments: "{}".into(), index: None },
                ToolCall { id: "b".into(), name: "two".into(), arguments: "{}".into(), index: None },
            ],
            None,
            None,
        );
        let wire = build_openai_messages(&[m]);
        let calls = wire[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "a");
        assert_eq!(calls[0]["type"], "function");
        assert_eq!(calls[1]["function"]["name"], "two");
    }

    #[test]
    fn tool_message_carries_correlation_id() {
        let wire = build_openai_messages(&[Message::tool_result("t1", "read_file", "data")]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "t1");
        assert_eq!(wire[0]["content"], "data");
    }

    #[test]
    fn arguments_forwarded_as_raw_string() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "x".into(),
                name: "f".into(),
                arguments: r#"{"path":"a.txt"}"#.into(),
                index: None,
            }],
            None,
            None,
        );
        let wire = build_openai_messages(&[m]);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], r#"{"path":"a.txt"}"#);
    }

    #[test]
    fn multi_content_becomes_part_array() {
        let m = Message::user_with_parts(vec![
            crate::ContentPart::text("see"),
            crate::ContentPart::image("https://example.com/x.png"),
        ]);
        let wire = build_openai_messages(&[m]);
        let content = wire[0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "https://example.com/x.png");
    }
}
