// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with images.  Images are data URLs
/// (`data:<mime>;base64,<b64>`) or HTTPS URLs for providers that accept
/// remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image_url: String,
        /// Vision detail level (`"low"`, `"high"`, `"auto"`); provider-specific.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into(), detail: None }
    }
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>` into
/// `(mime_type, base64_payload)`.  Errors on non-data-URLs so callers can
/// fall back to treating the string as a plain HTTPS URL.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
///
/// `arguments` is preserved as the raw string the model emitted — it may have
/// been streamed as partial JSON fragments concatenated across deltas, and is
/// only parsed at the moment of execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier issued by the model; correlates the eventual
    /// tool-role reply through `Message::tool_call_id`.
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as emitted by the model.
    pub arguments: String,
    /// Position within a parallel tool-call batch, when the provider
    /// reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// A single message in the conversation history.  Immutable once appended to
/// a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Plain text content.  Empty for tool-call-only assistant turns.
    #[serde(default)]
    pub content: String,
    /// Ordered multi-part content (text + images).  When set, `content` is
    /// ignored by providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_content: Option<Vec<ContentPart>>,
    /// Tool invocations requested by an assistant turn, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// On tool-role messages: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// On tool-role messages: the name of the tool that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Chain-of-thought text that preceded the answer, when the provider
    /// exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Opaque provider-issued token that validates the reasoning block.
    /// Replayed verbatim on later requests to the same provider; never
    /// regenerated locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into(), ..Default::default() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into(), ..Default::default() }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        // A single text part collapses to plain content for cleaner wire output.
        if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                return Self::user(text.clone());
            }
        }
        Self {
            role: Role::User,
            multi_content: Some(parts),
            ..Default::default()
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into(), ..Default::default() }
    }

    /// Assistant turn that requests tool invocations, optionally carrying the
    /// reasoning block and its signature for later replay.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        reasoning: Option<String>,
        thinking_signature: Option<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls,
            reasoning_content: reasoning,
            thinking_signature,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Approximate token count (4 chars/token heuristic; images use a fixed
    /// high estimate).  Used for context budgeting only.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(parts) = &self.multi_content {
            chars += parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 765 * 4,
                })
                .sum::<usize>();
        }
        chars += self
            .tool_calls
            .iter()
            .map(|tc| tc.name.len() + tc.arguments.len())
            .sum::<usize>();
        if let Some(r) = &self.reasoning_content {
            chars += r.len();
        }
        (chars / 4).max(1)
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Request sent to a provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Terminal stop — the turn is complete.
    Stop,
    /// The model requested tool invocations.
    ToolCalls,
    /// The output-token limit was hit; in-flight tool arguments may be
    /// truncated.
    MaxTokens,
}

/// Token usage reported by the provider, usually in a terminal chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Rate-limit state carried in provider response trailers/headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_remaining: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub reset: Option<String>,
}

/// One normalized event from a provider stream.
///
/// Every provider dialect is reduced to this sum type by a small parser in
/// its driver module; everything downstream (assembler, runtime loop) is
/// provider-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Answer text fragment.
    TextDelta(String),
    /// Chain-of-thought fragment.
    ReasoningDelta(String),
    /// Opaque signature that validates the preceding reasoning block.
    ReasoningSignature(String),
    /// Tool-call fragment.  `id` / `name` may be empty on continuation
    /// chunks; `arguments` fragments are concatenated verbatim.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    RateLimit(RateLimit),
    Finish(FinishReason),
    /// The stream ended normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
