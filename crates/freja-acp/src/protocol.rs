// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire shapes of the client protocol (line-delimited JSON-RPC over stdio).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol revision reported by initialize.
pub const PROTOCOL_VERSION: u32 = 1;

/// Why a prompt request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
}

/// One element of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Accepted but not forwarded to providers.
    Image {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// Accepted but not forwarded to providers.
    Audio {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// A client-readable file referenced by URI; the bridge inlines it.
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Embedded resource: text or binary.
    Resource {
        resource: EmbeddedResource,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedResource {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

/// The fixed permission option set offered with every confirmation.
pub fn permission_options() -> Value {
    json!([
        { "option_id": "allow-once",   "name": "Allow once",   "kind": "allow_once" },
        { "option_id": "allow-always", "name": "Always allow", "kind": "allow_always" },
        { "option_id": "reject-once",  "name": "Reject",       "kind": "reject_once" },
    ])
}

/// Decoded answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    Selected(String),
    Cancelled,
}

/// Decode the `outcome` object of a permission response.
pub fn parse_permission_outcome(result: &Value) -> PermissionOutcome {
    let outcome = &result["outcome"];
    if outcome["cancelled"].as_bool() == Some(true) {
        return PermissionOutcome::Cancelled;
    }
    match outcome["selected"]["option_id"].as_str() {
        Some(id) => PermissionOutcome::Selected(id.to_string()),
        // An unreadable outcome must never auto-approve.
        None => PermissionOutcome::Cancelled,
    }
}

/// The initialize result: protocol revision, agent identity, capabilities.
pub fn initialize_result() -> Value {
    json!({
        "protocol_version": PROTOCOL_VERSION,
        "agent_info": {
            "name": "freja",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "load_session": false,
            "prompt_capabilities": {
                "embedded_context": true,
                "image": false,
                "audio": false,
            },
            "mcp_capabilities": {
                "http": false,
                "sse": false,
            },
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
