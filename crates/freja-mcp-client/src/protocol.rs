// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line-level JSON-RPC 2.0 message shapes for the MCP wire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision negotiated during initialize.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Client identification sent during initialize.
pub const CLIENT_NAME: &str = "freja";
pub const CLIENT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Build a request message.
pub fn request(id: i64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification (no id, no reply expected).
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Build a success response to a server-initiated request.
pub fn response(id: Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error response to a server-initiated request.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// What one inbound wire message is.
#[derive(Debug)]
pub enum Inbound {
    /// A reply to one of our requests.
    Response { id: i64, result: Result<Value, RpcError> },
    /// A server-initiated request we must answer.
    Request { id: Value, method: String, params: Value },
    /// A server notification.
    Notification { method: String, params: Value },
    /// Not a JSON-RPC message we recognize.
    Invalid,
}

/// Classify an inbound message.
pub fn classify(msg: &Value) -> Inbound {
    let has_id = msg.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let method = msg.get("method").and_then(|m| m.as_str());

    match (has_id, method) {
        (true, Some(m)) => Inbound::Request {
            id: msg["id"].clone(),
            method: m.to_string(),
            params: msg.get("params").cloned().unwrap_or(Value::Null),
        },
        (false, Some(m)) => Inbound::Notification {
            method: m.to_string(),
            params: msg.get("params").cloned().unwrap_or(Value::Null),
        },
        (true, None) => {
            let id = match msg["id"].as_i64() {
                Some(id) => id,
                None => return Inbound::Invalid,
            };
            if let Some(err) = msg.get("error") {
                let rpc_err: RpcError = serde_json::from_value(err.clone()).unwrap_or(RpcError {
                    code: -32603,
                    message: err.to_string(),
                    data: None,
                });
                Inbound::Response { id, result: Err(rpc_err) }
            } else {
                Inbound::Response {
                    id,
                    result: Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
                }
            }
        }
        (false, None) => Inbound::Invalid,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
