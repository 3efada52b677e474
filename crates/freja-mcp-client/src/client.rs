// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transport-agnostic MCP client: request/response correlation, the
//! initialize handshake, tool listing/invocation, and routing of
//! server-initiated requests (elicitation) back through a handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use freja_tools::{
    ElicitationHandler, ElicitationRequest, ElicitationResponse,
};

use crate::protocol::{
    self, classify, Inbound, RpcError, CLIENT_NAME, CLIENT_VERSION, MCP_PROTOCOL_VERSION,
};

/// Error marker for replies that will never arrive because the connection
/// ended.  Initialize failures carrying this marker degrade the toolset
/// instead of failing it.
pub const TRANSPORT_CLOSED: &str = "transport closed";

/// One duplex connection to an MCP server.  `send` delivers a message;
/// inbound messages arrive on the channel handed to [`McpClient::new`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, msg: Value) -> anyhow::Result<()>;
    /// Shut down.  Implementations must complete even when the surrounding
    /// request was already cancelled.
    async fn close(&self) -> anyhow::Result<()>;
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;
type SharedElicitationHandler = Arc<RwLock<Option<Arc<dyn ElicitationHandler>>>>;

/// Result of the initialize handshake.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
}

pub struct McpClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: PendingMap,
    elicitation: SharedElicitationHandler,
    router: tokio::task::JoinHandle<()>,
}

impl McpClient {
    /// Wire a client onto a transport.  `inbound` is the stream of parsed
    /// messages the transport produces; the client routes them until the
    /// channel closes.
    pub fn new(transport: Arc<dyn Transport>, inbound: mpsc::Receiver<Value>) -> Arc<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let elicitation: SharedElicitationHandler = Arc::new(RwLock::new(None));

        let router = tokio::spawn(route_inbound(
            inbound,
            pending.clone(),
            elicitation.clone(),
            transport.clone(),
        ));

        Arc::new(Self {
            transport,
            next_id: AtomicI64::new(1),
            pending,
            elicitation,
            router,
        })
    }

    pub fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        *self.elicitation.write().expect("elicitation lock") = Some(handler);
    }

    /// Send a request and await its reply.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        if let Err(e) = self.transport.send(protocol::request(id, method, params)).await {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(e).with_context(|| format!("sending {method}"));
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc_err)) => Err(anyhow!(rpc_err).context(format!("{method} failed"))),
            Err(_) => Err(anyhow!("{TRANSPORT_CLOSED} while waiting for {method}")),
        }
    }

    /// Send a notification (no reply).
    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.transport.send(protocol::notification(method, params)).await
    }

    /// The initialize handshake.  Some servers lose the race between the
    /// handshake reply and the initialized notification; that specific
    /// failure is retried up to three times with linear backoff.
    pub async fn initialize(&self) -> anyhow::Result<ServerInfo> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
            "capabilities": { "elicitation": {} },
        });

        let mut attempt: u32 = 0;
        loop {
            match self.try_initialize(params.clone()).await {
                Ok(info) => return Ok(info),
                Err(e)
                    if attempt < 3
                        && e.to_string().contains("failed to send initialized notification") =>
                {
                    let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                    warn!(attempt, "initialize race, retrying in {backoff:?}: {e:#}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_initialize(&self, params: Value) -> anyhow::Result<ServerInfo> {
        let result = self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({}))
            .await
            .map_err(|e| anyhow!("failed to send initialized notification: {e}"))?;

        Ok(ServerInfo {
            name: result["serverInfo"]["name"].as_str().unwrap_or("").to_string(),
            version: result["serverInfo"]["version"].as_str().unwrap_or("").to_string(),
            instructions: result["instructions"].as_str().map(str::to_string),
        })
    }

    /// List every tool the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<Value>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            if let Some(page) = result["tools"].as_array() {
                tools.extend(page.iter().cloned());
            }
            match result["nextCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a tool.  The raw argument string is parsed here (empty means
    /// "no arguments"); text content parts are flattened into one string and
    /// empty output becomes the literal `"no output"`.
    pub async fn call_tool(&self, name: &str, raw_args: &str) -> anyhow::Result<(String, bool)> {
        let arguments: Value = if raw_args.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw_args)
                .with_context(|| format!("invalid arguments for {name}"))?
        };
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(flatten_call_result(&result))
    }

    /// Tear the connection down.  The router stops once the transport closes
    /// its inbound channel; pending requests fail with [`TRANSPORT_CLOSED`].
    pub async fn close(&self) -> anyhow::Result<()> {
        let result = self.transport.close().await;
        self.router.abort();
        result
    }
}

/// Flatten a tools/call result into `(text, is_error)`.
fn flatten_call_result(result: &Value) -> (String, bool) {
    let is_error = result["isError"].as_bool().unwrap_or(false);
    let text = result["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    if p["type"].as_str() == Some("text") {
                        p["text"].as_str()
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        ("no output".to_string(), is_error)
    } else {
        (text, is_error)
    }
}

/// Route inbound messages until the transport ends, then fail whatever is
/// still waiting.
async fn route_inbound(
    mut inbound: mpsc::Receiver<Value>,
    pending: PendingMap,
    elicitation: SharedElicitationHandler,
    transport: Arc<dyn Transport>,
) {
    while let Some(msg) = inbound.recv().await {
        match classify(&msg) {
            Inbound::Response { id, result } => {
                let waiter = pending.lock().expect("pending lock").remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(id, "reply for unknown request id"),
                }
            }
            Inbound::Request { id, method, params } => {
                handle_server_request(id, &method, params, &elicitation, &transport).await;
            }
            Inbound::Notification { method, .. } => {
                debug!(%method, "server notification");
            }
            Inbound::Invalid => warn!("unparseable message from server"),
        }
    }

    // Connection gone: every waiter gets the closed marker through its
    // dropped oneshot sender.
    pending.lock().expect("pending lock").clear();
}

async fn handle_server_request(
    id: Value,
    method: &str,
    params: Value,
    elicitation: &SharedElicitationHandler,
    transport: &Arc<dyn Transport>,
) {
    let reply = match method {
        "ping" => protocol::response(id, json!({})),
        "elicitation/create" => {
            let handler = elicitation.read().expect("elicitation lock").clone();
            match handler {
                Some(h) => {
                    let request = ElicitationRequest {
                        message: params["message"].as_str().unwrap_or("").to_string(),
                        schema: params.get("requestedSchema").cloned(),
                    };
                    match h.elicit(request).await {
                        Ok(ElicitationResponse { action, content }) => {
                            let mut result = json!({ "action": action });
                            if let Some(c) = content {
                                result["content"] = c;
                            }
                            protocol::response(id, result)
                        }
                        Err(e) => protocol::error_response(id, -32603, &format!("{e:#}")),
                    }
                }
                None => protocol::error_response(id, -32601, "no elicitation handler"),
            }
        }
        other => protocol::error_response(id, -32601, &format!("unsupported method: {other}")),
    };
    if let Err(e) = transport.send(reply).await {
        warn!("failed to answer server request: {e:#}");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
