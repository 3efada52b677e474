// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The stdio server: line-delimited JSON-RPC on stdin/stdout.  Inbound
//! requests dispatch to the bridge on their own tasks (a long prompt must
//! not block a cancel); outbound requests (permission, fs) are correlated
//! back through a pending map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use freja_config::{Config, EnvProvider};
use freja_mcp_client::protocol::{classify, error_response, response, Inbound, RpcError};

use crate::bridge::{AcpBridge, ClientConnection};
use crate::protocol::initialize_result;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// The outbound half of the stdio connection.
pub struct StdioConnection {
    out: mpsc::Sender<Value>,
    pending: Pending,
    next_id: AtomicI64,
}

impl StdioConnection {
    fn new(out: mpsc::Sender<Value>) -> Arc<Self> {
        Arc::new(Self {
            out,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
        })
    }

    async fn send(&self, msg: Value) -> anyhow::Result<()> {
        self.out
            .send(msg)
            .await
            .map_err(|_| anyhow!("client connection closed"))
    }

    fn complete(&self, id: i64, result: Result<Value, RpcError>) {
        if let Some(tx) = self.pending.lock().expect("pending lock").remove(&id) {
            let _ = tx.send(result);
        } else {
            debug!(id, "response for unknown request id");
        }
    }
}

#[async_trait]
impl ClientConnection for StdioConnection {
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(anyhow!(e).context(format!("{method} failed"))),
            Err(_) => Err(anyhow!("client disconnected while waiting for {method}")),
        }
    }
}

/// Serve the client protocol over stdin/stdout until the client disconnects.
pub async fn serve(config: Config, env: Arc<dyn EnvProvider>) -> anyhow::Result<()> {
    serve_io(config, env, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Transport-generic server loop; tests drive it over in-memory pipes.
pub async fn serve_io<R, W>(
    config: Config,
    env: Arc<dyn EnvProvider>,
    reader: R,
    writer: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(msg) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&msg) {
                Ok(l) => l,
                Err(e) => {
                    warn!("unserializable outbound message: {e}");
                    continue;
                }
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let conn = StdioConnection::new(out_tx);
    let bridge = AcpBridge::new(config, env, conn.clone());

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.context("reading client input")? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable client message: {e}");
                continue;
            }
        };
        match classify(&msg) {
            Inbound::Request { id, method, params } => {
                let bridge = bridge.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let reply = dispatch(&bridge, &method, &params).await;
                    let msg = match reply {
                        Ok(result) => response(id, result),
                        Err(e) => error_response(id, -32603, &format!("{e:#}")),
                    };
                    let _ = conn.send(msg).await;
                });
            }
            Inbound::Notification { method, params } => {
                if method == "session/cancel" {
                    let bridge = bridge.clone();
                    tokio::spawn(async move { bridge.cancel(&params).await });
                } else {
                    debug!(%method, "ignoring client notification");
                }
            }
            Inbound::Response { id, result } => conn.complete(id, result),
            Inbound::Invalid => warn!("invalid client message"),
        }
    }

    debug!("client input closed; shutting down");
    bridge.shutdown().await;
    writer_task.abort();
    Ok(())
}

async fn dispatch(bridge: &AcpBridge, method: &str, params: &Value) -> anyhow::Result<Value> {
    match method {
        "initialize" => Ok(initialize_result()),
        "session/new" => bridge.new_session(params).await,
        "session/prompt" => bridge.prompt(params).await,
        // Clients may issue cancel as a request; treat it like the
        // notification and acknowledge.
        "session/cancel" => {
            bridge.cancel(params).await;
            Ok(json!({}))
        }
        "authenticate" => Ok(json!({})),
        "session/set_mode" => Ok(json!({})),
        "session/load" => anyhow::bail!("session loading is not supported"),
        other => anyhow::bail!("unknown method: {other}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;

    const MOCK_CONFIG: &str = r#"
models:
  m: { provider: mock, name: mock-model }
agents:
  root:
    model: m
    instruction: assist
"#;

    struct Client {
        to_server: DuplexStream,
        from_server: tokio::io::Lines<BufReader<DuplexStream>>,
    }

    impl Client {
        async fn connect() -> Self {
            let (client_in, server_out) = duplex(64 * 1024);
            let (server_in, client_out) = duplex(64 * 1024);
            let config = freja_config::load_config_str(MOCK_CONFIG).unwrap();
            tokio::spawn(serve_io(
                config,
                Arc::new(freja_config::StaticEnv::default()),
                server_in,
                server_out,
            ));
            Self {
                to_server: client_out,
                from_server: BufReader::new(client_in).lines(),
            }
        }

        async fn send(&mut self, msg: Value) {
            let mut line = msg.to_string();
            line.push('\n');
            self.to_server.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.from_server.next_line().await.unwrap().expect("line");
            serde_json::from_str(&line).unwrap()
        }

        /// Read until the response with the given id arrives, collecting
        /// everything else.
        async fn recv_response(&mut self, id: i64) -> (Value, Vec<Value>) {
            let mut others = Vec::new();
            loop {
                let msg = self.recv().await;
                if msg["id"].as_i64() == Some(id) && msg.get("method").is_none() {
                    return (msg, others);
                }
                others.push(msg);
            }
        }
    }

    #[tokio::test]
    async fn initialize_reports_capabilities() {
        let mut client = Client::connect().await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize",
                          "params": { "protocol_version": 1 } }))
            .await;
        let (resp, _) = client.recv_response(1).await;
        assert_eq!(resp["result"]["capabilities"]["load_session"], false);
    }

    #[tokio::test]
    async fn full_prompt_round_trip_over_the_wire() {
        let mut client = Client::connect().await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 1, "method": "session/new",
                          "params": { "cwd": "/work" } }))
            .await;
        let (resp, _) = client.recv_response(1).await;
        let session_id = resp["result"]["session_id"].as_str().unwrap().to_string();

        client
            .send(json!({ "jsonrpc": "2.0", "id": 2, "method": "session/prompt",
                          "params": { "session_id": session_id,
                                      "prompt": [{ "type": "text", "text": "ping" }] } }))
            .await;
        let (resp, notifications) = client.recv_response(2).await;
        assert_eq!(resp["result"]["stop_reason"], "end_turn");

        let saw_text = notifications.iter().any(|n| {
            n["method"] == "session/update"
                && n["params"]["update"]["kind"] == "agent_message_text"
                && n["params"]["update"]["text"]
                    .as_str()
                    .is_some_and(|t| t.contains("MOCK: ping"))
        });
        assert!(saw_text, "{notifications:?}");
    }

    #[tokio::test]
    async fn unknown_method_gets_error_response() {
        let mut client = Client::connect().await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 5, "method": "session/teleport", "params": {} }))
            .await;
        let (resp, _) = client.recv_response(5).await;
        assert!(resp["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown method"));
    }

    #[tokio::test]
    async fn session_load_is_not_supported() {
        let mut client = Client::connect().await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 3, "method": "session/load", "params": {} }))
            .await;
        let (resp, _) = client.recv_response(3).await;
        assert!(resp["error"]["message"].as_str().unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn authenticate_and_set_mode_are_accepted() {
        let mut client = Client::connect().await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 7, "method": "authenticate", "params": {} }))
            .await;
        let (resp, _) = client.recv_response(7).await;
        assert!(resp["result"].is_object());

        client
            .send(json!({ "jsonrpc": "2.0", "id": 8, "method": "session/set_mode", "params": {} }))
            .await;
        let (resp, _) = client.recv_response(8).await;
        assert!(resp["result"].is_object());
    }
}
