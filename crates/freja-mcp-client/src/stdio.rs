// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Stdio transport: an MCP server as a subprocess speaking line-delimited
//! JSON-RPC on stdin/stdout.  Stderr is inherited so server diagnostics land
//! in our own stderr stream.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use crate::client::Transport;

pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Spawn the server process and return the transport plus its inbound
    /// message stream.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> anyhow::Result<(StdioTransport, mpsc::Receiver<Value>)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning MCP server: {command}"))?;
        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(16 * 1024 * 1024));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("mcp stdout read error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Servers occasionally write banners to stdout before
                    // speaking the protocol.
                    Err(_) => debug!("ignoring non-JSON line from server"),
                }
            }
            debug!("mcp server stdout closed");
        });

        Ok((
            StdioTransport { stdin: Mutex::new(stdin), child: Mutex::new(Some(child)) },
            rx,
        ))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, msg: Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("writing to MCP server stdin")?;
        stdin.flush().await.context("flushing MCP server stdin")?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Closing stdin asks the server to exit; the kill is the backstop.
        // This path must finish even when the caller was already cancelled,
        // so everything here is plain non-cancellable work.
        let mut stdin = self.stdin.lock().await;
        let _ = stdin.shutdown().await;
        drop(stdin);

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "mcp server exited"),
                _ => {
                    warn!("mcp server did not exit; killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// `cat` echoes our lines back verbatim, which is enough to exercise the
    /// line framing in both directions.
    #[tokio::test]
    async fn echo_server_round_trip() {
        let (transport, mut rx) =
            StdioTransport::spawn("cat", &[], &HashMap::new(), None).unwrap();
        transport
            .send(serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .await
            .unwrap();
        let echoed = rx.recv().await.expect("echoed message");
        assert_eq!(echoed["method"], "ping");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped() {
        let (transport, mut rx) = StdioTransport::spawn(
            "sh",
            &["-c".into(), "echo not-json; echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}'".into()],
            &HashMap::new(),
            None,
        )
        .unwrap();
        let msg = rx.recv().await.expect("json message");
        assert_eq!(msg["id"], 1);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        assert!(StdioTransport::spawn(
            "/nonexistent/freja-mcp-server",
            &[],
            &HashMap::new(),
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn close_after_server_exit_is_clean() {
        let (transport, mut rx) =
            StdioTransport::spawn("true", &[], &HashMap::new(), None).unwrap();
        // Server exits immediately; inbound closes.
        assert!(rx.recv().await.is_none());
        transport.close().await.unwrap();
    }
}
