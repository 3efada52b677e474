// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote MCP transports: streamable HTTP (one endpoint, JSON or SSE
//! response bodies) and legacy SSE (GET event stream plus POSTed messages).
//! Both route 401 challenges through the OAuth layer and retry once with
//! the fresh token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use url::Url;

use freja_tools::{ElicitationHandler, OAuthSuccessHandler};

use crate::client::Transport;
use crate::oauth;
use crate::tokens::TokenCache;

// ─── Auth glue ────────────────────────────────────────────────────────────────

/// OAuth state shared by a remote transport: the token cache, the
/// managed/delegated switch, and the handlers wired in by the toolset.
pub struct RemoteAuth {
    pub cache: Arc<TokenCache>,
    pub managed: AtomicBool,
    pub gateway_url: Option<String>,
    pub elicitation: RwLock<Option<Arc<dyn ElicitationHandler>>>,
    pub on_success: RwLock<Option<OAuthSuccessHandler>>,
}

impl RemoteAuth {
    pub fn new(cache: Arc<TokenCache>, managed: bool, gateway_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            managed: AtomicBool::new(managed),
            gateway_url,
            elicitation: RwLock::new(None),
            on_success: RwLock::new(None),
        })
    }

    fn bearer(&self, base_url: &str) -> Option<String> {
        self.cache.get(base_url).map(|t| t.access_token)
    }

    /// Run the appropriate OAuth flow after a 401 and invoke the success
    /// handler.  Unrecoverable failures propagate to the caller.
    async fn authorize(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        www_authenticate: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.managed.load(Ordering::SeqCst) {
            oauth::managed_flow(
                http,
                base_url,
                www_authenticate,
                self.gateway_url.as_deref(),
                &self.cache,
            )
            .await?;
        } else {
            let handler = self
                .elicitation
                .read()
                .expect("elicitation lock")
                .clone()
                .context("server requires authorization but no elicitation handler is set")?;
            oauth::delegated_flow(
                http,
                base_url,
                www_authenticate,
                self.gateway_url.as_deref(),
                &self.cache,
                handler,
            )
            .await?;
        }
        if let Some(cb) = self.on_success.read().expect("success lock").clone() {
            cb(base_url);
        }
        Ok(())
    }
}

fn www_authenticate_header(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ─── SSE line parsing ─────────────────────────────────────────────────────────

/// Incremental SSE parser: feed it raw bytes, take complete events out.
/// Events are dispatched on blank lines; multi-line `data:` fields are
/// joined with newlines per the SSE specification.
#[derive(Default)]
pub struct SseParser {
    buf: String,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &str) -> Vec<(String, String)> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            if line.is_empty() {
                if !self.data.is_empty() {
                    let name = if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    };
                    events.push((name, self.data.join("\n")));
                    self.data.clear();
                } else {
                    self.event.clear();
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                self.event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (`:`) and other fields are ignored.
        }
        events
    }
}

// ─── Streamable HTTP ──────────────────────────────────────────────────────────

pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    auth: Arc<RemoteAuth>,
    session_id: Mutex<Option<String>>,
    inbound: mpsc::Sender<Value>,
}

impl HttpTransport {
    pub fn connect(
        url: String,
        headers: HashMap<String, String>,
        auth: Arc<RemoteAuth>,
    ) -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                http: reqwest::Client::new(),
                url,
                headers,
                auth,
                session_id: Mutex::new(None),
                inbound: tx,
            }),
            rx,
        )
    }

    fn build_request(&self, msg: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(msg);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = self.auth.bearer(&self.url) {
            req = req.bearer_auth(token);
        }
        if let Some(sid) = self.session_id.lock().expect("session id lock").clone() {
            req = req.header("Mcp-Session-Id", sid);
        }
        req
    }

    async fn deliver_response(&self, resp: reqwest::Response) -> anyhow::Result<()> {
        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session id lock") = Some(sid.to_string());
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // The reply (possibly several messages) streams in as SSE.  Drain
            // it on its own task so send() returns once the request is
            // accepted.
            let inbound = self.inbound.clone();
            let mut body = resp.bytes_stream();
            tokio::spawn(async move {
                let mut parser = SseParser::default();
                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("mcp response stream error: {e}");
                            break;
                        }
                    };
                    for (event, data) in parser.feed(&String::from_utf8_lossy(&chunk)) {
                        if event != "message" {
                            continue;
                        }
                        if let Ok(msg) = serde_json::from_str::<Value>(&data) {
                            if inbound.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
            return Ok(());
        }

        // Plain JSON reply (or an empty 202 for notifications).
        let text = resp.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(());
        }
        let msg: Value = serde_json::from_str(&text).context("invalid JSON from server")?;
        let _ = self.inbound.send(msg).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, msg: Value) -> anyhow::Result<()> {
        let resp = self.build_request(&msg).send().await.context("mcp request failed")?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = www_authenticate_header(&resp);
            debug!(url = %self.url, "401 from server; starting authorization");
            self.auth
                .authorize(&self.http, &self.url, challenge.as_deref())
                .await?;
            let retry = self.build_request(&msg).send().await.context("mcp retry failed")?;
            if !retry.status().is_success() {
                bail!("mcp server error after authorization: {}", retry.status());
            }
            return self.deliver_response(retry).await;
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("mcp server error {status}: {text}");
        }
        self.deliver_response(resp).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Legacy SSE ───────────────────────────────────────────────────────────────

pub struct SseTransport {
    http: reqwest::Client,
    base_url: String,
    headers: HashMap<String, String>,
    auth: Arc<RemoteAuth>,
    endpoint: watch::Receiver<Option<String>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream.  The first `endpoint` event names the URL
    /// messages are POSTed to; inbound messages arrive as `message` events.
    pub async fn connect(
        base_url: String,
        headers: HashMap<String, String>,
        auth: Arc<RemoteAuth>,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<Value>)> {
        let http = reqwest::Client::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);

        let resp = Self::open_stream(&http, &base_url, &headers, &auth).await?;

        let stream_base = base_url.clone();
        let reader = tokio::spawn(async move {
            let mut parser = SseParser::default();
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("sse stream error: {e}");
                        break;
                    }
                };
                for (event, data) in parser.feed(&String::from_utf8_lossy(&chunk)) {
                    match event.as_str() {
                        "endpoint" => {
                            match resolve_endpoint(&stream_base, &data) {
                                Ok(url) => {
                                    debug!(%url, "sse endpoint announced");
                                    let _ = endpoint_tx.send(Some(url));
                                }
                                Err(e) => warn!("bad sse endpoint: {e:#}"),
                            }
                        }
                        "message" => {
                            if let Ok(msg) = serde_json::from_str::<Value>(&data) {
                                if inbound_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            debug!("sse stream closed");
        });

        Ok((
            Arc::new(Self {
                http,
                base_url,
                headers,
                auth,
                endpoint: endpoint_rx,
                reader: Mutex::new(Some(reader)),
            }),
            inbound_rx,
        ))
    }

    async fn open_stream(
        http: &reqwest::Client,
        base_url: &str,
        headers: &HashMap<String, String>,
        auth: &Arc<RemoteAuth>,
    ) -> anyhow::Result<reqwest::Response> {
        let build = |token: Option<String>| {
            let mut req = http.get(base_url).header("Accept", "text/event-stream");
            for (name, value) in headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(t) = token {
                req = req.bearer_auth(t);
            }
            req
        };

        let resp = build(auth.bearer(base_url)).send().await.context("sse connect failed")?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = www_authenticate_header(&resp);
            auth.authorize(http, base_url, challenge.as_deref()).await?;
            let retry = build(auth.bearer(base_url)).send().await.context("sse reconnect failed")?;
            if !retry.status().is_success() {
                bail!("sse connect error after authorization: {}", retry.status());
            }
            return Ok(retry);
        }
        if !resp.status().is_success() {
            bail!("sse connect error: {}", resp.status());
        }
        Ok(resp)
    }

    async fn endpoint_url(&self) -> anyhow::Result<String> {
        let mut rx = self.endpoint.clone();
        loop {
            if let Some(url) = rx.borrow_and_update().clone() {
                return Ok(url);
            }
            rx.changed().await.map_err(|_| {
                anyhow::anyhow!("sse stream ended before announcing an endpoint")
            })?;
        }
    }
}

/// The endpoint event carries either an absolute URL or a path relative to
/// the stream URL.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> anyhow::Result<String> {
    let base = Url::parse(base_url).context("sse base URL")?;
    Ok(base.join(endpoint.trim()).context("joining endpoint")?.to_string())
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, msg: Value) -> anyhow::Result<()> {
        let endpoint = self.endpoint_url().await?;
        let build = |token: Option<String>| {
            let mut req = self.http.post(&endpoint).json(&msg);
            for (name, value) in &self.headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(t) = token {
                req = req.bearer_auth(t);
            }
            req
        };

        let resp = build(self.auth.bearer(&self.base_url))
            .send()
            .await
            .context("sse post failed")?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = www_authenticate_header(&resp);
            self.auth
                .authorize(&self.http, &self.base_url, challenge.as_deref())
                .await?;
            let retry = build(self.auth.bearer(&self.base_url))
                .send()
                .await
                .context("sse post retry failed")?;
            if !retry.status().is_success() {
                bail!("sse post error after authorization: {}", retry.status());
            }
            return Ok(());
        }
        if !resp.status().is_success() {
            bail!("sse post error: {}", resp.status());
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(reader) = self.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
