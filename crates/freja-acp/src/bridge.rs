// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Maps runtime events to the client protocol and back: prompt turns,
//! session updates, permission requests, elicitation, filesystem RPC, and
//! per-session preemption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use freja_config::{Config, EnvProvider, McpTransport, RemoteOAuthConfig, ToolsetConfig};
use freja_core::{
    AgentEvent, InMemorySessionStore, ResumeRequest, Runtime, Session, SessionRecord,
    SessionStore, TurnHandle,
};
use freja_mcp_client::{McpToolSet, TokenCache};
use freja_model::Message;
use freja_team::Team;
use freja_tools::{
    Elicitable, ElicitationAction, ElicitationHandler, ElicitationRequest, ElicitationResponse,
    ToolSet,
};

use crate::fs::{resolve_within, AcpFsToolSet, CaseSensitivity, ClientFs};
use crate::protocol::{
    parse_permission_outcome, permission_options, ContentBlock, PermissionOutcome, StopReason,
};
use crate::toolkind::{extract_locations, infer_tool_kind, render_diff};

/// Outbound half of the connection: notifications and client-answered
/// requests.  The stdio server implements this; tests fake it.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()>;
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

struct SessionState {
    session: Arc<tokio::sync::Mutex<Session>>,
    runtime: Arc<Runtime>,
    team: Arc<Team>,
    cwd: PathBuf,
    /// Cancel handle of the active turn; a new prompt or an explicit cancel
    /// fires it.
    active: std::sync::Mutex<Option<TurnHandle>>,
}

pub struct AcpBridge {
    config: Config,
    env: Arc<dyn EnvProvider>,
    conn: Arc<dyn ClientConnection>,
    token_cache: Arc<TokenCache>,
    case: CaseSensitivity,
    store: Arc<dyn SessionStore>,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<SessionState>>>,
}

impl AcpBridge {
    pub fn new(
        config: Config,
        env: Arc<dyn EnvProvider>,
        conn: Arc<dyn ClientConnection>,
    ) -> Arc<Self> {
        Self::with_store(config, env, conn, Arc::new(InMemorySessionStore::default()))
    }

    /// Plug in a persistence backend for session records.
    pub fn with_store(
        config: Config,
        env: Arc<dyn EnvProvider>,
        conn: Arc<dyn ClientConnection>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            env,
            conn,
            token_cache: Arc::new(TokenCache::new()),
            case: CaseSensitivity::platform_default(),
            store,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// `session/new`: build the team (config toolsets plus any MCP servers
    /// the client brought along) and register the session.
    pub async fn new_session(&self, params: &Value) -> anyhow::Result<Value> {
        let cwd = PathBuf::from(
            params["cwd"].as_str().context("session/new requires 'cwd'")?,
        );
        let session = Session::new(Some(cwd.clone()));
        let session_id = session.id.clone();

        let mut config = self.config.clone();
        if let Some(extra) = params["mcp_servers"].as_array() {
            let root = config.root_agent().context("config has no root agent")?.to_string();
            let toolsets = &mut config
                .agents
                .get_mut(&root)
                .expect("root agent exists")
                .toolsets;
            for server in extra {
                toolsets.push(mcp_server_config(server)?);
            }
        }

        let factory = self.toolset_factory(&session_id, &cwd);
        let team = Arc::new(
            Team::from_config(&config, self.env.as_ref(), factory)
                .await
                .context("building team")?,
        );

        let state = Arc::new(SessionState {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            runtime: Runtime::new(team.clone()),
            team,
            cwd,
            active: std::sync::Mutex::new(None),
        });
        self.sessions.lock().await.insert(session_id.clone(), state);

        // No client commands are defined; announce the empty set so the
        // client can render its palette immediately.
        let _ = self
            .conn
            .notify(
                "session/update",
                json!({
                    "session_id": session_id,
                    "update": { "kind": "available_commands_update", "commands": [] },
                }),
            )
            .await;

        Ok(json!({ "session_id": session_id }))
    }

    /// `session/prompt`: run one turn and pump its events to the client.
    /// Returns once the turn terminates.
    pub async fn prompt(&self, params: &Value) -> anyhow::Result<Value> {
        let session_id = params["session_id"]
            .as_str()
            .context("session/prompt requires 'session_id'")?
            .to_string();
        let state = self
            .sessions
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .with_context(|| format!("unknown session: {session_id}"))?;

        // A new prompt on a busy session preempts the running turn.
        if let Some(prev) = state.active.lock().expect("active lock").take() {
            debug!(%session_id, "preempting active turn");
            prev.cancel();
        }

        let blocks: Vec<ContentBlock> = serde_json::from_value(params["prompt"].clone())
            .context("invalid prompt content")?;
        let text = self.render_prompt(&session_id, &state, &blocks).await?;
        state.session.lock().await.push(Message::user(text));

        let (mut rx, handle) = state.runtime.run_stream(state.session.clone());
        *state.active.lock().expect("active lock") = Some(handle.clone());

        while let Some(event) = rx.recv().await {
            self.forward_event(&session_id, event, &handle).await;
        }

        // Clear the slot unless a preempting prompt already replaced it.
        {
            let mut active = state.active.lock().expect("active lock");
            if active.as_ref().map(|h| h.is_cancelled()).unwrap_or(false) {
                *active = None;
            } else if !handle.is_cancelled() {
                *active = None;
            }
        }

        // Persist the turn's outcome; a failing store never fails the turn.
        let record = SessionRecord::from_session(&*state.session.lock().await);
        if let Err(e) = self.store.save(record).await {
            warn!("session store save failed: {e:#}");
        }

        let stop = if handle.is_cancelled() { StopReason::Cancelled } else { StopReason::EndTurn };
        Ok(json!({ "stop_reason": stop }))
    }

    /// `session/cancel` notification: end the active turn, if any.
    pub async fn cancel(&self, params: &Value) {
        let Some(session_id) = params["session_id"].as_str() else {
            return;
        };
        let state = self.sessions.lock().await.get(session_id).cloned();
        if let Some(state) = state {
            if let Some(handle) = state.active.lock().expect("active lock").take() {
                debug!(%session_id, "cancelling turn");
                handle.cancel();
            }
        }
    }

    /// Stop every session's toolsets.  Called when the client disconnects.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<SessionState>> =
            self.sessions.lock().await.values().cloned().collect();
        for state in sessions {
            if let Some(handle) = state.active.lock().expect("active lock").take() {
                handle.cancel();
            }
            state.team.stop().await;
        }
    }

    fn toolset_factory(&self, session_id: &str, cwd: &Path) -> freja_team::ToolSetFactory {
        let conn = self.conn.clone();
        let cache = self.token_cache.clone();
        let case = self.case;
        let session_id = session_id.to_string();
        let cwd = cwd.to_path_buf();

        Arc::new(move |cfg: &ToolsetConfig| -> anyhow::Result<Arc<dyn ToolSet>> {
            match cfg {
                ToolsetConfig::Mcp { .. } => {
                    let set = McpToolSet::from_config(cfg, cache.clone())?;
                    set.set_elicitation_handler(Arc::new(ElicitationForwarder {
                        conn: conn.clone(),
                        session_id: session_id.clone(),
                    }));
                    Ok(Arc::new(set))
                }
                ToolsetConfig::Filesystem => Ok(Arc::new(AcpFsToolSet::new(
                    session_id.clone(),
                    cwd.clone(),
                    case,
                    Arc::new(RpcFs { conn: conn.clone() }),
                ))),
                other => anyhow::bail!("unsupported toolset: {other:?}"),
            }
        })
    }

    /// Flatten prompt content blocks into the user message, inlining
    /// client-readable resources.
    async fn render_prompt(
        &self,
        session_id: &str,
        state: &SessionState,
        blocks: &[ContentBlock],
    ) -> anyhow::Result<String> {
        let mut out = String::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => out.push_str(text),
                ContentBlock::Image { .. } => out.push_str("[image attachment]"),
                ContentBlock::Audio { .. } => out.push_str("[audio attachment]"),
                ContentBlock::ResourceLink { uri, .. } => {
                    let raw = uri.strip_prefix("file://").unwrap_or(uri);
                    let path = resolve_within(&state.cwd, raw, self.case)
                        .with_context(|| format!("resource link {uri}"))?;
                    let fs = RpcFs { conn: self.conn.clone() };
                    let content = fs
                        .read_text_file(session_id, &path)
                        .await
                        .with_context(|| format!("reading {uri}"))?;
                    out.push_str(&format!(
                        "\n<context path=\"{}\">\n{content}\n</context>\n",
                        path.display()
                    ));
                }
                ContentBlock::Resource { resource } => {
                    if let Some(text) = &resource.text {
                        let label = resource.uri.as_deref().unwrap_or("embedded");
                        out.push_str(&format!(
                            "\n<context path=\"{label}\">\n{text}\n</context>\n"
                        ));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn forward_event(&self, session_id: &str, event: AgentEvent, handle: &TurnHandle) {
        match event {
            AgentEvent::Choice(text) => {
                self.update(session_id, json!({ "kind": "agent_message_text", "text": text }))
                    .await;
            }
            AgentEvent::ChoiceReasoning(text) => {
                self.update(session_id, json!({ "kind": "agent_thought_text", "text": text }))
                    .await;
            }
            AgentEvent::ToolCallStarted { call, def } => {
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                let mut tool_call = json!({
                    "id": call.id,
                    "name": call.name,
                    "tool_kind": infer_tool_kind(&call.name, &def.annotations),
                    "locations": extract_locations(&args),
                });
                if let Some(diff) = render_diff(&call.name, &args) {
                    tool_call["diff"] = serde_json::to_value(diff).unwrap_or(Value::Null);
                }
                self.update(
                    session_id,
                    json!({ "kind": "tool_call_start", "tool_call": tool_call }),
                )
                .await;
            }
            AgentEvent::ToolCallResponse { call, response, is_error, meta } => {
                self.update(
                    session_id,
                    json!({
                        "kind": "tool_call_update",
                        "id": call.id,
                        "status": if is_error { "failed" } else { "completed" },
                        "content": response,
                    }),
                )
                .await;
                // Plan snapshots ride the meta payload of todo tools.
                if let Some(todos) = meta.as_ref().and_then(|m| m.get("todos")) {
                    self.update(
                        session_id,
                        json!({ "kind": "plan_update", "entries": todos }),
                    )
                    .await;
                }
            }
            AgentEvent::ToolCallConfirmation { call, def } => {
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                let mut tool_call = json!({
                    "id": call.id,
                    "name": call.name,
                    "tool_kind": infer_tool_kind(&call.name, &def.annotations),
                    "locations": extract_locations(&args),
                });
                if let Some(diff) = render_diff(&call.name, &args) {
                    tool_call["diff"] = serde_json::to_value(diff).unwrap_or(Value::Null);
                }
                self.request_permission(session_id, tool_call, handle).await;
            }
            AgentEvent::MaxIterationsReached(n) => {
                let tool_call = json!({
                    "id": format!("iterations-{n}"),
                    "name": "continue_iterations",
                    "tool_kind": "other",
                    "locations": [],
                });
                self.request_permission(session_id, tool_call, handle).await;
            }
            AgentEvent::Error(e) => {
                warn!(%session_id, "turn error: {e}");
                self.update(
                    session_id,
                    json!({ "kind": "agent_message_text", "text": format!("Error: {e}") }),
                )
                .await;
            }
        }
    }

    async fn update(&self, session_id: &str, update: Value) {
        let params = json!({ "session_id": session_id, "update": update });
        if let Err(e) = self.conn.notify("session/update", params).await {
            warn!("session/update failed: {e:#}");
        }
    }

    /// Ask the client for permission and resume (or cancel) the paused turn.
    async fn request_permission(&self, session_id: &str, tool_call: Value, handle: &TurnHandle) {
        let params = json!({
            "session_id": session_id,
            "tool_call": tool_call,
            "options": permission_options(),
        });
        let outcome = match self.conn.request("session/request_permission", params).await {
            Ok(result) => parse_permission_outcome(&result),
            Err(e) => {
                warn!("permission request failed: {e:#}");
                PermissionOutcome::Cancelled
            }
        };
        match outcome {
            PermissionOutcome::Selected(id) if id == "allow-once" => {
                handle.resume(ResumeRequest::Approve).await;
            }
            PermissionOutcome::Selected(id) if id == "allow-always" => {
                handle.resume(ResumeRequest::ApproveSession).await;
            }
            PermissionOutcome::Selected(_) => {
                handle.resume(ResumeRequest::Reject).await;
            }
            PermissionOutcome::Cancelled => {
                // Reject the call and end the turn.
                handle.resume(ResumeRequest::Reject).await;
                handle.cancel();
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_session_for_tests(
        &self,
        team: Arc<Team>,
        cwd: PathBuf,
    ) -> String {
        let session = Session::new(Some(cwd.clone()));
        let id = session.id.clone();
        let state = Arc::new(SessionState {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            runtime: Runtime::new(team.clone()),
            team,
            cwd,
            active: std::sync::Mutex::new(None),
        });
        self.sessions.lock().await.insert(id.clone(), state);
        id
    }
}

/// Parse one entry of `session/new`'s `mcp_servers` into toolset config.
fn mcp_server_config(server: &Value) -> anyhow::Result<ToolsetConfig> {
    let command = server["command"].as_str().map(str::to_string);
    let url = server["url"].as_str().map(str::to_string);
    anyhow::ensure!(
        command.is_some() || url.is_some(),
        "mcp server entry needs 'command' or 'url'"
    );
    let args = server["args"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let env = server["env"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let transport = match server["transport"].as_str() {
        Some("sse") => McpTransport::Sse,
        _ => McpTransport::Http,
    };
    Ok(ToolsetConfig::Mcp {
        command,
        args,
        env,
        cwd: server["cwd"].as_str().map(str::to_string),
        url,
        transport,
        headers: Default::default(),
        tool_filter: vec![],
        prefix: server["name"].as_str().map(str::to_string),
        oauth: RemoteOAuthConfig::default(),
    })
}

/// Elicitation requests from MCP servers become client requests.
struct ElicitationForwarder {
    conn: Arc<dyn ClientConnection>,
    session_id: String,
}

#[async_trait]
impl ElicitationHandler for ElicitationForwarder {
    async fn elicit(&self, req: ElicitationRequest) -> anyhow::Result<ElicitationResponse> {
        let params = json!({
            "session_id": self.session_id,
            "message": req.message,
            "requested_schema": req.schema,
        });
        let result = self.conn.request("session/elicitation", params).await?;
        let action = match result["action"].as_str() {
            Some("accept") => ElicitationAction::Accept,
            Some("decline") => ElicitationAction::Decline,
            _ => ElicitationAction::Cancel,
        };
        Ok(ElicitationResponse {
            action,
            content: result.get("content").cloned().filter(|c| !c.is_null()),
        })
    }
}

/// Client filesystem RPC as seen by the scoped filesystem toolset.
struct RpcFs {
    conn: Arc<dyn ClientConnection>,
}

#[async_trait]
impl ClientFs for RpcFs {
    async fn read_text_file(&self, session_id: &str, path: &Path) -> anyhow::Result<String> {
        let result = self
            .conn
            .request(
                "fs/read_text_file",
                json!({ "session_id": session_id, "path": path.to_string_lossy() }),
            )
            .await?;
        result["content"]
            .as_str()
            .map(str::to_string)
            .context("fs/read_text_file response missing content")
    }

    async fn write_text_file(
        &self,
        session_id: &str,
        path: &Path,
        content: &str,
    ) -> anyhow::Result<()> {
        self.conn
            .request(
                "fs/write_text_file",
                json!({
                    "session_id": session_id,
                    "path": path.to_string_lossy(),
                    "content": content,
                }),
            )
            .await?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
