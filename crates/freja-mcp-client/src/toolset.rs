// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! External MCP servers as toolsets.
//!
//! Lifecycle: lazy single-flight start (driven by the registry), the
//! initialize handshake with its retry, tool projection with optional
//! allow-list and name prefixing, and a stop that completes even when the
//! surrounding request was cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use freja_config::{McpTransport, RemoteOAuthConfig, ToolsetConfig};
use freja_tools::{
    Elicitable, ElicitationHandler, Instructable, OAuthCapable, OAuthSuccessHandler, Startable,
    Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput, ToolSet,
};

use crate::client::{McpClient, Transport, TRANSPORT_CLOSED};
use crate::remote::{HttpTransport, RemoteAuth, SseTransport};
use crate::stdio::StdioTransport;
use crate::tokens::TokenCache;

/// How to reach the server.
#[derive(Debug, Clone)]
enum ServerAddress {
    Stdio {
        command: String,
        args: Vec<String>,
        env: std::collections::HashMap<String, String>,
        cwd: Option<String>,
    },
    Remote {
        url: String,
        transport: McpTransport,
        headers: std::collections::HashMap<String, String>,
    },
}

pub struct McpToolSet {
    name: String,
    address: ServerAddress,
    tool_filter: Vec<String>,
    prefix: Option<String>,
    auth: Arc<RemoteAuth>,
    client: tokio::sync::Mutex<Option<Arc<McpClient>>>,
    instructions: RwLock<Option<String>>,
    elicitation: RwLock<Option<Arc<dyn ElicitationHandler>>>,
    /// Set when the server was unreachable during initialize; the set then
    /// yields no tools instead of failing every turn.
    degraded: AtomicBool,
}

impl McpToolSet {
    /// Build a toolset from the `mcp` toolset configuration.
    pub fn from_config(cfg: &ToolsetConfig, cache: Arc<TokenCache>) -> anyhow::Result<Self> {
        let ToolsetConfig::Mcp {
            command,
            args,
            env,
            cwd,
            url,
            transport,
            headers,
            tool_filter,
            prefix,
            oauth,
        } = cfg
        else {
            bail!("not an mcp toolset configuration");
        };

        let address = match (command, url) {
            (Some(cmd), None) => ServerAddress::Stdio {
                command: cmd.clone(),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
            },
            (None, Some(u)) => ServerAddress::Remote {
                url: u.clone(),
                transport: *transport,
                headers: headers.clone(),
            },
            (Some(_), Some(_)) => bail!("mcp toolset: 'command' and 'url' are mutually exclusive"),
            (None, None) => bail!("mcp toolset: one of 'command' or 'url' is required"),
        };

        let name = prefix.clone().unwrap_or_else(|| derive_name(&address));
        let RemoteOAuthConfig { managed, gateway_url } = oauth.clone();

        Ok(Self {
            name,
            address,
            tool_filter: tool_filter.clone(),
            prefix: prefix.clone(),
            auth: RemoteAuth::new(cache, managed, gateway_url),
            client: tokio::sync::Mutex::new(None),
            instructions: RwLock::new(None),
            elicitation: RwLock::new(None),
            degraded: AtomicBool::new(false),
        })
    }

    async fn connect(&self) -> anyhow::Result<Arc<McpClient>> {
        let (transport, inbound): (Arc<dyn Transport>, _) = match &self.address {
            ServerAddress::Stdio { command, args, env, cwd } => {
                let (t, rx) = StdioTransport::spawn(command, args, env, cwd.as_deref())?;
                (Arc::new(t), rx)
            }
            ServerAddress::Remote { url, transport, headers } => match transport {
                McpTransport::Http => {
                    let (t, rx) =
                        HttpTransport::connect(url.clone(), headers.clone(), self.auth.clone());
                    (t, rx)
                }
                McpTransport::Sse => {
                    let (t, rx) =
                        SseTransport::connect(url.clone(), headers.clone(), self.auth.clone())
                            .await?;
                    (t, rx)
                }
            },
        };
        Ok(McpClient::new(transport, inbound))
    }
}

fn derive_name(address: &ServerAddress) -> String {
    match address {
        ServerAddress::Stdio { command, .. } => command
            .rsplit('/')
            .next()
            .unwrap_or(command)
            .to_string(),
        ServerAddress::Remote { url, .. } => url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "remote".into()),
    }
}

/// Whether an initialize failure means "server unavailable" rather than a
/// protocol problem.
fn is_server_unavailable(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    msg.contains(TRANSPORT_CLOSED) || msg.contains("Broken pipe") || msg.contains("os error 32")
}

/// Project one raw server tool into a definition plus its remote name.
/// Returns `None` for entries without a usable name.
pub(crate) fn project_def(raw: &Value, prefix: Option<&str>) -> Option<(ToolDef, String)> {
    let remote_name = raw["name"].as_str()?.to_string();
    let display_name = match prefix {
        Some(p) => format!("{p}_{remote_name}"),
        None => remote_name.clone(),
    };
    let annotations_raw = &raw["annotations"];
    let annotations = ToolAnnotations {
        title: annotations_raw["title"].as_str().map(str::to_string),
        read_only_hint: annotations_raw["readOnlyHint"].as_bool(),
        destructive_hint: annotations_raw["destructiveHint"].as_bool(),
        idempotent_hint: annotations_raw["idempotentHint"].as_bool(),
        open_world_hint: annotations_raw["openWorldHint"].as_bool(),
    };
    let mut def = ToolDef::new(
        display_name,
        raw["description"].as_str().unwrap_or(""),
        raw.get("inputSchema").cloned().unwrap_or(Value::Null),
    )
    .with_annotations(annotations);
    def.output_schema = raw.get("outputSchema").cloned().filter(|v| !v.is_null());
    Some((def, remote_name))
}

#[async_trait]
impl ToolSet for McpToolSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
        if self.degraded.load(Ordering::SeqCst) {
            return Ok(vec![]);
        }
        let client = match self.client.lock().await.clone() {
            Some(c) => c,
            None => bail!("toolset '{}' not started", self.name),
        };

        let raw_tools = client.list_tools().await?;
        let mut tools = Vec::with_capacity(raw_tools.len());
        for raw in &raw_tools {
            let Some((def, remote_name)) = project_def(raw, self.prefix.as_deref()) else {
                continue;
            };
            if !self.tool_filter.is_empty()
                && !self.tool_filter.iter().any(|f| f == &remote_name)
            {
                continue;
            }
            tools.push(Tool::new(
                def,
                Arc::new(McpToolHandler { client: client.clone(), remote_name }),
            ));
        }
        Ok(tools)
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }
    fn as_instructable(&self) -> Option<&dyn Instructable> {
        Some(self)
    }
    fn as_elicitable(&self) -> Option<&dyn Elicitable> {
        Some(self)
    }
    fn as_oauth(&self) -> Option<&dyn OAuthCapable> {
        Some(self)
    }
}

#[async_trait]
impl Startable for McpToolSet {
    async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.client.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let client = self.connect().await?;
        if let Some(handler) = self.elicitation.read().expect("elicitation lock").clone() {
            client.set_elicitation_handler(handler);
        }

        match client.initialize().await {
            Ok(info) => {
                debug!(server = %info.name, version = %info.version, "mcp server started");
                *self.instructions.write().expect("instructions lock") = info.instructions;
                *slot = Some(client);
                Ok(())
            }
            Err(e) if is_server_unavailable(&e) => {
                warn!(toolset = %self.name, "mcp server unavailable, continuing without it: {e:#}");
                let _ = client.close().await;
                self.degraded.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let _ = client.close().await;
                Err(e.context(format!("initializing mcp server '{}'", self.name)))
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let client = self.client.lock().await.take();
        self.degraded.store(false, Ordering::SeqCst);
        if let Some(client) = client {
            // Run the shutdown on its own task so a cancelled caller cannot
            // abort it half-way; close errors at shutdown are noise.
            let done = tokio::spawn(async move { client.close().await });
            match done.await {
                Ok(Err(e)) => debug!("mcp close reported: {e:#}"),
                Err(e) => warn!("mcp close task failed: {e}"),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }
}

impl Instructable for McpToolSet {
    fn instructions(&self) -> Option<String> {
        self.instructions.read().expect("instructions lock").clone()
    }
}

impl Elicitable for McpToolSet {
    fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        *self.elicitation.write().expect("elicitation lock") = Some(handler.clone());
        *self.auth.elicitation.write().expect("auth elicitation lock") = Some(handler);
    }
}

impl OAuthCapable for McpToolSet {
    fn set_oauth_success_handler(&self, handler: OAuthSuccessHandler) {
        *self.auth.on_success.write().expect("auth success lock") = Some(handler);
    }

    fn set_managed(&self, managed: bool) {
        self.auth.managed.store(managed, Ordering::SeqCst);
    }
}

struct McpToolHandler {
    client: Arc<McpClient>,
    remote_name: String,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let raw_args = call.args.to_string();
        match self.client.call_tool(&self.remote_name, &raw_args).await {
            Ok((text, false)) => ToolOutput::ok(&call.id, text),
            Ok((text, true)) => ToolOutput::err(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, format!("{e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn mcp_config(command: Option<&str>, url: Option<&str>) -> ToolsetConfig {
        ToolsetConfig::Mcp {
            command: command.map(str::to_string),
            args: vec![],
            env: Default::default(),
            cwd: None,
            url: url.map(str::to_string),
            transport: McpTransport::Http,
            headers: Default::default(),
            tool_filter: vec![],
            prefix: None,
            oauth: RemoteOAuthConfig::default(),
        }
    }

    #[test]
    fn config_requires_exactly_one_address() {
        let cache = Arc::new(TokenCache::new());
        assert!(McpToolSet::from_config(&mcp_config(None, None), cache.clone()).is_err());
        assert!(McpToolSet::from_config(
            &mcp_config(Some("cmd"), Some("https://x")),
            cache.clone()
        )
        .is_err());
        assert!(McpToolSet::from_config(&mcp_config(Some("cmd"), None), cache).is_ok());
    }

    #[test]
    fn name_derives_from_command_basename_or_host() {
        let cache = Arc::new(TokenCache::new());
        let stdio =
            McpToolSet::from_config(&mcp_config(Some("/usr/bin/mcp-files"), None), cache.clone())
                .unwrap();
        assert_eq!(stdio.name(), "mcp-files");
        let remote =
            McpToolSet::from_config(&mcp_config(None, Some("https://mcp.example.com/v1")), cache)
                .unwrap();
        assert_eq!(remote.name(), "mcp.example.com");
    }

    // ── project_def ───────────────────────────────────────────────────────────

    #[test]
    fn project_maps_annotations_and_schema() {
        let raw = json!({
            "name": "fetch",
            "description": "Fetch a URL",
            "inputSchema": { "properties": { "url": { "type": "string" } } },
            "annotations": { "title": "Fetcher", "readOnlyHint": true, "openWorldHint": true }
        });
        let (def, remote) = project_def(&raw, None).unwrap();
        assert_eq!(remote, "fetch");
        assert_eq!(def.name, "fetch");
        assert_eq!(def.annotations.title.as_deref(), Some("Fetcher"));
        assert_eq!(def.annotations.read_only_hint, Some(true));
        assert_eq!(def.annotations.open_world_hint, Some(true));
        // Schema normalization filled the missing top-level type.
        assert_eq!(def.parameters["type"], "object");
    }

    #[test]
    fn project_applies_prefix() {
        let raw = json!({ "name": "search", "description": "" });
        let (def, remote) = project_def(&raw, Some("github")).unwrap();
        assert_eq!(def.name, "github_search");
        assert_eq!(remote, "search");
    }

    #[test]
    fn project_without_name_is_none() {
        assert!(project_def(&json!({ "description": "x" }), None).is_none());
    }

    #[test]
    fn project_keeps_output_schema() {
        let raw = json!({
            "name": "count",
            "outputSchema": { "type": "object", "properties": { "n": { "type": "integer" } } }
        });
        let (def, _) = project_def(&raw, None).unwrap();
        assert!(def.output_schema.is_some());
    }

    // ── lifecycle against a scripted subprocess ──────────────────────────────

    /// A shell one-liner that answers the handshake and one tools/list.
    fn scripted_server() -> ToolsetConfig {
        let script = concat!(
            "read a; ",
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fake","version":"1"},"instructions":"prefer small requests"}}'; "#,
            "read b; read c; ",
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echoes input","inputSchema":{"type":"object"}},{"name":"hidden","description":"","inputSchema":{"type":"object"}}]}}'; "#,
            "cat >/dev/null",
        );
        ToolsetConfig::Mcp {
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into()],
            env: Default::default(),
            cwd: None,
            url: None,
            transport: McpTransport::Http,
            headers: Default::default(),
            tool_filter: vec!["echo".into()],
            prefix: Some("fake".into()),
            oauth: RemoteOAuthConfig::default(),
        }
    }

    #[tokio::test]
    async fn start_list_filter_prefix_and_stop() {
        let set =
            McpToolSet::from_config(&scripted_server(), Arc::new(TokenCache::new())).unwrap();
        set.start().await.unwrap();

        assert_eq!(
            Instructable::instructions(&set).as_deref(),
            Some("prefer small requests")
        );

        let tools = set.tools().await.unwrap();
        // "hidden" is filtered out; "echo" is prefixed.
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "fake_echo");

        set.stop().await.unwrap();
        assert!(set.tools().await.is_err(), "stopped set has no client");
    }

    #[tokio::test]
    async fn unavailable_server_degrades_to_empty_toolset() {
        let cfg = ToolsetConfig::Mcp {
            command: Some("true".into()),
            args: vec![],
            env: Default::default(),
            cwd: None,
            url: None,
            transport: McpTransport::Http,
            headers: Default::default(),
            tool_filter: vec![],
            prefix: None,
            oauth: RemoteOAuthConfig::default(),
        };
        let set = McpToolSet::from_config(&cfg, Arc::new(TokenCache::new())).unwrap();
        // Start succeeds despite the immediate EOF.
        set.start().await.unwrap();
        assert!(set.tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent_once_connected() {
        let set =
            McpToolSet::from_config(&scripted_server(), Arc::new(TokenCache::new())).unwrap();
        set.start().await.unwrap();
        // A second start finds the live client and leaves it alone.
        set.start().await.unwrap();
        assert_eq!(set.tools().await.unwrap().len(), 1);
    }
}
