// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    20
}

/// Top-level team configuration.
///
/// ```yaml
/// models:
///   sonnet:
///     provider: anthropic
///     name: claude-sonnet-4-5
///     api_key_env: ANTHROPIC_API_KEY
/// agents:
///   root:
///     model: sonnet
///     instruction: You are a helpful assistant.
///     sub_agents: [researcher]
///     toolsets:
///       - type: todo
///       - type: mcp
///         command: docker
///         args: [run, -i, --rm, "mcp/fetch"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named model configurations, referenced from agents by key.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Agents keyed by name.  `root` is the entry agent unless overridden.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

impl Config {
    /// The entry agent name.  A team always starts at `root`; configs that
    /// define a single agent under another name use that agent instead.
    pub fn root_agent(&self) -> Option<&str> {
        if self.agents.contains_key("root") {
            return Some("root");
        }
        if self.agents.len() == 1 {
            return self.agents.keys().next().map(String::as_str);
        }
        None
    }

    /// Validate cross-references: every agent's model alias and sub-agent
    /// name must resolve, and the team must have an entry agent.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root_agent().is_none() {
            anyhow::bail!("no root agent: define an agent named 'root'");
        }
        for (name, agent) in &self.agents {
            if !self.models.contains_key(&agent.model) {
                anyhow::bail!("agent '{name}' references unknown model '{}'", agent.model);
            }
            for sub in &agent.sub_agents {
                if !self.agents.contains_key(sub) {
                    anyhow::bail!("agent '{name}' references unknown sub-agent '{sub}'");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | any OpenAI-compatible
    /// driver id ("openrouter", "groq", "ollama", …).
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime through
    /// the injected environment provider, never from the process directly).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override for proxies and local servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Context window ceiling for this model.  Used by the automatic
    /// max_tokens clamp when the provider rejects a request as too large.
    pub context_window: Option<u32>,
}

/// How tool calls are gated on user consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Run every tool without asking.
    Auto,
    /// Ask before tools that are destructive or not read-only.
    #[default]
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model alias (key into `Config::models`).
    pub model: String,
    /// System instruction.  Supports `{{date}}` template expansion when
    /// `add_date` is set.
    #[serde(default)]
    pub instruction: String,
    /// Short human description shown to parent agents when delegating.
    #[serde(default)]
    pub description: String,
    /// Append the current date to the system prompt.
    #[serde(default)]
    pub add_date: bool,
    /// Upper bound on reasoning/tool iterations per turn.  Reaching it pauses
    /// the turn on a continuation prompt rather than failing.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Consent policy for tool execution.
    #[serde(default)]
    pub approval: ApprovalMode,
    /// Names of agents this agent may hand tasks to.
    #[serde(default)]
    pub sub_agents: Vec<String>,
    /// Toolsets available to this agent.
    #[serde(default)]
    pub toolsets: Vec<ToolsetConfig>,
}

/// Remote MCP transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    /// Streamable HTTP (single endpoint, optional SSE response bodies).
    #[default]
    Http,
    /// Legacy SSE (GET event stream + POSTed messages).
    Sse,
}

/// OAuth behaviour for remote MCP servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOAuthConfig {
    /// When true the runtime drives the browser flow itself; when false the
    /// authorization interaction is delegated to the external client.
    #[serde(default = "default_true")]
    pub managed: bool,
    /// Optional gateway base URL used instead of direct authorization-server
    /// discovery.  Injected here rather than read from process environment.
    pub gateway_url: Option<String>,
}

impl Default for RemoteOAuthConfig {
    fn default() -> Self {
        Self { managed: true, gateway_url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolsetConfig {
    /// External MCP server, stdio or remote.
    Mcp {
        /// Subprocess command for stdio transport.
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        cwd: Option<String>,
        /// Remote server URL.  Mutually exclusive with `command`.
        url: Option<String>,
        #[serde(default)]
        transport: McpTransport,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Allow-list of tool names; empty means all.
        #[serde(default)]
        tool_filter: Vec<String>,
        /// Prefix projected tool names with this toolset name to avoid
        /// collisions across servers.
        prefix: Option<String>,
        #[serde(default)]
        oauth: RemoteOAuthConfig,
    },
    /// Builtin shared todo list (plan updates for the client).
    Todo,
    /// Builtin reasoning scratchpad.
    Think,
    /// Builtin file-backed memory notes.
    Memory {
        /// Note file path; defaults to `.freja/memory.md` under the session
        /// working directory.
        path: Option<String>,
    },
    /// Client-delegated filesystem access scoped to the session directory.
    Filesystem,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
