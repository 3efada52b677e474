// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use freja_config::{AgentConfig, Config, EnvProvider, ToolsetConfig};
use freja_model::Provider;
use freja_tools::builtin::{MemoryToolSet, ThinkToolSet, TodoToolSet};
use freja_tools::{ToolSet, ToolSetRegistry};

/// Builds toolsets the team crate does not know how to construct itself
/// (MCP servers, client-delegated filesystem access).  Injected by the
/// embedding layer.
pub type ToolSetFactory =
    Arc<dyn Fn(&ToolsetConfig) -> anyhow::Result<Arc<dyn ToolSet>> + Send + Sync>;

/// One named, parameterized prompt + toolset bundle.
pub struct Agent {
    pub name: String,
    pub config: AgentConfig,
    pub provider: Arc<dyn Provider>,
    pub toolsets: ToolSetRegistry,
}

impl Agent {
    /// Whether this agent can hand tasks to sub-agents.
    pub fn has_sub_agents(&self) -> bool {
        !self.config.sub_agents.is_empty()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("name", &self.name).finish()
    }
}

/// An arena of agents indexed by stable name.  Sub-agent and parent
/// relationships are name lists resolved through lookup, never owning
/// references, so teams with agent cycles are representable.
pub struct Team {
    agents: HashMap<String, Agent>,
    root: String,
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("root", &self.root)
            .finish()
    }
}

impl Team {
    /// Assemble a team from already-constructed agents.  Embedders and tests
    /// use this to skip the config layer.
    pub fn from_agents(
        agents: impl IntoIterator<Item = Agent>,
        root: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let agents: HashMap<String, Agent> =
            agents.into_iter().map(|a| (a.name.clone(), a)).collect();
        let root = root.into();
        anyhow::ensure!(agents.contains_key(&root), "root agent '{root}' not in team");
        Ok(Self { agents, root })
    }

    /// Build a team from configuration.  Providers are constructed per model
    /// alias; builtin toolsets are wired directly and everything else goes
    /// through `factory`.
    pub async fn from_config(
        cfg: &Config,
        env: &dyn EnvProvider,
        factory: ToolSetFactory,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let root = cfg
            .root_agent()
            .context("config has no root agent")?
            .to_string();

        // One provider per model alias, shared by every agent using it.
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (alias, model_cfg) in &cfg.models {
            let provider = freja_model::from_config(model_cfg, env)
                .await
                .with_context(|| format!("model '{alias}'"))?;
            providers.insert(alias.clone(), provider);
        }

        let mut agents = HashMap::new();
        for (name, agent_cfg) in &cfg.agents {
            let provider = providers
                .get(&agent_cfg.model)
                .cloned()
                .with_context(|| format!("agent '{name}': model '{}'", agent_cfg.model))?;

            let mut toolsets = ToolSetRegistry::new();
            for ts_cfg in &agent_cfg.toolsets {
                let set: Arc<dyn ToolSet> = match ts_cfg {
                    ToolsetConfig::Todo => Arc::new(TodoToolSet::new()),
                    ToolsetConfig::Think => Arc::new(ThinkToolSet),
                    ToolsetConfig::Memory { path } => Arc::new(MemoryToolSet::new(
                        path.clone().unwrap_or_else(|| ".freja/memory.md".into()),
                    )),
                    other => factory(other)
                        .with_context(|| format!("agent '{name}': toolset"))?,
                };
                toolsets.add(set);
            }

            agents.insert(
                name.clone(),
                Agent {
                    name: name.clone(),
                    config: agent_cfg.clone(),
                    provider,
                    toolsets,
                },
            );
        }

        Ok(Self { agents, root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve an agent's sub-agents by lookup; names that fail validation
    /// never reach this point.
    pub fn sub_agents(&self, name: &str) -> Vec<&Agent> {
        self.get(name)
            .map(|a| {
                a.config
                    .sub_agents
                    .iter()
                    .filter_map(|sub| self.agents.get(sub))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop every agent's toolsets.  Used when the owning session closes.
    pub async fn stop(&self) {
        for agent in self.agents.values() {
            agent.toolsets.stop_all().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use freja_config::{load_config_str, StaticEnv};

    use super::*;

    const TEAM_YAML: &str = r#"
models:
  m:
    provider: mock
    name: mock-model
agents:
  root:
    model: m
    instruction: coordinate
    sub_agents: [helper]
    toolsets:
      - type: todo
      - type: think
  helper:
    model: m
    instruction: assist
"#;

    fn no_factory() -> ToolSetFactory {
        Arc::new(|_| anyhow::bail!("no external toolsets in this test"))
    }

    #[tokio::test]
    async fn builds_team_from_config() {
        let cfg = load_config_str(TEAM_YAML).unwrap();
        let team = Team::from_config(&cfg, &StaticEnv::default(), no_factory())
            .await
            .unwrap();
        assert_eq!(team.root(), "root");
        assert_eq!(team.agent_names(), vec!["helper", "root"]);
    }

    #[tokio::test]
    async fn sub_agents_resolve_by_name() {
        let cfg = load_config_str(TEAM_YAML).unwrap();
        let team = Team::from_config(&cfg, &StaticEnv::default(), no_factory())
            .await
            .unwrap();
        let subs = team.sub_agents("root");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "helper");
        assert!(team.sub_agents("helper").is_empty());
    }

    #[tokio::test]
    async fn builtin_toolsets_are_wired() {
        let cfg = load_config_str(TEAM_YAML).unwrap();
        let team = Team::from_config(&cfg, &StaticEnv::default(), no_factory())
            .await
            .unwrap();
        let tools = team.get("root").unwrap().toolsets.tools().await;
        let names: Vec<_> = tools.iter().map(|t| t.name().to_string()).collect();
        assert!(names.contains(&"todo_write".to_string()));
        assert!(names.contains(&"think".to_string()));
    }

    #[tokio::test]
    async fn cyclic_sub_agent_references_are_navigable() {
        let yaml = r#"
models:
  m: { provider: mock, name: mock-model }
agents:
  root:
    model: m
    sub_agents: [helper]
  helper:
    model: m
    sub_agents: [root]
"#;
        let cfg = load_config_str(yaml).unwrap();
        let team = Team::from_config(&cfg, &StaticEnv::default(), no_factory())
            .await
            .unwrap();
        assert_eq!(team.sub_agents("root")[0].name, "helper");
        assert_eq!(team.sub_agents("helper")[0].name, "root");
    }

    #[tokio::test]
    async fn external_toolset_errors_surface() {
        let yaml = r#"
models:
  m: { provider: mock, name: mock-model }
agents:
  root:
    model: m
    toolsets:
      - type: mcp
        command: some-server
"#;
        let cfg = load_config_str(yaml).unwrap();
        let err = Team::from_config(&cfg, &StaticEnv::default(), no_factory())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("toolset"), "{err:#}");
    }
}
