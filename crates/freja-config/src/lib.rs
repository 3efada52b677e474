// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod env;
mod loader;
mod schema;

pub use env::{EnvProvider, OsEnv, StaticEnv};
pub use loader::{load_config, load_config_str};
pub use schema::{
    AgentConfig, ApprovalMode, Config, McpTransport, ModelConfig, RemoteOAuthConfig,
    ToolsetConfig,
};
