// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `freja-mcp-client` — connects external MCP servers as freja toolsets.
//!
//! Transports: stdio subprocesses and remote servers (streamable HTTP or
//! legacy SSE).  Remote servers may require OAuth; the managed flow drives
//! the browser locally, the unmanaged flow delegates the interaction to the
//! external client through elicitation.

pub mod oauth;
pub mod protocol;
mod client;
mod remote;
mod stdio;
mod tokens;
mod toolset;

pub use client::{McpClient, ServerInfo, Transport, TRANSPORT_CLOSED};
pub use remote::{HttpTransport, RemoteAuth, SseTransport};
pub use stdio::StdioTransport;
pub use tokens::{OAuthToken, TokenCache};
pub use toolset::McpToolSet;
