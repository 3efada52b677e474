// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `freja-acp` — exposes the runtime to external clients over line-delimited
//! JSON-RPC on stdio: prompt turns stream back as session updates, tool
//! consent rides permission requests, and the client's filesystem RPC backs
//! the session-scoped filesystem toolset.

pub mod fs;
pub mod protocol;
pub mod toolkind;
mod bridge;
mod server;

pub use bridge::{AcpBridge, ClientConnection};
pub use server::{serve, serve_io, StdioConnection};
