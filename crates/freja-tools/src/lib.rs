// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod schema;
mod registry;
mod tool;
mod toolset;

pub use registry::ToolSetRegistry;
pub use tool::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput};
pub use toolset::{
    probe_elicitable, probe_instructable, probe_oauth, probe_startable, Elicitable,
    ElicitationAction, ElicitationHandler, ElicitationRequest, ElicitationResponse, Instructable,
    OAuthCapable, OAuthSuccessHandler, Startable, ToolSet,
};
