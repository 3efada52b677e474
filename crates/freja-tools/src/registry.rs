// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::tool::Tool;
use crate::toolset::{probe_instructable, probe_startable, ToolSet};

struct Entry {
    set: Arc<dyn ToolSet>,
    // Single-flight start guard: concurrent callers queue on the lock and
    // find the flag already set; a failed start leaves it unset so a later
    // call retries.
    started: Mutex<bool>,
}

impl Entry {
    async fn ensure_started(&self) -> anyhow::Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        if let Some(lifecycle) = probe_startable(self.set.as_ref()) {
            lifecycle.start().await?;
        }
        *started = true;
        Ok(())
    }
}

/// The union of an agent's toolsets.
///
/// Toolsets start lazily on first use; a set whose start keeps failing
/// degrades to contributing no tools rather than failing the turn.
#[derive(Default)]
pub struct ToolSetRegistry {
    entries: Vec<Entry>,
}

impl ToolSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, set: Arc<dyn ToolSet>) {
        self.entries.push(Entry { set, started: Mutex::new(false) });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All tools across all toolsets, starting each set on first use.
    /// A set that fails to start or list is skipped with a warning.
    pub async fn tools(&self) -> Vec<Tool> {
        let mut all = Vec::new();
        for entry in &self.entries {
            if let Err(e) = entry.ensure_started().await {
                warn!(toolset = entry.set.name(), "toolset start failed: {e:#}");
                continue;
            }
            match entry.set.tools().await {
                Ok(tools) => all.extend(tools),
                Err(e) => warn!(toolset = entry.set.name(), "tool listing failed: {e:#}"),
            }
        }
        all
    }

    /// Resolve one tool by name from the union of started toolsets.
    pub async fn resolve(&self, name: &str) -> Option<Tool> {
        self.tools().await.into_iter().find(|t| t.name() == name)
    }

    /// Usage guidance from every instructable toolset, in registration order.
    pub async fn instructions(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.ensure_started().await.is_err() {
                continue;
            }
            if let Some(cap) = probe_instructable(entry.set.as_ref()) {
                if let Some(text) = cap.instructions() {
                    if !text.is_empty() {
                        out.push(text);
                    }
                }
            }
        }
        out
    }

    /// Stop every started toolset.  Stop errors are logged, never propagated;
    /// shutdown must not depend on every server saying goodbye cleanly.
    pub async fn stop_all(&self) {
        for entry in &self.entries {
            let mut started = entry.started.lock().await;
            if !*started {
                continue;
            }
            if let Some(lifecycle) = probe_startable(entry.set.as_ref()) {
                if let Err(e) = lifecycle.stop().await {
                    warn!(toolset = entry.set.name(), "toolset stop failed: {e:#}");
                }
            }
            *started = false;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
