// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use async_trait::async_trait;

/// Source of provider credentials and other named values.
///
/// The runtime never reads process environment directly; everything flows
/// through an injected provider so tests and embedders control resolution.
#[async_trait]
pub trait EnvProvider: Send + Sync {
    /// Resolve `name`, returning `None` when unset or empty.
    async fn get(&self, name: &str) -> Option<String>;
}

/// Process-environment backed provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEnv;

#[async_trait]
impl EnvProvider for OsEnv {
    async fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed-map provider for tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    values: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { values: values.into_iter().collect() }
    }
}

#[async_trait]
impl EnvProvider for StaticEnv {
    async fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
