// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A bearer token as returned by the token endpoint (or handed over by the
/// external client in the delegated flow).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

struct CachedToken {
    token: OAuthToken,
    expires_at: Option<Instant>,
}

/// Per-base-URL token store.  Tokens are considered expired slightly before
/// their absolute expiry so a request never departs with a token that dies
/// in flight.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    /// Expiry safety margin.
    const SKEW: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, base_url: &str, token: OAuthToken) {
        let expires_at = token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        self.entries
            .lock()
            .expect("token cache lock")
            .insert(base_url.to_string(), CachedToken { token, expires_at });
    }

    /// A live token for the base URL, or `None` when absent or within the
    /// expiry skew.
    pub fn get(&self, base_url: &str) -> Option<OAuthToken> {
        let entries = self.entries.lock().expect("token cache lock");
        let cached = entries.get(base_url)?;
        if let Some(at) = cached.expires_at {
            if Instant::now() + Self::SKEW >= at {
                return None;
            }
        }
        Some(cached.token.clone())
    }

    pub fn remove(&self, base_url: &str) {
        self.entries.lock().expect("token cache lock").remove(base_url);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
