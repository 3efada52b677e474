// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Toolset lifecycle and capability probing.
//!
//! A toolset is a collection of tools sharing a lifecycle (an MCP server
//! connection, a shared todo list, …).  Optional capabilities are separate
//! traits surfaced through `as_*` accessors; decorators expose their wrapped
//! set via [`ToolSet::inner`] and the `probe_*` helpers walk that chain, so
//! wrapping a set never hides what it can do.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::Tool;

/// A startable/stoppable lifecycle.  Start is expected to be driven through
/// a single-flight guard (see [`crate::registry::ToolSetRegistry`]); stop
/// must not be aborted by caller cancellation.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Provides usage guidance injected into the agent's system prompt.
pub trait Instructable: Send + Sync {
    fn instructions(&self) -> Option<String>;
}

/// A user-input request initiated by a toolset (MCP elicitation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationRequest {
    pub message: String,
    /// Schema of the requested content, when the server constrains it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationResponse {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Routes a toolset's elicitation request to whatever can ask a human.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, req: ElicitationRequest) -> anyhow::Result<ElicitationResponse>;
}

/// Accepts an elicitation handler.
pub trait Elicitable: Send + Sync {
    fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>);
}

/// Called after a successful OAuth flow with the server base URL.
pub type OAuthSuccessHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// OAuth-aware toolsets (remote MCP servers).
pub trait OAuthCapable: Send + Sync {
    fn set_oauth_success_handler(&self, handler: OAuthSuccessHandler);
    /// Managed: the runtime drives the browser flow itself.  Unmanaged: the
    /// authorization interaction is delegated to the external client.
    fn set_managed(&self, managed: bool);
}

/// A named collection of tools sharing a lifecycle.
#[async_trait]
pub trait ToolSet: Send + Sync {
    /// Short stable name used in logs and for tool-name prefixing.
    fn name(&self) -> &str;

    /// The tools this set provides.  Valid only after the set has been
    /// started (when it is startable at all).
    async fn tools(&self) -> anyhow::Result<Vec<Tool>>;

    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }
    fn as_instructable(&self) -> Option<&dyn Instructable> {
        None
    }
    fn as_elicitable(&self) -> Option<&dyn Elicitable> {
        None
    }
    fn as_oauth(&self) -> Option<&dyn OAuthCapable> {
        None
    }

    /// Decorators return the wrapped set here so capability probing can walk
    /// the chain.
    fn inner(&self) -> Option<&dyn ToolSet> {
        None
    }
}

/// Walk the decorator chain until a set exposes [`Startable`].
pub fn probe_startable(ts: &dyn ToolSet) -> Option<&dyn Startable> {
    let mut current = Some(ts);
    while let Some(set) = current {
        if let Some(cap) = set.as_startable() {
            return Some(cap);
        }
        current = set.inner();
    }
    None
}

/// Walk the decorator chain until a set exposes [`Instructable`].
pub fn probe_instructable(ts: &dyn ToolSet) -> Option<&dyn Instructable> {
    let mut current = Some(ts);
    while let Some(set) = current {
        if let Some(cap) = set.as_instructable() {
            return Some(cap);
        }
        current = set.inner();
    }
    None
}

/// Walk the decorator chain until a set exposes [`Elicitable`].
pub fn probe_elicitable(ts: &dyn ToolSet) -> Option<&dyn Elicitable> {
    let mut current = Some(ts);
    while let Some(set) = current {
        if let Some(cap) = set.as_elicitable() {
            return Some(cap);
        }
        current = set.inner();
    }
    None
}

/// Walk the decorator chain until a set exposes [`OAuthCapable`].
pub fn probe_oauth(ts: &dyn ToolSet) -> Option<&dyn OAuthCapable> {
    let mut current = Some(ts);
    while let Some(set) = current {
        if let Some(cap) = set.as_oauth() {
            return Some(cap);
        }
        current = set.inner();
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Plain;

    #[async_trait]
    impl ToolSet for Plain {
        fn name(&self) -> &str {
            "plain"
        }
        async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
            Ok(vec![])
        }
    }

    struct WithStart {
        started: AtomicBool,
    }

    #[async_trait]
    impl Startable for WithStart {
        async fn start(&self) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ToolSet for WithStart {
        fn name(&self) -> &str {
            "with-start"
        }
        async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
            Ok(vec![])
        }
        fn as_startable(&self) -> Option<&dyn Startable> {
            Some(self)
        }
    }

    /// A decorator that adds nothing but forwards `inner`.
    struct Wrapper {
        inner: Box<dyn ToolSet>,
    }

    #[async_trait]
    impl ToolSet for Wrapper {
        fn name(&self) -> &str {
            "wrapper"
        }
        async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
            self.inner.tools().await
        }
        fn inner(&self) -> Option<&dyn ToolSet> {
            Some(self.inner.as_ref())
        }
    }

    #[test]
    fn probe_on_plain_set_is_none() {
        assert!(probe_startable(&Plain).is_none());
        assert!(probe_instructable(&Plain).is_none());
    }

    #[test]
    fn probe_finds_direct_capability() {
        let ts = WithStart { started: AtomicBool::new(false) };
        assert!(probe_startable(&ts).is_some());
    }

    #[tokio::test]
    async fn probe_walks_decorator_chain() {
        let wrapped = Wrapper {
            inner: Box::new(Wrapper {
                inner: Box::new(WithStart { started: AtomicBool::new(false) }),
            }),
        };
        let cap = probe_startable(&wrapped).expect("capability through two wrappers");
        cap.start().await.unwrap();
    }

    #[test]
    fn probe_chain_without_capability_is_none() {
        let wrapped = Wrapper { inner: Box::new(Plain) };
        assert!(probe_oauth(&wrapped).is_none());
    }

    #[test]
    fn elicitation_action_serializes_lowercase() {
        let json = serde_json::to_string(&ElicitationAction::Decline).unwrap();
        assert_eq!(json, "\"decline\"");
    }
}
