// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod files;
pub mod sequence;
pub mod stream;
pub(crate) mod openai_compat;
mod anthropic;
mod mock;
mod provider;
mod types;

pub use anthropic::{clamp_max_tokens, AnthropicProvider};
pub use mock::{MockProvider, ScriptedProvider};
pub use provider::{EventStream, Provider};
pub use types::*;

use std::sync::Arc;

use anyhow::bail;
use freja_config::{EnvProvider, ModelConfig};
use openai_compat::{AuthStyle, OpenAICompatProvider};

/// Construct a [`Provider`] from configuration.
///
/// Credentials are resolved through the injected environment provider:
/// explicit `api_key` wins, then `api_key_env`.
pub async fn from_config(
    cfg: &ModelConfig,
    env: &dyn EnvProvider,
) -> anyhow::Result<Arc<dyn Provider>> {
    let key = match &cfg.api_key {
        Some(k) => Some(k.clone()),
        None => match &cfg.api_key_env {
            Some(var) => env.get(var).await,
            None => None,
        },
    };

    let base = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            cfg.name.clone(),
            key,
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            cfg.context_window,
        ))),
        "openai" => Ok(Arc::new(OpenAICompatProvider::new(
            "openai",
            cfg.name.clone(),
            key,
            &base("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "openrouter" => Ok(Arc::new(OpenAICompatProvider::new(
            "openrouter",
            cfg.name.clone(),
            key,
            &base("https://openrouter.ai/api/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "groq" => Ok(Arc::new(OpenAICompatProvider::new(
            "groq",
            cfg.name.clone(),
            key,
            &base("https://api.groq.com/openai/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "deepseek" => Ok(Arc::new(OpenAICompatProvider::new(
            "deepseek",
            cfg.name.clone(),
            key,
            &base("https://api.deepseek.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Arc::new(OpenAICompatProvider::new(
            "ollama",
            cfg.name.clone(),
            None,
            &base("http://localhost:11434/v1"),
            cfg.max_tokens,
            cfg.temperature,
            vec![],
            AuthStyle::None,
        ))),
        "mock" => Ok(Arc::new(MockProvider)),
        other => bail!("unknown model provider: {other}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use freja_config::StaticEnv;

    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: "some-model".into(),
            api_key_env: Some("KEY_VAR".into()),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            context_window: None,
        }
    }

    #[tokio::test]
    async fn builds_anthropic_driver() {
        let env = StaticEnv::new([("KEY_VAR".to_string(), "k".to_string())]);
        let p = from_config(&cfg("anthropic"), &env).await.unwrap();
        assert_eq!(p.name(), "anthropic");
    }

    #[tokio::test]
    async fn builds_openai_compatible_driver() {
        let env = StaticEnv::new([("KEY_VAR".to_string(), "k".to_string())]);
        let p = from_config(&cfg("openrouter"), &env).await.unwrap();
        assert_eq!(p.name(), "openrouter");
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let env = StaticEnv::default();
        assert!(from_config(&cfg("frobnicator"), &env).await.is_err());
    }

    #[tokio::test]
    async fn explicit_api_key_wins_over_env() {
        let mut c = cfg("anthropic");
        c.api_key = Some("explicit".into());
        let env = StaticEnv::new([("KEY_VAR".to_string(), "from-env".to_string())]);
        // Construction succeeds without consulting the env var.
        let p = from_config(&c, &env).await.unwrap();
        assert_eq!(p.model_name(), "some-model");
    }
}
