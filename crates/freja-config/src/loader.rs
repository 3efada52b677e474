// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Load and validate a team configuration file.
///
/// Relative and `~`-prefixed paths are expanded before reading so configs
/// referenced from shell history and CI variables behave the same.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    debug!(path = %expanded, "loading team config");
    let text = std::fs::read_to_string(&expanded)
        .with_context(|| format!("reading {expanded}"))?;
    load_config_str(&text).with_context(|| format!("parsing {expanded}"))
}

/// Parse a team configuration from YAML text and validate cross-references.
pub fn load_config_str(text: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(text).context("invalid config YAML")?;
    config.validate()?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
