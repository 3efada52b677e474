// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-agent conversational runtime.
#[derive(Parser, Debug)]
#[command(name = "freja", version, about)]
pub struct Cli {
    /// Path to the team configuration file.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (FREJA_LOG overrides the filter).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the agent over the client protocol on stdin/stdout.
    ///
    /// The client drives sessions with `session/new` and `session/prompt`;
    /// agent output streams back as `session/update` notifications and tool
    /// consent is negotiated through `session/request_permission`.
    Acp,

    /// Parse and validate the team configuration, then print it.
    ShowConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn acp_subcommand_parses() {
        let cli = Cli::parse_from(["freja", "--config", "team.yaml", "acp"]);
        assert!(matches!(cli.command, Some(Commands::Acp)));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("team.yaml")));
    }

    #[test]
    fn verbose_flag_is_global() {
        let cli = Cli::parse_from(["freja", "acp", "-v"]);
        assert!(cli.verbose);
    }
}
