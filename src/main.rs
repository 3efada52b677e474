// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use freja_config::OsEnv;

/// Exit code for an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the client protocol, so logging always goes to stderr.
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            let Some(path) = cli.config.as_deref() else {
                eprintln!("show-config requires --config");
                return ExitCode::from(1);
            };
            match freja_config::load_config(path) {
                Ok(config) => {
                    println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("invalid config: {e:#}");
                    ExitCode::from(1)
                }
            }
        }
        Some(Commands::Acp) | None => run_acp(cli.config.as_deref()).await,
    }
}

async fn run_acp(config_path: Option<&Path>) -> ExitCode {
    let config = match config_path {
        Some(path) => match freja_config::load_config(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config: {e:#}");
                return ExitCode::from(1);
            }
        },
        None => {
            eprintln!("the acp server requires --config <team.yaml>");
            return ExitCode::from(1);
        }
    };

    tokio::select! {
        result = freja_acp::serve(config, Arc::new(OsEnv)) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("server error: {e:#}");
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => ExitCode::from(EXIT_INTERRUPTED),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("FREJA_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
