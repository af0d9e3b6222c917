// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use hashlock::config::NodeConfig;
use hashlock::error::CoordinatorError;
use hashlock::node::run_node;
use hashlock_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 clean, 1 unrecoverable init failure, 2 invalid
/// configuration, 130 signal-initiated shutdown.
const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_SIGNALLED: u8 = 130;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"), version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match NodeConfig::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", args.config_path.display());
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    let registry = prometheus::Registry::new();
    let handle = match run_node(config, registry).await {
        Ok(handle) => handle,
        Err(e @ CoordinatorError::InvalidConfig(_)) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
        Err(e) => {
            error!("coordinator failed to start: {e}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    match wait_for_shutdown_signal().await {
        Ok(signal) => {
            info!("received {signal}, shutting down");
            handle.stop().await;
            ExitCode::from(EXIT_SIGNALLED)
        }
        Err(e) => {
            error!("signal listener failed: {e}");
            handle.stop().await;
            ExitCode::from(EXIT_INIT_FAILURE)
        }
    }
}

async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}
