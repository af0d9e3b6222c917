// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Parser;
use hashlock::config::{write_node_config_template, NodeConfig};
use hashlock_config::Config;
use hashlock_cli::{create_escrow, render_secret, render_swap_line, Args, Command, OpsClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();
    let args = Args::parse();

    match args.command {
        Command::CreateNodeConfigTemplate { path } => {
            write_node_config_template(&path)?;
            println!("node config template written to {}", path.display());
        }
        Command::CreateSecret => {
            print!("{}", render_secret());
        }
        Command::Health { ops_url } => {
            let report = OpsClient::new(&ops_url).health().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                std::process::exit(1);
            }
        }
        Command::ListActiveSwaps { ops_url, json } => {
            let swaps = OpsClient::new(&ops_url).list_active_swaps().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&swaps)?);
            } else if swaps.is_empty() {
                println!("no active swaps");
            } else {
                for view in &swaps {
                    println!("{}", render_swap_line(view));
                }
            }
        }
        Command::GetSwap { ops_url, swap_id } => {
            let view = OpsClient::new(&ops_url).get_swap(&swap_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::ForceRefund { ops_url, swap_id } => {
            let view = OpsClient::new(&ops_url).force_refund(&swap_id).await?;
            println!("force-refund submitted");
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::CreateEscrow {
            config_path,
            ledger,
            digest,
            algorithm,
            beneficiary,
            token,
            amount,
            lock_duration_ms,
        } => {
            let config = NodeConfig::load(&config_path)?;
            let out = create_escrow(
                &config,
                ledger,
                &digest,
                algorithm,
                beneficiary,
                token,
                amount,
                lock_duration_ms,
            )
            .await?;
            print!("{out}");
        }
    }
    Ok(())
}
