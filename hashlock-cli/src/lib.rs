// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator command-line surface for the coordinator daemon.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hashlock::adapter::evm::EvmAdapter;
use hashlock::adapter::sui::SuiAdapter;
use hashlock::adapter::{ChainAdapter, CreateEscrowParams};
use hashlock::config::NodeConfig;
use hashlock::crypto::{digest, HashAlgorithm, Secret, SecretDigest};
use hashlock::node::HealthReport;
use hashlock::server::SwapView;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_OPS_URL: &str = "http://127.0.0.1:9185";

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
pub enum Command {
    /// Write a commented starter node config.
    CreateNodeConfigTemplate {
        #[clap(long)]
        path: PathBuf,
    },
    /// Generate a fresh swap secret and print its digests under both
    /// algorithms.
    CreateSecret,
    /// Probe a running coordinator. Exits non-zero when unhealthy.
    Health {
        #[clap(long, default_value = DEFAULT_OPS_URL)]
        ops_url: String,
    },
    /// List non-terminal swaps known to a running coordinator.
    ListActiveSwaps {
        #[clap(long, default_value = DEFAULT_OPS_URL)]
        ops_url: String,
        /// Print the raw JSON instead of the summary lines.
        #[clap(long)]
        json: bool,
    },
    /// Show one swap in full.
    GetSwap {
        #[clap(long, default_value = DEFAULT_OPS_URL)]
        ops_url: String,
        swap_id: String,
    },
    /// Refund every still-locked side of a swap whose deadline has
    /// passed, bypassing auto-policy.
    ForceRefund {
        #[clap(long, default_value = DEFAULT_OPS_URL)]
        ops_url: String,
        swap_id: String,
    },
    /// Lock funds behind a hash lock on one ledger (manual swap setup).
    CreateEscrow {
        #[clap(long)]
        config_path: PathBuf,
        #[clap(long, value_enum)]
        ledger: LedgerArg,
        /// Hex digest the escrow commits to.
        #[clap(long)]
        digest: String,
        #[clap(long, value_enum, default_value = "sha256")]
        algorithm: AlgorithmArg,
        #[clap(long)]
        beneficiary: String,
        #[clap(long)]
        token: String,
        /// Amount in the ledger's smallest unit.
        #[clap(long)]
        amount: u128,
        #[clap(long)]
        lock_duration_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LedgerArg {
    Evm,
    Sui,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AlgorithmArg {
    Keccak256,
    Sha256,
}

impl From<AlgorithmArg> for HashAlgorithm {
    fn from(value: AlgorithmArg) -> Self {
        match value {
            AlgorithmArg::Keccak256 => HashAlgorithm::Keccak256,
            AlgorithmArg::Sha256 => HashAlgorithm::Sha256,
        }
    }
}

/// Build the requested ledger adapter from the node config and create the
/// escrow. Prints the new escrow id and transaction reference.
pub async fn create_escrow(
    config: &NodeConfig,
    ledger: LedgerArg,
    digest_hex: &str,
    algorithm: AlgorithmArg,
    beneficiary: String,
    token: String,
    amount: u128,
    lock_duration_ms: u64,
) -> Result<String> {
    let digest =
        SecretDigest::from_hex(digest_hex).map_err(|e| anyhow!("invalid digest: {e}"))?;
    let params = CreateEscrowParams {
        token,
        amount,
        digest,
        algorithm: algorithm.into(),
        beneficiary,
        lock_duration_ms,
    };
    let adapter: Arc<dyn ChainAdapter> = match ledger {
        LedgerArg::Evm => Arc::new(EvmAdapter::connect(&config.evm).await?),
        LedgerArg::Sui => Arc::new(SuiAdapter::new(&config.sui)),
    };
    let (escrow_id, tx_ref) = adapter.create_escrow(params).await?;
    Ok(format!("escrow-id: {escrow_id}\ntx-ref:    {tx_ref}\n"))
}

pub struct OpsClient {
    base_url: String,
    http: reqwest::Client,
}

impl OpsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.base_url))?;
        Ok(response.json().await?)
    }

    pub async fn list_active_swaps(&self) -> Result<Vec<SwapView>> {
        let response = self
            .http
            .get(format!("{}/swaps", self.base_url))
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.base_url))?;
        if !response.status().is_success() {
            return Err(anyhow!("coordinator returned {}", response.status()));
        }
        Ok(response.json().await?)
    }

    pub async fn get_swap(&self, swap_id: &str) -> Result<SwapView> {
        let response = self
            .http
            .get(format!("{}/swaps/{}", self.base_url, swap_id))
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.base_url))?;
        if response.status().as_u16() == 404 {
            return Err(anyhow!("swap {} not found", swap_id));
        }
        if !response.status().is_success() {
            return Err(anyhow!("coordinator returned {}", response.status()));
        }
        Ok(response.json().await?)
    }

    pub async fn force_refund(&self, swap_id: &str) -> Result<SwapView> {
        let response = self
            .http
            .post(format!("{}/swaps/{}/force-refund", self.base_url, swap_id))
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.base_url))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(anyhow!("swap {} not found", swap_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("force-refund rejected ({status}): {body}"));
        }
        Ok(response.json().await?)
    }
}

pub fn render_secret() -> String {
    let secret = Secret::random();
    let keccak = digest(&secret, HashAlgorithm::Keccak256);
    let sha = digest(&secret, HashAlgorithm::Sha256);
    format!(
        "secret:            {}\ndigest-keccak256:  {}\ndigest-sha256:     {}\n",
        secret.to_hex(),
        keccak.to_hex(),
        sha.to_hex()
    )
}

pub fn render_swap_line(view: &SwapView) -> String {
    let sides: Vec<String> = view
        .sides
        .iter()
        .map(|s| {
            let state = if s.withdrawn {
                "withdrawn"
            } else if s.refunded {
                "refunded"
            } else {
                "locked"
            };
            format!("{}:{} ({})", s.ledger, s.escrow_id, state)
        })
        .collect();
    format!(
        "{}  {:<16} digest={}  {}",
        view.id,
        view.phase,
        &view.digest[..16],
        sides.join("  ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashlock::server::SideView;

    #[test]
    fn test_render_secret_exposes_full_material() {
        // Unlike daemon logs, this command is the operator's only way to
        // obtain the preimage; it must print all 64 hex chars.
        let out = render_secret();
        for line in out.lines() {
            let value = line.split_whitespace().last().unwrap();
            assert_eq!(value.len(), 64);
        }
    }

    #[test]
    fn test_render_swap_line() {
        let view = SwapView {
            id: "abc123".into(),
            phase: "both_locked".into(),
            digest: "d".repeat(64),
            algorithm: "sha256".into(),
            hold: None,
            created_ms: 1,
            updated_ms: 2,
            last_error: None,
            retry_count: 0,
            sides: vec![SideView {
                ledger: "EVM".into(),
                escrow_id: "0xe".into(),
                owner: "o".into(),
                beneficiary: "b".into(),
                token: "t".into(),
                amount: "10".into(),
                deadline_ms: 5,
                withdrawn: false,
                refunded: true,
                revealed_secret: None,
            }],
        };
        let line = render_swap_line(&view);
        assert!(line.contains("both_locked"));
        assert!(line.contains("refunded"));
        assert!(line.contains("abc123"));
    }
}
