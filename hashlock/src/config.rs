// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{CoordinatorError, CoordinatorResult};
use hashlock_config::Config;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::{Path, PathBuf};

/// Network selector. Decides the timeout profile; no other behavior differs
/// between networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    pub fn timeout_profile(&self) -> TimeoutProfile {
        match self {
            Network::Mainnet => TimeoutProfile {
                source_deadline_ms: 3 * 60 * 60 * 1000,
                dest_deadline_ms: 30 * 60 * 1000,
                safety_margin_ms: 30 * 60 * 1000,
                min_timeout_ms: 10 * 60 * 1000,
            },
            Network::Testnet => TimeoutProfile {
                source_deadline_ms: 30 * 60 * 1000,
                dest_deadline_ms: 5 * 60 * 1000,
                safety_margin_ms: 5 * 60 * 1000,
                min_timeout_ms: 2 * 60 * 1000,
            },
            Network::Devnet => TimeoutProfile {
                source_deadline_ms: 10 * 60 * 1000,
                dest_deadline_ms: 2 * 60 * 1000,
                safety_margin_ms: 2 * 60 * 1000,
                min_timeout_ms: 60 * 1000,
            },
        }
    }
}

/// Timelock policy derived from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Lock duration expected on the initiator (source) side.
    pub source_deadline_ms: u64,
    /// Lock duration expected on the counterparty (destination) side.
    pub dest_deadline_ms: u64,
    /// Minimum required gap between the two sides' deadlines.
    pub safety_margin_ms: u64,
    /// Shortest lock duration the coordinator will pair against.
    pub min_timeout_ms: u64,
}

/// EVM-side (A-chain) connection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EvmLedgerConfig {
    pub rpc_url: String,
    /// Address of the escrow factory/registry contract.
    pub escrow_registry_address: String,
    /// Opaque reference handed to the key provider (file path for the
    /// default provider).
    pub key_ref: String,
    #[serde(default = "default_evm_finality_depth")]
    pub finality_depth: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
    #[serde(default)]
    pub resolver_stake: u128,
}

/// Object-side (B-chain) connection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiLedgerConfig {
    pub rpc_url: String,
    /// Object id of the registry carrying the digest -> escrow index.
    pub escrow_registry_object: String,
    /// Account whose node-held key signs submissions.
    pub key_ref: String,
    #[serde(default = "default_sui_finality_depth")]
    pub finality_depth: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
    #[serde(default)]
    pub resolver_stake: u128,
}

/// Engine retry policy for on-chain actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Process-wide coordinator configuration. Loaded once at start; there is no
/// hot reload.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub network: Network,
    /// Directory backing the embedded store.
    pub store_path: PathBuf,
    /// Port for the ops listener (health + metrics + read-only swap views).
    #[serde(default = "default_ops_port")]
    pub ops_port: u16,
    pub evm: EvmLedgerConfig,
    pub sui: SuiLedgerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long terminal swaps are retained before purge.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Smallest escrow amount the coordinator will pair against.
    #[serde(default = "default_min_swap_amount")]
    pub min_swap_amount: u128,
    /// Resolver fee in basis points, applied when quoting destination
    /// amounts.
    #[serde(default)]
    pub fee_bps: u16,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Config for NodeConfig {}

fn default_evm_finality_depth() -> u64 {
    64
}
fn default_sui_finality_depth() -> u64 {
    16
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_rate_limit_rps() -> u32 {
    20
}
fn default_max_attempts() -> u32 {
    8
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_ops_port() -> u16 {
    9185
}
fn default_retention_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}
fn default_min_swap_amount() -> u128 {
    1
}
fn default_channel_size() -> usize {
    1_024
}
fn default_worker_count() -> usize {
    8
}

impl NodeConfig {
    /// Validate everything that can be checked without touching the network.
    /// Callers map an error here to exit code 2.
    pub fn validate(&self) -> CoordinatorResult<()> {
        let invalid = |msg: String| Err(CoordinatorError::InvalidConfig(msg));

        if self.evm.rpc_url.is_empty() || self.sui.rpc_url.is_empty() {
            return invalid("rpc-url must be set for both ledgers".into());
        }
        if self.evm.escrow_registry_address.is_empty() {
            return invalid("evm.escrow-registry-address must be set".into());
        }
        if self.sui.escrow_registry_object.is_empty() {
            return invalid("sui.escrow-registry-object must be set".into());
        }
        if self.evm.key_ref.is_empty() || self.sui.key_ref.is_empty() {
            return invalid("key-ref must be set for both ledgers".into());
        }
        for (name, poll, rate) in [
            ("evm", self.evm.poll_interval_ms, self.evm.rate_limit_rps),
            ("sui", self.sui.poll_interval_ms, self.sui.rate_limit_rps),
        ] {
            if poll == 0 {
                return invalid(format!("{name}.poll-interval-ms must be positive"));
            }
            if rate == 0 {
                return invalid(format!("{name}.rate-limit-rps must be positive"));
            }
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max-attempts must be positive".into());
        }
        if self.retry.base_backoff_ms == 0 || self.retry.base_backoff_ms > self.retry.max_backoff_ms
        {
            return invalid(format!(
                "retry backoff range invalid: base {} max {}",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            ));
        }
        if self.fee_bps > 10_000 {
            return invalid(format!("fee-bps {} exceeds 10000", self.fee_bps));
        }
        let profile = self.network.timeout_profile();
        if profile.dest_deadline_ms < profile.min_timeout_ms {
            return invalid("timeout profile inconsistent".into());
        }
        if self.worker_count == 0 || self.channel_size == 0 {
            return invalid("worker-count and channel-size must be positive".into());
        }
        Ok(())
    }

    pub fn timeout_profile(&self) -> TimeoutProfile {
        self.network.timeout_profile()
    }
}

/// Write a commented starter config. Used by the operator CLI.
pub fn write_node_config_template(path: &Path) -> anyhow::Result<()> {
    let template = r#"# hashlock coordinator node config
network: devnet
store-path: /var/lib/hashlock/db
ops-port: 9185
evm:
  rpc-url: http://localhost:8545
  escrow-registry-address: "0x0000000000000000000000000000000000000000"
  # Path to a hex-encoded secp256k1 private key file
  key-ref: /etc/hashlock/evm.key
  finality-depth: 64
  poll-interval-ms: 2000
  rate-limit-rps: 20
  resolver-stake: 0
sui:
  rpc-url: http://localhost:9000
  escrow-registry-object: "0x0000000000000000000000000000000000000000000000000000000000000000"
  # Account whose node-held key signs submissions
  key-ref: "0x0000000000000000000000000000000000000000000000000000000000000000"
  finality-depth: 16
  poll-interval-ms: 2000
  rate-limit-rps: 20
  resolver-stake: 0
retry:
  max-attempts: 8
  base-backoff-ms: 500
  max-backoff-ms: 60000
retention-ms: 604800000
min-swap-amount: 1
fee-bps: 0
"#;
    std::fs::write(path, template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> NodeConfig {
        NodeConfig {
            network: Network::Devnet,
            store_path: PathBuf::from("/tmp/hashlock-test"),
            ops_port: default_ops_port(),
            evm: EvmLedgerConfig {
                rpc_url: "http://localhost:8545".into(),
                escrow_registry_address: "0x00000000000000000000000000000000000000aa".into(),
                key_ref: "/tmp/evm.key".into(),
                finality_depth: default_evm_finality_depth(),
                poll_interval_ms: default_poll_interval_ms(),
                rate_limit_rps: default_rate_limit_rps(),
                resolver_stake: 0,
            },
            sui: SuiLedgerConfig {
                rpc_url: "http://localhost:9000".into(),
                escrow_registry_object: "0xbb".into(),
                key_ref: "0xcc".into(),
                finality_depth: default_sui_finality_depth(),
                poll_interval_ms: default_poll_interval_ms(),
                rate_limit_rps: default_rate_limit_rps(),
                resolver_stake: 0,
            },
            retry: RetryConfig::default(),
            retention_ms: default_retention_ms(),
            min_swap_amount: 1,
            fee_bps: 25,
            channel_size: default_channel_size(),
            worker_count: default_worker_count(),
        }
    }

    #[test]
    fn test_timeout_profiles() {
        let mainnet = Network::Mainnet.timeout_profile();
        assert_eq!(mainnet.source_deadline_ms, 10_800_000);
        assert_eq!(mainnet.dest_deadline_ms, 1_800_000);
        assert_eq!(mainnet.safety_margin_ms, 1_800_000);
        assert_eq!(mainnet.min_timeout_ms, 600_000);

        let testnet = Network::Testnet.timeout_profile();
        assert_eq!(testnet.source_deadline_ms, 1_800_000);
        assert_eq!(testnet.dest_deadline_ms, 300_000);

        let devnet = Network::Devnet.timeout_profile();
        assert_eq!(devnet.safety_margin_ms, 120_000);
        assert_eq!(devnet.min_timeout_ms, 60_000);
    }

    #[test]
    fn test_validate_accepts_sample() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = sample_config();
        config.fee_bps = 10_001;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.evm.rpc_url.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.retry.base_backoff_ms = 120_000;
        config.retry.max_backoff_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.sui.rate_limit_rps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        write_node_config_template(&path).unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Devnet);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
network: testnet
store-path: /tmp/db
evm:
  rpc-url: http://localhost:8545
  escrow-registry-address: "0xaa"
  key-ref: /tmp/k
sui:
  rpc-url: http://localhost:9000
  escrow-registry-object: "0xbb"
  key-ref: "0xcc"
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ops_port, 9185);
        assert_eq!(config.evm.finality_depth, 64);
        assert_eq!(config.sui.finality_depth, 16);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retention_ms, 604_800_000);
    }
}
