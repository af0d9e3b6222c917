// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EVM-side ledger adapter. Talks to the escrow registry contract over an
//! ethers HTTP provider; submissions are signed with a local wallet loaded
//! from the configured key reference.

use crate::adapter::{
    AdapterError, AdapterResult, ChainAdapter, CreateEscrowParams, EscrowSnapshot, EventBatch,
};
use crate::config::EvmLedgerConfig;
use crate::crypto::{decode_hex_fixed, HashAlgorithm, Secret, SecretDigest};
use crate::types::{
    EscrowCreated, EscrowEvent, EscrowId, EscrowRefunded, EscrowWithdrawn, EventCursor,
    EventPosition, LedgerId, TxRef,
};
use async_trait::async_trait;
use ethers::contract::{abigen, ContractError, LogMeta};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address as EthAddress, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

abigen!(
    EscrowRegistry,
    r#"[
        function create(bytes32 digest, uint8 algorithm, address beneficiary, address token, uint256 amount, uint64 lockDurationMs) returns (bytes32)
        function withdraw(bytes32 escrowId, bytes32 secret)
        function refund(bytes32 escrowId)
        function getEscrow(bytes32 escrowId) view returns (address, address, address, uint256, bytes32, uint8, uint64, uint64, bool, bool, bytes32)
        function findByDigest(bytes32 digest) view returns (bytes32[])
        function isResolver(address account) view returns (bool)
        function registerResolver(uint256 stake)
        event Created(bytes32 indexed escrowId, address indexed owner, address beneficiary, address token, uint256 amount, bytes32 digest, uint8 algorithm, uint64 startMs, uint64 lockDurationMs)
        event Withdrawn(bytes32 indexed escrowId, address indexed caller, bytes32 digest, bytes32 secret)
        event Refunded(bytes32 indexed escrowId, address indexed owner, bytes32 digest)
    ]"#
);

type EvmClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Largest block span requested in a single `getLogs`.
const MAX_BLOCK_RANGE: u64 = 1_000;
/// Confirmations awaited on submits before reporting success.
const SUBMIT_CONFIRMATIONS: usize = 2;

pub struct EvmAdapter {
    contract: EscrowRegistry<EvmClient>,
    client: Arc<EvmClient>,
    signer_address: EthAddress,
    finality_depth: u64,
}

impl EvmAdapter {
    pub async fn connect(config: &EvmLedgerConfig) -> AdapterResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| AdapterError::Unavailable(format!("bad rpc url: {e}")))?
            .interval(Duration::from_millis(config.poll_interval_ms.min(2_000)));

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("chain id query failed: {e}")))?;

        let wallet = load_wallet(&config.key_ref)?.with_chain_id(chain_id.as_u64());
        let signer_address = wallet.address();
        let client = Arc::new(SignerMiddleware::new(provider, wallet));

        let registry_address: EthAddress = config
            .escrow_registry_address
            .parse()
            .map_err(|e| AdapterError::Rejected(format!("bad registry address: {e}")))?;
        let contract = EscrowRegistry::new(registry_address, client.clone());

        info!(
            "[EVM] connected to chain {} as {:?}, registry {:?}",
            chain_id, signer_address, registry_address
        );

        Ok(Self {
            contract,
            client,
            signer_address,
            finality_depth: config.finality_depth,
        })
    }

    async fn send_and_wait(
        &self,
        call: ethers::contract::builders::ContractCall<EvmClient, ()>,
    ) -> AdapterResult<TxRef> {
        let pending = call.send().await.map_err(map_contract_error)?;
        let tx_hash = *pending;
        let receipt = pending
            .confirmations(SUBMIT_CONFIRMATIONS)
            .await
            .map_err(|e| AdapterError::Timeout(format!("awaiting receipt: {e}")))?
            .ok_or_else(|| AdapterError::Timeout(format!("tx {tx_hash:?} dropped")))?;
        if receipt.status != Some(1.into()) {
            return Err(AdapterError::Rejected(format!(
                "tx {tx_hash:?} reverted on-chain"
            )));
        }
        Ok(TxRef(format!("{tx_hash:#x}")))
    }

    async fn snapshot(&self, escrow_id: &EscrowId) -> AdapterResult<EscrowSnapshot> {
        let id = parse_escrow_id(escrow_id)?;
        let (
            owner,
            beneficiary,
            token,
            amount,
            digest,
            algorithm,
            start_ms,
            lock_duration_ms,
            withdrawn,
            refunded,
            secret,
        ) = self
            .contract
            .get_escrow(id)
            .call()
            .await
            .map_err(map_contract_error)?;

        if owner == EthAddress::zero() {
            return Err(AdapterError::NotFound(escrow_id.0.clone()));
        }

        Ok(EscrowSnapshot {
            escrow_id: escrow_id.clone(),
            owner: format!("{owner:#x}"),
            beneficiary: format!("{beneficiary:#x}"),
            token: format!("{token:#x}"),
            amount: u256_to_u128(amount)?,
            digest: SecretDigest(digest),
            algorithm: HashAlgorithm::from_flag(algorithm)
                .map_err(|e| AdapterError::Rejected(e.to_string()))?,
            start_ms,
            lock_duration_ms,
            withdrawn,
            refunded,
            revealed_secret: (withdrawn && secret != [0u8; 32]).then_some(Secret(secret)),
        })
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn ledger(&self) -> LedgerId {
        LedgerId::Evm
    }

    fn signer_address(&self) -> String {
        format!("{:#x}", self.signer_address)
    }

    async fn create_escrow(
        &self,
        params: CreateEscrowParams,
    ) -> AdapterResult<(EscrowId, TxRef)> {
        let beneficiary: EthAddress = params
            .beneficiary
            .parse()
            .map_err(|e| AdapterError::Rejected(format!("bad beneficiary: {e}")))?;
        let token: EthAddress = params
            .token
            .parse()
            .map_err(|e| AdapterError::Rejected(format!("bad token: {e}")))?;

        let call = self.contract.create(
            params.digest.0,
            params.algorithm.flag(),
            beneficiary,
            token,
            U256::from(params.amount),
            params.lock_duration_ms,
        );
        // `create` returns the escrow id, but return data is not available
        // from a receipt; recover it from the Created log instead.
        let pending = call.send().await.map_err(map_contract_error)?;
        let tx_hash = *pending;
        let receipt = pending
            .confirmations(SUBMIT_CONFIRMATIONS)
            .await
            .map_err(|e| AdapterError::Timeout(format!("awaiting receipt: {e}")))?
            .ok_or_else(|| AdapterError::Timeout(format!("tx {tx_hash:?} dropped")))?;

        for log in &receipt.logs {
            if let Ok(created) = ethers::contract::parse_log::<CreatedFilter>(log.clone()) {
                return Ok((
                    EscrowId(format!("0x{}", hex::encode(created.escrow_id))),
                    TxRef(format!("{tx_hash:#x}")),
                ));
            }
        }
        Err(AdapterError::Rejected(format!(
            "tx {tx_hash:?} emitted no Created event"
        )))
    }

    async fn withdraw(&self, escrow_id: &EscrowId, secret: &Secret) -> AdapterResult<TxRef> {
        // Dedup against on-chain state so replays and racing instances are
        // reported as AlreadyProcessed rather than a revert.
        let snapshot = self.snapshot(escrow_id).await?;
        if snapshot.withdrawn {
            return Err(AdapterError::AlreadyProcessed);
        }
        if snapshot.refunded {
            return Err(AdapterError::Expired);
        }
        let id = parse_escrow_id(escrow_id)?;
        self.send_and_wait(self.contract.withdraw(id, secret.0))
            .await
    }

    async fn refund(&self, escrow_id: &EscrowId) -> AdapterResult<TxRef> {
        let snapshot = self.snapshot(escrow_id).await?;
        if snapshot.refunded {
            return Err(AdapterError::AlreadyProcessed);
        }
        if snapshot.withdrawn {
            return Err(AdapterError::Rejected(
                "escrow already withdrawn; refund impossible".into(),
            ));
        }
        let id = parse_escrow_id(escrow_id)?;
        self.send_and_wait(self.contract.refund(id)).await
    }

    async fn get_escrow(&self, escrow_id: &EscrowId) -> AdapterResult<EscrowSnapshot> {
        self.snapshot(escrow_id).await
    }

    async fn find_escrows_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> AdapterResult<Vec<EscrowId>> {
        let ids = self
            .contract
            .find_by_digest(digest.0)
            .call()
            .await
            .map_err(map_contract_error)?;
        Ok(ids
            .into_iter()
            .map(|id| EscrowId(format!("0x{}", hex::encode(id))))
            .collect())
    }

    async fn poll_events(&self, cursor: EventCursor, limit: usize) -> AdapterResult<EventBatch> {
        let latest = self.latest_height().await?;
        let finalized = latest.saturating_sub(self.finality_depth);
        if cursor.height > finalized {
            return Ok(EventBatch {
                events: Vec::new(),
                next_cursor: cursor,
                finalized_height: finalized,
            });
        }

        let from_block = cursor.height;
        let to_block = finalized.min(from_block + MAX_BLOCK_RANGE - 1);

        let created = self
            .contract
            .event::<CreatedFilter>()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(|e| AdapterError::Rpc(format!("created query: {e}")))?;
        let withdrawn = self
            .contract
            .event::<WithdrawnFilter>()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(|e| AdapterError::Rpc(format!("withdrawn query: {e}")))?;
        let refunded = self
            .contract
            .event::<RefundedFilter>()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(|e| AdapterError::Rpc(format!("refunded query: {e}")))?;

        let mut events: Vec<EscrowEvent> = Vec::new();
        for (event, meta) in created {
            match convert_created(event, &meta) {
                Ok(e) => events.push(EscrowEvent::Created(e)),
                Err(e) => warn!("[EVM] skipping malformed Created log: {e}"),
            }
        }
        for (event, meta) in withdrawn {
            events.push(EscrowEvent::Withdrawn(EscrowWithdrawn {
                ledger: LedgerId::Evm,
                escrow_id: EscrowId(format!("0x{}", hex::encode(event.escrow_id))),
                digest: SecretDigest(event.digest),
                caller: format!("{:#x}", event.caller),
                secret: Secret(event.secret),
                position: position_of(&meta),
            }));
        }
        for (event, meta) in refunded {
            events.push(EscrowEvent::Refunded(EscrowRefunded {
                ledger: LedgerId::Evm,
                escrow_id: EscrowId(format!("0x{}", hex::encode(event.escrow_id))),
                digest: SecretDigest(event.digest),
                owner: format!("{:#x}", event.owner),
                position: position_of(&meta),
            }));
        }

        events.sort_by_key(|e| {
            let p = e.position();
            (p.block_height, p.event_index)
        });
        events.retain(|e| {
            let p = e.position();
            p.block_height > cursor.height
                || (p.block_height == cursor.height && p.event_index >= cursor.index)
        });
        events.truncate(limit);

        let next_cursor = match events.last() {
            Some(last) => EventCursor::after(last.position()),
            None => EventCursor::new(to_block + 1, 0),
        };

        Ok(EventBatch {
            events,
            next_cursor,
            finalized_height: finalized,
        })
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        let number = self
            .client
            .get_block_number()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("block number: {e}")))?;
        Ok(number.as_u64())
    }

    async fn ping(&self) -> AdapterResult<()> {
        self.latest_height().await.map(|_| ())
    }

    async fn register_resolver(&self, stake: u128) -> AdapterResult<Option<TxRef>> {
        let registered = self
            .contract
            .is_resolver(self.signer_address)
            .call()
            .await
            .map_err(map_contract_error)?;
        if registered {
            return Ok(None);
        }
        let tx_ref = self
            .send_and_wait(self.contract.register_resolver(U256::from(stake)))
            .await?;
        Ok(Some(tx_ref))
    }
}

fn load_wallet(key_ref: &str) -> AdapterResult<LocalWallet> {
    // The default key provider treats the reference as a path to a
    // hex-encoded secp256k1 key file.
    let raw = std::fs::read_to_string(key_ref)
        .map_err(|e| AdapterError::Rejected(format!("cannot read key {key_ref}: {e}")))?;
    raw.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| AdapterError::Rejected(format!("invalid key material: {e}")))
}

fn parse_escrow_id(escrow_id: &EscrowId) -> AdapterResult<[u8; 32]> {
    decode_hex_fixed::<32>(&escrow_id.0)
        .map_err(|e| AdapterError::Rejected(format!("bad escrow id {escrow_id}: {e}")))
}

fn position_of(meta: &LogMeta) -> EventPosition {
    EventPosition {
        tx_ref: TxRef(format!("{:#x}", meta.transaction_hash)),
        block_height: meta.block_number.as_u64(),
        event_index: meta.log_index.as_u64() as u32,
    }
}

fn convert_created(event: CreatedFilter, meta: &LogMeta) -> AdapterResult<EscrowCreated> {
    Ok(EscrowCreated {
        ledger: LedgerId::Evm,
        escrow_id: EscrowId(format!("0x{}", hex::encode(event.escrow_id))),
        digest: SecretDigest(event.digest),
        algorithm: HashAlgorithm::from_flag(event.algorithm)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?,
        owner: format!("{:#x}", event.owner),
        beneficiary: format!("{:#x}", event.beneficiary),
        token: format!("{:#x}", event.token),
        amount: u256_to_u128(event.amount)?,
        start_ms: event.start_ms,
        lock_duration_ms: event.lock_duration_ms,
        position: position_of(meta),
    })
}

fn u256_to_u128(value: U256) -> AdapterResult<u128> {
    if value > U256::from(u128::MAX) {
        return Err(AdapterError::Rejected(format!(
            "amount {value} exceeds 128 bits"
        )));
    }
    Ok(value.as_u128())
}

/// Map a contract error onto the typed adapter surface. Revert reasons are
/// part of the escrow contract's interface.
fn map_contract_error(error: ContractError<EvmClient>) -> AdapterError {
    if let Some(reason) = error.decode_revert::<String>() {
        return map_revert_reason(&reason);
    }
    match &error {
        ContractError::MiddlewareError { e } => AdapterError::Rpc(e.to_string()),
        ContractError::ProviderError { e } => AdapterError::Unavailable(e.to_string()),
        _ => AdapterError::Rpc(error.to_string()),
    }
}

fn map_revert_reason(reason: &str) -> AdapterError {
    let upper = reason.to_ascii_uppercase();
    if upper.contains("ALREADY") {
        AdapterError::AlreadyProcessed
    } else if upper.contains("INVALID_SECRET") || upper.contains("BAD_SECRET") {
        AdapterError::InvalidSecret
    } else if upper.contains("NOT_EXPIRED") {
        AdapterError::NotExpired { deadline_ms: 0 }
    } else if upper.contains("EXPIRED") {
        AdapterError::Expired
    } else if upper.contains("UNAUTHORIZED") || upper.contains("NOT_OWNER") {
        AdapterError::Unauthorized
    } else if upper.contains("INSUFFICIENT") {
        AdapterError::InsufficientFunds
    } else {
        AdapterError::Rejected(reason.to_string())
    }
}
