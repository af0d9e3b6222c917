// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Object-side ledger adapter. The escrow package exposes a shared escrow
//! object per lock, an owner capability gating refunds and a registry
//! object carrying the digest -> escrow index. Submissions are signed by
//! the node-held key of the configured account, so no key material passes
//! through this process.

use crate::adapter::{
    AdapterError, AdapterResult, ChainAdapter, CreateEscrowParams, EscrowSnapshot, EventBatch,
};
use crate::config::SuiLedgerConfig;
use crate::crypto::{HashAlgorithm, Secret, SecretDigest};
use crate::types::{
    EscrowCreated, EscrowEvent, EscrowId, EscrowRefunded, EscrowWithdrawn, EventCursor,
    EventPosition, LedgerId, TxRef,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

// Error codes the escrow package's RPC surface commits to.
const RPC_ERR_NOT_FOUND: i64 = -32001;
const RPC_ERR_ALREADY_PROCESSED: i64 = -32002;
const RPC_ERR_INVALID_SECRET: i64 = -32003;
const RPC_ERR_NOT_EXPIRED: i64 = -32004;
const RPC_ERR_EXPIRED: i64 = -32005;
const RPC_ERR_UNAUTHORIZED: i64 = -32006;
const RPC_ERR_INSUFFICIENT_FUNDS: i64 = -32007;
const RPC_ERR_CURSOR_GAP: i64 = -32050;

#[derive(Debug, Deserialize)]
struct RpcEscrowObject {
    escrow_id: String,
    owner: String,
    beneficiary: String,
    token: String,
    #[serde(deserialize_with = "de_u128_from_string")]
    amount: u128,
    digest: String,
    algorithm: u8,
    start_ms: u64,
    lock_duration_ms: u64,
    withdrawn: bool,
    refunded: bool,
    #[serde(default)]
    revealed_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEventPage {
    events: Vec<RpcEscrowEvent>,
    finalized_height: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RpcEscrowEvent {
    Created {
        escrow_id: String,
        digest: String,
        algorithm: u8,
        owner: String,
        beneficiary: String,
        token: String,
        #[serde(deserialize_with = "de_u128_from_string")]
        amount: u128,
        start_ms: u64,
        lock_duration_ms: u64,
        tx_ref: String,
        height: u64,
        event_index: u32,
    },
    Withdrawn {
        escrow_id: String,
        digest: String,
        caller: String,
        secret: String,
        tx_ref: String,
        height: u64,
        event_index: u32,
    },
    Refunded {
        escrow_id: String,
        digest: String,
        owner: String,
        tx_ref: String,
        height: u64,
        event_index: u32,
    },
}

#[derive(Debug, Deserialize)]
struct RpcSubmitResult {
    tx_ref: String,
    #[serde(default)]
    escrow_id: Option<String>,
}

/// Amounts cross the RPC boundary as decimal strings to avoid JSON number
/// precision loss.
fn de_u128_from_string<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::String(s) => s.parse::<u128>().map_err(D::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .map(|n| n as u128)
            .ok_or_else(|| D::Error::custom("amount is not an unsigned integer")),
        other => Err(D::Error::custom(format!("bad amount value: {other}"))),
    }
}

pub struct SuiAdapter {
    http_client: reqwest::Client,
    rpc_url: String,
    registry_object: String,
    signer_account: String,
    finality_depth: u64,
    request_id: Arc<AtomicU64>,
}

impl SuiAdapter {
    pub fn new(config: &SuiLedgerConfig) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(64)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("Failed to build reqwest client")
                })
                .clone()
        }

        info!(
            "[SUI] escrow client for {} (registry {})",
            config.rpc_url, config.escrow_registry_object
        );

        Self {
            http_client: shared_http_client(),
            rpc_url: config.rpc_url.clone(),
            registry_object: config.escrow_registry_object.clone(),
            signer_account: config.key_ref.clone(),
            finality_depth: config.finality_depth,
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> AdapterResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AdapterError::Unavailable(format!("{method}: {e}"))
                } else {
                    AdapterError::Rpc(format!("{method}: {e}"))
                }
            })?;

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Rpc(format!("{method}: bad response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(map_rpc_error(method, error));
        }
        parsed
            .result
            .ok_or_else(|| AdapterError::Rpc(format!("{method}: empty result")))
    }

    fn parse_event(&self, event: RpcEscrowEvent) -> AdapterResult<EscrowEvent> {
        let bad = |what: &str, e: crate::error::CoordinatorError| {
            AdapterError::Rpc(format!("malformed {what} in event: {e}"))
        };
        Ok(match event {
            RpcEscrowEvent::Created {
                escrow_id,
                digest,
                algorithm,
                owner,
                beneficiary,
                token,
                amount,
                start_ms,
                lock_duration_ms,
                tx_ref,
                height,
                event_index,
            } => EscrowEvent::Created(EscrowCreated {
                ledger: LedgerId::Sui,
                escrow_id: EscrowId(escrow_id),
                digest: SecretDigest::from_hex(&digest).map_err(|e| bad("digest", e))?,
                algorithm: HashAlgorithm::from_flag(algorithm)
                    .map_err(|e| bad("algorithm", e))?,
                owner,
                beneficiary,
                token,
                amount,
                start_ms,
                lock_duration_ms,
                position: EventPosition {
                    tx_ref: TxRef(tx_ref),
                    block_height: height,
                    event_index,
                },
            }),
            RpcEscrowEvent::Withdrawn {
                escrow_id,
                digest,
                caller,
                secret,
                tx_ref,
                height,
                event_index,
            } => EscrowEvent::Withdrawn(EscrowWithdrawn {
                ledger: LedgerId::Sui,
                escrow_id: EscrowId(escrow_id),
                digest: SecretDigest::from_hex(&digest).map_err(|e| bad("digest", e))?,
                caller,
                secret: Secret::from_hex(&secret).map_err(|e| bad("secret", e))?,
                position: EventPosition {
                    tx_ref: TxRef(tx_ref),
                    block_height: height,
                    event_index,
                },
            }),
            RpcEscrowEvent::Refunded {
                escrow_id,
                digest,
                owner,
                tx_ref,
                height,
                event_index,
            } => EscrowEvent::Refunded(EscrowRefunded {
                ledger: LedgerId::Sui,
                escrow_id: EscrowId(escrow_id),
                digest: SecretDigest::from_hex(&digest).map_err(|e| bad("digest", e))?,
                owner,
                position: EventPosition {
                    tx_ref: TxRef(tx_ref),
                    block_height: height,
                    event_index,
                },
            }),
        })
    }
}

#[async_trait]
impl ChainAdapter for SuiAdapter {
    fn ledger(&self) -> LedgerId {
        LedgerId::Sui
    }

    fn signer_address(&self) -> String {
        self.signer_account.clone()
    }

    async fn create_escrow(
        &self,
        params: CreateEscrowParams,
    ) -> AdapterResult<(EscrowId, TxRef)> {
        let result = self
            .call(
                "escrow.create",
                vec![
                    json!(self.registry_object),
                    json!({
                        "token": params.token,
                        "amount": params.amount.to_string(),
                        "digest": params.digest.to_hex(),
                        "algorithm": params.algorithm.flag(),
                        "beneficiary": params.beneficiary,
                        "lock_duration_ms": params.lock_duration_ms,
                    }),
                    json!(self.signer_account),
                ],
            )
            .await?;
        let submit: RpcSubmitResult = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("escrow.create: {e}")))?;
        let escrow_id = submit
            .escrow_id
            .ok_or_else(|| AdapterError::Rpc("escrow.create returned no object id".into()))?;
        Ok((EscrowId(escrow_id), TxRef(submit.tx_ref)))
    }

    async fn withdraw(&self, escrow_id: &EscrowId, secret: &Secret) -> AdapterResult<TxRef> {
        // A vanished object after terminality would surface as NotFound;
        // callers treat that the same as AlreadyProcessed where relevant.
        let snapshot = self.get_escrow(escrow_id).await?;
        if snapshot.withdrawn {
            return Err(AdapterError::AlreadyProcessed);
        }
        if snapshot.refunded {
            return Err(AdapterError::Expired);
        }
        let result = self
            .call(
                "escrow.withdraw",
                vec![
                    json!(escrow_id.0),
                    json!(secret.to_hex()),
                    json!(self.signer_account),
                ],
            )
            .await?;
        let submit: RpcSubmitResult = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("escrow.withdraw: {e}")))?;
        Ok(TxRef(submit.tx_ref))
    }

    async fn refund(&self, escrow_id: &EscrowId) -> AdapterResult<TxRef> {
        let snapshot = self.get_escrow(escrow_id).await?;
        if snapshot.refunded {
            return Err(AdapterError::AlreadyProcessed);
        }
        if snapshot.withdrawn {
            return Err(AdapterError::Rejected(
                "escrow already withdrawn; refund impossible".into(),
            ));
        }
        let result = self
            .call(
                "escrow.refund",
                vec![json!(escrow_id.0), json!(self.signer_account)],
            )
            .await?;
        let submit: RpcSubmitResult = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("escrow.refund: {e}")))?;
        Ok(TxRef(submit.tx_ref))
    }

    async fn get_escrow(&self, escrow_id: &EscrowId) -> AdapterResult<EscrowSnapshot> {
        let result = self.call("escrow.get", vec![json!(escrow_id.0)]).await?;
        if result.is_null() {
            return Err(AdapterError::NotFound(escrow_id.0.clone()));
        }
        let object: RpcEscrowObject = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("escrow.get: {e}")))?;
        let revealed_secret = match object.revealed_secret {
            Some(s) => Some(
                Secret::from_hex(&s)
                    .map_err(|e| AdapterError::Rpc(format!("escrow.get secret: {e}")))?,
            ),
            None => None,
        };
        Ok(EscrowSnapshot {
            escrow_id: EscrowId(object.escrow_id),
            owner: object.owner,
            beneficiary: object.beneficiary,
            token: object.token,
            amount: object.amount,
            digest: SecretDigest::from_hex(&object.digest)
                .map_err(|e| AdapterError::Rpc(format!("escrow.get digest: {e}")))?,
            algorithm: HashAlgorithm::from_flag(object.algorithm)
                .map_err(|e| AdapterError::Rpc(e.to_string()))?,
            start_ms: object.start_ms,
            lock_duration_ms: object.lock_duration_ms,
            withdrawn: object.withdrawn,
            refunded: object.refunded,
            revealed_secret,
        })
    }

    async fn find_escrows_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> AdapterResult<Vec<EscrowId>> {
        let result = self
            .call(
                "registry.find_by_digest",
                vec![json!(self.registry_object), json!(digest.to_hex())],
            )
            .await?;
        let ids: Vec<String> = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("registry.find_by_digest: {e}")))?;
        Ok(ids.into_iter().map(EscrowId).collect())
    }

    async fn poll_events(&self, cursor: EventCursor, limit: usize) -> AdapterResult<EventBatch> {
        let result = self
            .call(
                "escrow.events",
                vec![
                    json!(self.registry_object),
                    json!({
                        "from_height": cursor.height,
                        "from_index": cursor.index,
                        "limit": limit,
                        "finality_depth": self.finality_depth,
                    }),
                ],
            )
            .await?;
        let page: RpcEventPage = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("escrow.events: {e}")))?;

        let mut events = Vec::with_capacity(page.events.len());
        for raw in page.events {
            match self.parse_event(raw) {
                Ok(event) => events.push(event),
                Err(e) => warn!("[SUI] skipping malformed event: {e}"),
            }
        }
        events.sort_by_key(|e| {
            let p = e.position();
            (p.block_height, p.event_index)
        });

        let next_cursor = match events.last() {
            Some(last) => EventCursor::after(last.position()),
            None => EventCursor::new(page.finalized_height.max(cursor.height), 0),
        };

        Ok(EventBatch {
            events,
            next_cursor,
            finalized_height: page.finalized_height,
        })
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        let result = self.call("chain.height", vec![]).await?;
        result
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::Rpc("chain.height: missing height".into()))
    }

    async fn ping(&self) -> AdapterResult<()> {
        self.latest_height().await.map(|_| ())
    }

    async fn register_resolver(&self, stake: u128) -> AdapterResult<Option<TxRef>> {
        let registered = self
            .call(
                "resolver.is_registered",
                vec![json!(self.registry_object), json!(self.signer_account)],
            )
            .await?;
        if registered.as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let result = self
            .call(
                "resolver.register",
                vec![
                    json!(self.registry_object),
                    json!(stake.to_string()),
                    json!(self.signer_account),
                ],
            )
            .await?;
        let submit: RpcSubmitResult = serde_json::from_value(result)
            .map_err(|e| AdapterError::Rpc(format!("resolver.register: {e}")))?;
        Ok(Some(TxRef(submit.tx_ref)))
    }
}

fn map_rpc_error(method: &str, error: JsonRpcError) -> AdapterError {
    match error.code {
        RPC_ERR_NOT_FOUND => AdapterError::NotFound(error.message),
        RPC_ERR_ALREADY_PROCESSED => AdapterError::AlreadyProcessed,
        RPC_ERR_INVALID_SECRET => AdapterError::InvalidSecret,
        RPC_ERR_NOT_EXPIRED => {
            let deadline_ms = error
                .data
                .as_ref()
                .and_then(|d| d.get("deadline_ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            AdapterError::NotExpired { deadline_ms }
        }
        RPC_ERR_EXPIRED => AdapterError::Expired,
        RPC_ERR_UNAUTHORIZED => AdapterError::Unauthorized,
        RPC_ERR_INSUFFICIENT_FUNDS => AdapterError::InsufficientFunds,
        RPC_ERR_CURSOR_GAP => {
            let rewind = error
                .data
                .as_ref()
                .and_then(|d| d.get("rewind_to"))
                .and_then(|v| {
                    Some(EventCursor::new(
                        v.get("height")?.as_u64()?,
                        v.get("index")?.as_u64()? as u32,
                    ))
                })
                .unwrap_or_default();
            AdapterError::CursorGap { rewind_to: rewind }
        }
        _ => AdapterError::Rpc(format!("{method}: {} (code {})", error.message, error.code)),
    }
}
