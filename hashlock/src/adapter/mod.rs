// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Uniform capability surface over a ledger: read escrow events, read
//! escrow state, submit transactions, wait for finality.
//!
//! Every submit is idempotent as long as the caller works against one
//! digest: the adapter inspects on-chain state before re-submitting and
//! reports [`AdapterError::AlreadyProcessed`] when the action has been done
//! by anyone, including another coordinator instance.

use crate::crypto::{HashAlgorithm, Secret, SecretDigest};
use crate::types::{EscrowEvent, EscrowId, EventCursor, LedgerId, TxRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod evm;
pub mod sui;

#[cfg(test)]
pub mod mock;

/// Typed adapter failure. `error_code` values are stable metric labels.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("insufficient funds for escrow creation")]
    InsufficientFunds,

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("ledger operation timed out: {0}")]
    Timeout(String),

    #[error("secret does not satisfy the escrow's hash lock")]
    InvalidSecret,

    #[error("escrow lock expired; withdrawal refused")]
    Expired,

    #[error("escrow not yet expired; refund refused until {deadline_ms}")]
    NotExpired { deadline_ms: u64 },

    #[error("action already processed on-chain")]
    AlreadyProcessed,

    #[error("caller is not authorized for this escrow")]
    Unauthorized,

    #[error("escrow {0} not found")]
    NotFound(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("event subscription disconnected: {0}")]
    Disconnected(String),

    #[error("reorg beyond finality depth; rewind cursor to {rewind_to}")]
    CursorGap { rewind_to: EventCursor },

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl AdapterError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AdapterError::InsufficientFunds => "insufficient_funds",
            AdapterError::Rejected(_) => "rejected",
            AdapterError::Timeout(_) => "timeout",
            AdapterError::InvalidSecret => "invalid_secret",
            AdapterError::Expired => "expired",
            AdapterError::NotExpired { .. } => "not_expired",
            AdapterError::AlreadyProcessed => "already_processed",
            AdapterError::Unauthorized => "unauthorized",
            AdapterError::NotFound(_) => "not_found",
            AdapterError::Unavailable(_) => "unavailable",
            AdapterError::Disconnected(_) => "disconnected",
            AdapterError::CursorGap { .. } => "cursor_gap",
            AdapterError::Rpc(_) => "rpc_error",
        }
    }

    /// Transient transport-level failures worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout(_)
                | AdapterError::Unavailable(_)
                | AdapterError::Disconnected(_)
                | AdapterError::Rpc(_)
        )
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Inputs for escrow creation.
#[derive(Debug, Clone)]
pub struct CreateEscrowParams {
    pub token: String,
    pub amount: u128,
    pub digest: SecretDigest,
    pub algorithm: HashAlgorithm,
    pub beneficiary: String,
    pub lock_duration_ms: u64,
}

/// Point-in-time view of an escrow as the ledger reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub escrow_id: EscrowId,
    pub owner: String,
    pub beneficiary: String,
    pub token: String,
    pub amount: u128,
    pub digest: SecretDigest,
    pub algorithm: HashAlgorithm,
    pub start_ms: u64,
    pub lock_duration_ms: u64,
    pub withdrawn: bool,
    pub refunded: bool,
    /// Preimage as published by the withdrawal, when the ledger exposes it.
    pub revealed_secret: Option<Secret>,
}

impl EscrowSnapshot {
    pub fn deadline_ms(&self) -> u64 {
        self.start_ms + self.lock_duration_ms
    }

    pub fn is_terminal(&self) -> bool {
        self.withdrawn || self.refunded
    }
}

/// One page of finalized escrow events plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    /// Finalized events, in on-chain order per escrow. Delivery is
    /// at-least-once; consumers dedupe on `(ledger, tx_ref, event_index)`.
    pub events: Vec<EscrowEvent>,
    /// Cursor positioned after the last event of this page.
    pub next_cursor: EventCursor,
    /// Highest finalized height observed while building the page.
    pub finalized_height: u64,
}

/// Capability surface the coordinator holds per ledger.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn ledger(&self) -> LedgerId;

    /// Address this coordinator signs with on the ledger.
    fn signer_address(&self) -> String;

    /// Lock funds behind a hash lock. Returns the new escrow id once the
    /// creating transaction is final.
    async fn create_escrow(
        &self,
        params: CreateEscrowParams,
    ) -> AdapterResult<(EscrowId, TxRef)>;

    /// Claim an escrow by revealing the preimage.
    async fn withdraw(&self, escrow_id: &EscrowId, secret: &Secret) -> AdapterResult<TxRef>;

    /// Return locked funds to the owner after the deadline.
    async fn refund(&self, escrow_id: &EscrowId) -> AdapterResult<TxRef>;

    async fn get_escrow(&self, escrow_id: &EscrowId) -> AdapterResult<EscrowSnapshot>;

    /// Registry lookup by hash commitment.
    async fn find_escrows_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> AdapterResult<Vec<EscrowId>>;

    /// Poll one page of finalized events starting at `cursor`. Finite per
    /// call, restartable from any previously returned cursor.
    async fn poll_events(&self, cursor: EventCursor, limit: usize) -> AdapterResult<EventBatch>;

    async fn latest_height(&self) -> AdapterResult<u64>;

    /// Cheap connectivity probe for health reporting.
    async fn ping(&self) -> AdapterResult<()>;

    /// Register this coordinator as a resolver, staking `stake` if the
    /// on-chain contracts require it. Idempotent: returns `Ok(None)` when
    /// already registered.
    async fn register_resolver(&self, stake: u128) -> AdapterResult<Option<TxRef>>;
}
