// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable swap state. Two implementations share one contract: an embedded
//! sled database for production and an in-memory map for tests.
//!
//! All swap mutations go through optimistic concurrency: writers pass the
//! version they read and get [`StoreError::VersionConflict`] when somebody
//! else won the race. The ingestor's cursor advance is atomic with event
//! persistence, so no event can be consumed without being recorded.

use crate::crypto::SecretDigest;
use crate::types::{
    EscrowEvent, EventCursor, LedgerId, Reveal, StakeRecord, Swap, SwapId, SwapPhase,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::NotFound(_) => "store_not_found",
            StoreError::Serialization(_) => "store_serialization",
            StoreError::Backend(_) => "store_backend",
        }
    }

    /// Version conflicts resolve by reload-and-redecide; backend errors may
    /// clear on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Backend(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A swap plus the version to pass back on the next write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedSwap {
    pub swap: Swap,
    pub version: u64,
}

/// Expected version for a write: `None` asserts the record does not exist
/// yet.
pub type ExpectedVersion = Option<u64>;

#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn get_swap(&self, id: &SwapId) -> StoreResult<Option<VersionedSwap>>;

    /// Insert or update a swap. Returns the new version.
    async fn put_swap(&self, swap: &Swap, expected: ExpectedVersion) -> StoreResult<u64>;

    /// Single-transaction upsert + event append + cursor advance. The
    /// cursor, when given, must move forward; backwards moves use
    /// [`SwapStore::rewind_cursor`].
    async fn atomic_upsert_swap_and_append_event(
        &self,
        swap: &Swap,
        expected: ExpectedVersion,
        event: &EscrowEvent,
        cursor: Option<(LedgerId, EventCursor)>,
    ) -> StoreResult<u64>;

    async fn all_swaps(&self) -> StoreResult<Vec<VersionedSwap>>;

    async fn swaps_by_phase(&self, phase: SwapPhase) -> StoreResult<Vec<VersionedSwap>>;

    /// Swaps whose earliest known deadline is at or before `t_ms`,
    /// non-terminal only.
    async fn swaps_with_deadline_before(&self, t_ms: u64) -> StoreResult<Vec<VersionedSwap>>;

    async fn find_swap_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> StoreResult<Option<VersionedSwap>>;

    /// Record a reveal. Returns false when one already exists for the swap
    /// (first observation wins).
    async fn insert_reveal(&self, reveal: &Reveal) -> StoreResult<bool>;

    async fn get_reveal(&self, swap_id: &SwapId) -> StoreResult<Option<Reveal>>;

    async fn get_cursor(&self, ledger: LedgerId) -> StoreResult<Option<EventCursor>>;

    /// Forward-only cursor write; silently keeps the stored cursor when the
    /// given one is behind it.
    async fn put_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()>;

    /// Deliberate backwards move after a deep reorg.
    async fn rewind_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()>;

    /// Whether an event with this dedup key has been recorded.
    async fn has_event(&self, dedup_key: &str) -> StoreResult<bool>;

    async fn append_event(&self, event: &EscrowEvent) -> StoreResult<()>;

    /// Drop recorded events from `height` upwards on one ledger (reorg
    /// cleanup), returning the removed events.
    async fn remove_events_from(
        &self,
        ledger: LedgerId,
        height: u64,
    ) -> StoreResult<Vec<EscrowEvent>>;

    /// Remove a swap outright. Only used when a reorg wipes the escrow that
    /// created it; normal terminal swaps go through retention-based purge.
    async fn delete_swap(&self, id: &SwapId) -> StoreResult<()>;

    async fn put_stake(&self, record: &StakeRecord) -> StoreResult<()>;

    async fn get_stake(&self, ledger: LedgerId) -> StoreResult<Option<StakeRecord>>;

    /// Delete terminal swaps (and their reveals) whose last update is older
    /// than `t_ms`. Returns how many were purged.
    async fn purge_terminal_before(&self, t_ms: u64) -> StoreResult<usize>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
