// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store used by unit tests and the scenario suite.

use super::{ExpectedVersion, StoreError, StoreResult, SwapStore, VersionedSwap};
use crate::crypto::SecretDigest;
use crate::types::{
    EscrowEvent, EventCursor, LedgerId, Reveal, StakeRecord, Swap, SwapId, SwapPhase,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    swaps: HashMap<SwapId, VersionedSwap>,
    digest_index: HashMap<SecretDigest, SwapId>,
    reveals: HashMap<SwapId, Reveal>,
    cursors: HashMap<LedgerId, EventCursor>,
    events: HashMap<String, EscrowEvent>,
    stakes: HashMap<LedgerId, StakeRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put_swap_locked(
        inner: &mut Inner,
        swap: &Swap,
        expected: ExpectedVersion,
    ) -> StoreResult<u64> {
        let current = inner.swaps.get(&swap.id).map(|v| v.version);
        match (expected, current) {
            (None, Some(actual)) => {
                return Err(StoreError::VersionConflict {
                    expected: 0,
                    actual,
                })
            }
            (Some(expected), None) => {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: 0,
                })
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(StoreError::VersionConflict { expected, actual })
            }
            _ => {}
        }
        let version = current.unwrap_or(0) + 1;
        inner.digest_index.insert(swap.digest, swap.id.clone());
        inner.swaps.insert(
            swap.id.clone(),
            VersionedSwap {
                swap: swap.clone(),
                version,
            },
        );
        Ok(version)
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn get_swap(&self, id: &SwapId) -> StoreResult<Option<VersionedSwap>> {
        Ok(self.inner.lock().unwrap().swaps.get(id).cloned())
    }

    async fn put_swap(&self, swap: &Swap, expected: ExpectedVersion) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        Self::put_swap_locked(&mut inner, swap, expected)
    }

    async fn atomic_upsert_swap_and_append_event(
        &self,
        swap: &Swap,
        expected: ExpectedVersion,
        event: &EscrowEvent,
        cursor: Option<(LedgerId, EventCursor)>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let version = Self::put_swap_locked(&mut inner, swap, expected)?;
        inner.events.insert(event.dedup_key(), event.clone());
        if let Some((ledger, cursor)) = cursor {
            let entry = inner.cursors.entry(ledger).or_default();
            if cursor > *entry {
                *entry = cursor;
            }
        }
        Ok(version)
    }

    async fn all_swaps(&self) -> StoreResult<Vec<VersionedSwap>> {
        Ok(self.inner.lock().unwrap().swaps.values().cloned().collect())
    }

    async fn swaps_by_phase(&self, phase: SwapPhase) -> StoreResult<Vec<VersionedSwap>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .swaps
            .values()
            .filter(|v| v.swap.phase == phase)
            .cloned()
            .collect())
    }

    async fn swaps_with_deadline_before(&self, t_ms: u64) -> StoreResult<Vec<VersionedSwap>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .swaps
            .values()
            .filter(|v| !v.swap.phase.is_terminal())
            .filter(|v| v.swap.earliest_deadline_ms().is_some_and(|d| d <= t_ms))
            .cloned()
            .collect())
    }

    async fn find_swap_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> StoreResult<Option<VersionedSwap>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .digest_index
            .get(digest)
            .and_then(|id| inner.swaps.get(id))
            .cloned())
    }

    async fn insert_reveal(&self, reveal: &Reveal) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reveals.contains_key(&reveal.swap_id) {
            return Ok(false);
        }
        inner.reveals.insert(reveal.swap_id.clone(), reveal.clone());
        Ok(true)
    }

    async fn get_reveal(&self, swap_id: &SwapId) -> StoreResult<Option<Reveal>> {
        Ok(self.inner.lock().unwrap().reveals.get(swap_id).cloned())
    }

    async fn get_cursor(&self, ledger: LedgerId) -> StoreResult<Option<EventCursor>> {
        Ok(self.inner.lock().unwrap().cursors.get(&ledger).copied())
    }

    async fn put_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.cursors.entry(ledger).or_default();
        if cursor > *entry {
            *entry = cursor;
        }
        Ok(())
    }

    async fn rewind_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()> {
        self.inner.lock().unwrap().cursors.insert(ledger, cursor);
        Ok(())
    }

    async fn has_event(&self, dedup_key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().unwrap().events.contains_key(dedup_key))
    }

    async fn append_event(&self, event: &EscrowEvent) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .events
            .insert(event.dedup_key(), event.clone());
        Ok(())
    }

    async fn remove_events_from(
        &self,
        ledger: LedgerId,
        height: u64,
    ) -> StoreResult<Vec<EscrowEvent>> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .events
            .iter()
            .filter(|(_, e)| e.ledger() == ledger && e.position().block_height >= height)
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for key in &doomed {
            if let Some(event) = inner.events.remove(key) {
                removed.push(event);
            }
        }
        Ok(removed)
    }

    async fn delete_swap(&self, id: &SwapId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(v) = inner.swaps.remove(id) {
            inner.digest_index.remove(&v.swap.digest);
        }
        inner.reveals.remove(id);
        Ok(())
    }

    async fn put_stake(&self, record: &StakeRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .stakes
            .insert(record.ledger, record.clone());
        Ok(())
    }

    async fn get_stake(&self, ledger: LedgerId) -> StoreResult<Option<StakeRecord>> {
        Ok(self.inner.lock().unwrap().stakes.get(&ledger).cloned())
    }

    async fn purge_terminal_before(&self, t_ms: u64) -> StoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<SwapId> = inner
            .swaps
            .values()
            .filter(|v| v.swap.phase.is_terminal() && v.swap.updated_ms <= t_ms)
            .map(|v| v.swap.id.clone())
            .collect();
        let mut digests: HashSet<SecretDigest> = HashSet::new();
        for id in &doomed {
            if let Some(v) = inner.swaps.remove(id) {
                digests.insert(v.swap.digest);
            }
            inner.reveals.remove(id);
        }
        inner.digest_index.retain(|d, _| !digests.contains(d));
        Ok(doomed.len())
    }
}
