// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Embedded sled-backed store.
//!
//! Trees: `swaps` (id -> versioned record), `digest_index` (digest -> id),
//! `reveals`, `cursors`, `events` (dedup key -> event), `stakes`.

use super::{decode, encode, ExpectedVersion, StoreError, StoreResult, SwapStore, VersionedSwap};
use crate::crypto::SecretDigest;
use crate::types::{
    EscrowEvent, EventCursor, LedgerId, Reveal, StakeRecord, Swap, SwapId, SwapPhase,
};
use async_trait::async_trait;
use sled::transaction::ConflictableTransactionError;
use sled::{Transactional, Tree};
use std::path::Path;

pub struct SledStore {
    db: sled::Db,
    swaps: Tree,
    digest_index: Tree,
    reveals: Tree,
    cursors: Tree,
    events: Tree,
    stakes: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path).map_err(backend)?;
        Ok(Self {
            swaps: db.open_tree("swaps").map_err(backend)?,
            digest_index: db.open_tree("digest_index").map_err(backend)?,
            reveals: db.open_tree("reveals").map_err(backend)?,
            cursors: db.open_tree("cursors").map_err(backend)?,
            events: db.open_tree("events").map_err(backend)?,
            stakes: db.open_tree("stakes").map_err(backend)?,
            db,
        })
    }

    fn check_version(
        current: Option<&VersionedSwap>,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        match (expected, current) {
            (None, Some(v)) => Err(StoreError::VersionConflict {
                expected: 0,
                actual: v.version,
            }),
            (Some(expected), None) => Err(StoreError::VersionConflict {
                expected,
                actual: 0,
            }),
            (Some(expected), Some(v)) if expected != v.version => {
                Err(StoreError::VersionConflict {
                    expected,
                    actual: v.version,
                })
            }
            _ => Ok(current.map(|v| v.version).unwrap_or(0) + 1),
        }
    }

    fn scan_swaps(&self) -> StoreResult<Vec<VersionedSwap>> {
        let mut out = Vec::new();
        for item in self.swaps.iter() {
            let (_, bytes) = item.map_err(backend)?;
            out.push(decode::<VersionedSwap>(&bytes)?);
        }
        Ok(out)
    }
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl SwapStore for SledStore {
    async fn get_swap(&self, id: &SwapId) -> StoreResult<Option<VersionedSwap>> {
        match self.swaps.get(id.as_str().as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_swap(&self, swap: &Swap, expected: ExpectedVersion) -> StoreResult<u64> {
        let key = swap.id.as_str().as_bytes().to_vec();
        let current_bytes = self.swaps.get(&key).map_err(backend)?;
        let current = match &current_bytes {
            Some(bytes) => Some(decode::<VersionedSwap>(bytes)?),
            None => None,
        };
        let version = Self::check_version(current.as_ref(), expected)?;
        let record = encode(&VersionedSwap {
            swap: swap.clone(),
            version,
        })?;

        // compare_and_swap on the raw bytes we read keeps racing writers
        // honest even between our read and write.
        let swapped = self
            .swaps
            .compare_and_swap(&key, current_bytes, Some(record))
            .map_err(backend)?;
        if swapped.is_err() {
            let actual = match self.swaps.get(&key).map_err(backend)? {
                Some(bytes) => decode::<VersionedSwap>(&bytes)?.version,
                None => 0,
            };
            return Err(StoreError::VersionConflict {
                expected: expected.unwrap_or(0),
                actual,
            });
        }
        self.digest_index
            .insert(swap.digest.0.to_vec(), key)
            .map_err(backend)?;
        Ok(version)
    }

    async fn atomic_upsert_swap_and_append_event(
        &self,
        swap: &Swap,
        expected: ExpectedVersion,
        event: &EscrowEvent,
        cursor: Option<(LedgerId, EventCursor)>,
    ) -> StoreResult<u64> {
        let swap_key = swap.id.as_str().as_bytes().to_vec();
        let event_key = event.dedup_key().into_bytes();
        let event_bytes = encode(event)?;
        let cursor_entry = match cursor {
            Some((ledger, c)) => Some((ledger.as_str().as_bytes().to_vec(), c)),
            None => None,
        };

        let result = (&self.swaps, &self.digest_index, &self.events, &self.cursors).transaction(
            |(swaps, digest_index, events, cursors)| {
                let current = match swaps.get(&swap_key)? {
                    Some(bytes) => Some(decode::<VersionedSwap>(&bytes).map_err(abort)?),
                    None => None,
                };
                let version =
                    Self::check_version(current.as_ref(), expected).map_err(abort)?;
                let record = encode(&VersionedSwap {
                    swap: swap.clone(),
                    version,
                })
                .map_err(abort)?;
                swaps.insert(swap_key.as_slice(), record)?;
                digest_index.insert(swap.digest.0.to_vec(), swap_key.clone())?;
                events.insert(event_key.as_slice(), event_bytes.clone())?;

                if let Some((ledger_key, new_cursor)) = &cursor_entry {
                    let stored = match cursors.get(ledger_key.as_slice())? {
                        Some(bytes) => decode::<EventCursor>(&bytes).map_err(abort)?,
                        None => EventCursor::default(),
                    };
                    if *new_cursor > stored {
                        cursors.insert(
                            ledger_key.as_slice(),
                            encode(new_cursor).map_err(abort)?,
                        )?;
                    }
                }
                Ok(version)
            },
        );

        let version = result.map_err(|e| match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => backend(e),
        })?;

        self.db.flush_async().await.map_err(backend)?;
        Ok(version)
    }

    async fn all_swaps(&self) -> StoreResult<Vec<VersionedSwap>> {
        self.scan_swaps()
    }

    async fn swaps_by_phase(&self, phase: SwapPhase) -> StoreResult<Vec<VersionedSwap>> {
        Ok(self
            .scan_swaps()?
            .into_iter()
            .filter(|v| v.swap.phase == phase)
            .collect())
    }

    async fn swaps_with_deadline_before(&self, t_ms: u64) -> StoreResult<Vec<VersionedSwap>> {
        Ok(self
            .scan_swaps()?
            .into_iter()
            .filter(|v| !v.swap.phase.is_terminal())
            .filter(|v| v.swap.earliest_deadline_ms().is_some_and(|d| d <= t_ms))
            .collect())
    }

    async fn find_swap_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> StoreResult<Option<VersionedSwap>> {
        let Some(id_bytes) = self.digest_index.get(digest.0).map_err(backend)? else {
            return Ok(None);
        };
        match self.swaps.get(&id_bytes).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn insert_reveal(&self, reveal: &Reveal) -> StoreResult<bool> {
        let key = reveal.swap_id.as_str().as_bytes();
        let bytes = encode(reveal)?;
        let swapped = self
            .reveals
            .compare_and_swap(key, None::<&[u8]>, Some(bytes))
            .map_err(backend)?;
        Ok(swapped.is_ok())
    }

    async fn get_reveal(&self, swap_id: &SwapId) -> StoreResult<Option<Reveal>> {
        match self
            .reveals
            .get(swap_id.as_str().as_bytes())
            .map_err(backend)?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_cursor(&self, ledger: LedgerId) -> StoreResult<Option<EventCursor>> {
        match self
            .cursors
            .get(ledger.as_str().as_bytes())
            .map_err(backend)?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()> {
        let key = ledger.as_str().as_bytes();
        let stored = match self.cursors.get(key).map_err(backend)? {
            Some(bytes) => decode::<EventCursor>(&bytes)?,
            None => EventCursor::default(),
        };
        if cursor > stored {
            self.cursors
                .insert(key, encode(&cursor)?)
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn rewind_cursor(&self, ledger: LedgerId, cursor: EventCursor) -> StoreResult<()> {
        self.cursors
            .insert(ledger.as_str().as_bytes(), encode(&cursor)?)
            .map_err(backend)?;
        self.db.flush_async().await.map_err(backend)?;
        Ok(())
    }

    async fn has_event(&self, dedup_key: &str) -> StoreResult<bool> {
        self.events
            .contains_key(dedup_key.as_bytes())
            .map_err(backend)
    }

    async fn append_event(&self, event: &EscrowEvent) -> StoreResult<()> {
        self.events
            .insert(event.dedup_key().into_bytes(), encode(event)?)
            .map_err(backend)?;
        Ok(())
    }

    async fn remove_events_from(
        &self,
        ledger: LedgerId,
        height: u64,
    ) -> StoreResult<Vec<EscrowEvent>> {
        let mut doomed = Vec::new();
        for item in self.events.iter() {
            let (key, bytes) = item.map_err(backend)?;
            let event: EscrowEvent = decode(&bytes)?;
            if event.ledger() == ledger && event.position().block_height >= height {
                doomed.push((key, event));
            }
        }
        let mut removed = Vec::with_capacity(doomed.len());
        for (key, event) in doomed {
            self.events.remove(&key).map_err(backend)?;
            removed.push(event);
        }
        Ok(removed)
    }

    async fn delete_swap(&self, id: &SwapId) -> StoreResult<()> {
        if let Some(bytes) = self.swaps.remove(id.as_str().as_bytes()).map_err(backend)? {
            let record: VersionedSwap = decode(&bytes)?;
            self.digest_index
                .remove(record.swap.digest.0)
                .map_err(backend)?;
        }
        self.reveals
            .remove(id.as_str().as_bytes())
            .map_err(backend)?;
        Ok(())
    }

    async fn put_stake(&self, record: &StakeRecord) -> StoreResult<()> {
        self.stakes
            .insert(record.ledger.as_str().as_bytes(), encode(record)?)
            .map_err(backend)?;
        Ok(())
    }

    async fn get_stake(&self, ledger: LedgerId) -> StoreResult<Option<StakeRecord>> {
        match self
            .stakes
            .get(ledger.as_str().as_bytes())
            .map_err(backend)?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn purge_terminal_before(&self, t_ms: u64) -> StoreResult<usize> {
        let doomed: Vec<VersionedSwap> = self
            .scan_swaps()?
            .into_iter()
            .filter(|v| v.swap.phase.is_terminal() && v.swap.updated_ms <= t_ms)
            .collect();
        for v in &doomed {
            self.swaps
                .remove(v.swap.id.as_str().as_bytes())
                .map_err(backend)?;
            self.digest_index
                .remove(v.swap.digest.0)
                .map_err(backend)?;
            self.reveals
                .remove(v.swap.id.as_str().as_bytes())
                .map_err(backend)?;
        }
        Ok(doomed.len())
    }
}

fn abort(e: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e)
}
