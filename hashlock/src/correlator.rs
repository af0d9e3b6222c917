// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Joins the two ledgers' escrow event streams by shared digest and turns
//! them into swap records plus evaluation signals.
//!
//! The correlator never drives phase transitions itself; it only attaches
//! facts (escrows, reveals, refunds) to swaps and pokes the engine through
//! the scheduler. Two escrows pair only when they sit on different ledgers
//! and commit to the same digest under the same algorithm; anything else
//! puts the swap on hold.

use crate::error::CoordinatorResult;
use crate::metrics::CoordinatorMetrics;
use crate::scheduler::{SignalReason, SwapSignal};
use crate::store::{StoreError, SwapStore, VersionedSwap};
use crate::types::{
    now_ms, EscrowEvent, EscrowSide, EventCursor, HoldReason, LedgerId, Reveal, Swap, SwapId,
    SwapPhase,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Correlator {
    store: Arc<dyn SwapStore>,
    signal_tx: mpsc::Sender<SwapSignal>,
    metrics: Arc<CoordinatorMetrics>,
}

impl Correlator {
    pub fn new(
        store: Arc<dyn SwapStore>,
        signal_tx: mpsc::Sender<SwapSignal>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            store,
            signal_tx,
            metrics,
        }
    }

    /// Apply one canonical event and advance the ledger cursor in the same
    /// store transaction. Duplicate deliveries are recognized by their
    /// on-chain position and only advance the cursor.
    pub async fn apply_event(
        &self,
        event: &EscrowEvent,
        cursor_after: EventCursor,
    ) -> CoordinatorResult<()> {
        let ledger = event.ledger();
        if self.store.has_event(&event.dedup_key()).await? {
            self.metrics
                .events_deduplicated
                .with_label_values(&[ledger.as_str()])
                .inc();
            self.store.put_cursor(ledger, cursor_after).await?;
            return Ok(());
        }

        // Optimistic-concurrency loop: reload and re-decide on conflict.
        loop {
            let existing = self.store.find_swap_by_digest(event.digest()).await?;
            let decision = self.decide(event, existing.as_ref());

            let (swap, expected, signal) = match decision {
                Decision::Ignore { reason } => {
                    debug!(
                        "[{}] ignoring {} event for digest {}: {}",
                        ledger,
                        event.kind(),
                        event.digest(),
                        reason
                    );
                    self.store.append_event(event).await?;
                    self.store.put_cursor(ledger, cursor_after).await?;
                    return Ok(());
                }
                Decision::Apply {
                    swap,
                    expected,
                    signal,
                } => (swap, expected, signal),
            };

            match self
                .store
                .atomic_upsert_swap_and_append_event(
                    &swap,
                    expected,
                    event,
                    Some((ledger, cursor_after)),
                )
                .await
            {
                Ok(_) => {
                    self.metrics
                        .events_received
                        .with_label_values(&[ledger.as_str(), event.kind()])
                        .inc();
                    if let EscrowEvent::Withdrawn(withdrawn) = event {
                        // First observation wins; later duplicates keep the
                        // original provenance.
                        self.store
                            .insert_reveal(&Reveal {
                                swap_id: swap.id.clone(),
                                digest: swap.digest,
                                secret: withdrawn.secret,
                                source_ledger: ledger,
                                source_tx_ref: withdrawn.position.tx_ref.clone(),
                                observed_ms: now_ms(),
                            })
                            .await?;
                    }
                    if let Some(reason) = signal {
                        let _ = self
                            .signal_tx
                            .send(SwapSignal {
                                swap_id: swap.id.clone(),
                                reason,
                            })
                            .await;
                    }
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    self.metrics
                        .version_conflicts
                        .with_label_values(&["correlator"])
                        .inc();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decide(&self, event: &EscrowEvent, existing: Option<&VersionedSwap>) -> Decision {
        match event {
            EscrowEvent::Created(created) => {
                let now = now_ms();
                match existing {
                    None => {
                        let mut swap = Swap::new(
                            SwapId::derive(&created.digest, created.algorithm),
                            created.digest,
                            created.algorithm,
                            now,
                        );
                        swap.set_side(EscrowSide::from_created(created));
                        info!(
                            "[{}] new swap {} from escrow {} (digest {})",
                            created.ledger, swap.id, created.escrow_id, created.digest
                        );
                        Decision::Apply {
                            swap,
                            expected: None,
                            signal: Some(SignalReason::EscrowObserved),
                        }
                    }
                    Some(versioned) => {
                        let mut swap = versioned.swap.clone();
                        let expected = Some(versioned.version);
                        match swap.side(created.ledger) {
                            Some(side) if side.escrow_id == created.escrow_id => {
                                Decision::Ignore {
                                    reason: "escrow already attached".into(),
                                }
                            }
                            Some(_) => {
                                // A second escrow on the same ledger shares
                                // the digest: not a valid A/B pair.
                                self.hold(&mut swap, "same-ledger escrow collision");
                                Decision::Apply {
                                    swap,
                                    expected,
                                    signal: None,
                                }
                            }
                            None if created.algorithm != swap.algorithm => {
                                self.hold(&mut swap, "algorithm mismatch across ledgers");
                                Decision::Apply {
                                    swap,
                                    expected,
                                    signal: None,
                                }
                            }
                            None => {
                                swap.set_side(EscrowSide::from_created(created));
                                swap.touch(now);
                                info!(
                                    "[{}] paired escrow {} onto swap {}",
                                    created.ledger, created.escrow_id, swap.id
                                );
                                Decision::Apply {
                                    swap,
                                    expected,
                                    signal: Some(SignalReason::EscrowObserved),
                                }
                            }
                        }
                    }
                }
            }
            EscrowEvent::Withdrawn(withdrawn) => {
                let Some(versioned) = existing else {
                    return Decision::Ignore {
                        reason: "withdrawal for unknown digest".into(),
                    };
                };
                let mut swap = versioned.swap.clone();
                let expected = Some(versioned.version);
                match swap.side_mut(withdrawn.ledger) {
                    Some(side) if side.refunded => Decision::Ignore {
                        reason: "withdrawal reported for a refunded escrow".into(),
                    },
                    Some(side) if side.escrow_id == withdrawn.escrow_id => {
                        side.withdrawn = true;
                        side.revealed_secret = Some(withdrawn.secret);
                        swap.touch(now_ms());
                        Decision::Apply {
                            swap,
                            expected,
                            signal: Some(SignalReason::RevealObserved),
                        }
                    }
                    _ => Decision::Ignore {
                        reason: "withdrawal for unattached escrow".into(),
                    },
                }
            }
            EscrowEvent::Refunded(refunded) => {
                let Some(versioned) = existing else {
                    return Decision::Ignore {
                        reason: "refund for unknown digest".into(),
                    };
                };
                let mut swap = versioned.swap.clone();
                let expected = Some(versioned.version);
                match swap.side_mut(refunded.ledger) {
                    Some(side) if side.withdrawn => Decision::Ignore {
                        reason: "refund reported for a withdrawn escrow".into(),
                    },
                    Some(side) if side.escrow_id == refunded.escrow_id => {
                        side.refunded = true;
                        swap.touch(now_ms());
                        Decision::Apply {
                            swap,
                            expected,
                            signal: Some(SignalReason::RefundObserved),
                        }
                    }
                    _ => Decision::Ignore {
                        reason: "refund for unattached escrow".into(),
                    },
                }
            }
        }
    }

    fn hold(&self, swap: &mut Swap, detail: &str) {
        if swap.hold.is_none() {
            warn!("swap {} on hold: {}", swap.id, detail);
            swap.hold = Some(HoldReason::AmbiguousPairing);
            swap.last_error = Some(format!("ambiguous pairing: {detail}"));
            swap.touch(now_ms());
            self.metrics
                .swaps_on_hold
                .with_label_values(&["ambiguous_pairing"])
                .inc();
        }
    }

    /// Undo the effects of events wiped by a deep reorg: a swap whose only
    /// escrow vanished is removed, a paired swap loses the vanished side
    /// and drops back to `Pending`. No on-chain action is taken here.
    pub async fn handle_rewind(
        &self,
        ledger: LedgerId,
        from_height: u64,
    ) -> CoordinatorResult<()> {
        let removed = self.store.remove_events_from(ledger, from_height).await?;
        if removed.is_empty() {
            return Ok(());
        }
        warn!(
            "[{}] rewind at height {}: {} recorded events dropped",
            ledger,
            from_height,
            removed.len()
        );
        self.metrics
            .cursor_rewinds
            .with_label_values(&[ledger.as_str()])
            .inc();

        for event in removed {
            let EscrowEvent::Created(created) = &event else {
                // Withdrawals and refunds re-emit after the rewind and are
                // idempotent; nothing to undo eagerly.
                continue;
            };
            let Some(versioned) = self.store.find_swap_by_digest(&created.digest).await? else {
                continue;
            };
            let mut swap = versioned.swap.clone();
            let attached = swap
                .side(ledger)
                .is_some_and(|s| s.escrow_id == created.escrow_id);
            if !attached {
                continue;
            }
            match ledger {
                LedgerId::Evm => swap.evm_side = None,
                LedgerId::Sui => swap.sui_side = None,
            }
            if swap.sides().next().is_none() {
                info!("swap {} removed: its only escrow was reorged out", swap.id);
                self.store.delete_swap(&swap.id).await?;
            } else {
                info!("swap {} demoted to pending after reorg", swap.id);
                swap.phase = SwapPhase::Pending;
                swap.touch(now_ms());
                match self.store.put_swap(&swap, Some(versioned.version)).await {
                    Ok(_) => {}
                    Err(StoreError::VersionConflict { .. }) => {
                        // A racing writer saw newer facts; leave its state.
                        self.metrics
                            .version_conflicts
                            .with_label_values(&["correlator"])
                            .inc();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

enum Decision {
    Ignore {
        reason: String,
    },
    Apply {
        swap: Swap,
        expected: Option<u64>,
        signal: Option<SignalReason>,
    },
}
