// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-ledger event ingestion.
//!
//! One long-lived task per ledger polls finalized escrow events in bounded
//! batches, hands each event to the correlator and advances the durable
//! cursor atomically with event persistence. Upstream delivery is
//! at-least-once; the store's event table makes consumption exactly-once.
//!
//! A deep reorg (the adapter reporting `CursorGap`) rewinds the cursor to
//! the oldest divergence and re-ingests; downstream idempotency makes the
//! re-emission safe.

use crate::adapter::{AdapterError, ChainAdapter};
use crate::correlator::Correlator;
use crate::metrics::CoordinatorMetrics;
use crate::scheduler::RateLimiter;
use crate::store::SwapStore;
use crate::types::{EventCursor, LedgerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct EventIngestor {
    ledger: LedgerId,
    adapter: Arc<dyn ChainAdapter>,
    store: Arc<dyn SwapStore>,
    correlator: Arc<Correlator>,
    metrics: Arc<CoordinatorMetrics>,
    rate_limiter: Arc<RateLimiter>,
    poll_interval: Duration,
    batch_limit: usize,
}

impl EventIngestor {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        store: Arc<dyn SwapStore>,
        correlator: Arc<Correlator>,
        metrics: Arc<CoordinatorMetrics>,
        rate_limiter: Arc<RateLimiter>,
        poll_interval_ms: u64,
        batch_limit: usize,
    ) -> Self {
        Self {
            ledger: adapter.ledger(),
            adapter,
            store,
            correlator,
            metrics,
            rate_limiter,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_limit,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut cursor = match self.store.get_cursor(self.ledger).await {
            Ok(c) => c.unwrap_or_default(),
            Err(e) => {
                warn!("[{}] cursor load failed, starting at zero: {e}", self.ledger);
                EventCursor::default()
            }
        };
        info!("[{}] ingestor started at cursor {}", self.ledger, cursor);

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Checkpoint before leaving so restart resumes here.
                    if let Err(e) = self.store.put_cursor(self.ledger, cursor).await {
                        warn!("[{}] cursor checkpoint on stop failed: {e}", self.ledger);
                    }
                    info!("[{}] ingestor stopped at cursor {}", self.ledger, cursor);
                    return;
                }
                _ = interval.tick() => {}
            }

            // Drain until a page comes back short, then wait a tick.
            loop {
                self.rate_limiter.acquire().await;
                match self.adapter.poll_events(cursor, self.batch_limit).await {
                    Ok(batch) => {
                        self.metrics
                            .finalized_height
                            .with_label_values(&[self.ledger.as_str()])
                            .set(batch.finalized_height as i64);

                        let full_page = batch.events.len() >= self.batch_limit;
                        let mut all_applied = true;
                        for event in &batch.events {
                            let cursor_after = EventCursor::after(event.position());
                            match self.correlator.apply_event(event, cursor_after).await {
                                Ok(()) => cursor = cursor.max(cursor_after),
                                Err(e) => {
                                    warn!(
                                        "[{}] failed to apply {} event at {}: {e}",
                                        self.ledger,
                                        event.kind(),
                                        cursor_after
                                    );
                                    all_applied = false;
                                    break;
                                }
                            }
                        }

                        if all_applied {
                            cursor = cursor.max(batch.next_cursor);
                            if let Err(e) = self.store.put_cursor(self.ledger, cursor).await {
                                warn!("[{}] cursor store failed: {e}", self.ledger);
                            }
                        }
                        self.metrics
                            .cursor_height
                            .with_label_values(&[self.ledger.as_str()])
                            .set(cursor.height as i64);

                        if !(all_applied && full_page) || cancel.is_cancelled() {
                            break;
                        }
                        debug!("[{}] full page, continuing catch-up", self.ledger);
                    }
                    Err(AdapterError::CursorGap { rewind_to }) => {
                        warn!(
                            "[{}] deep reorg: rewinding cursor {} -> {}",
                            self.ledger, cursor, rewind_to
                        );
                        if let Err(e) = self
                            .correlator
                            .handle_rewind(self.ledger, rewind_to.height)
                            .await
                        {
                            warn!("[{}] rewind cleanup failed: {e}", self.ledger);
                            break;
                        }
                        if let Err(e) = self.store.rewind_cursor(self.ledger, rewind_to).await {
                            warn!("[{}] cursor rewind persist failed: {e}", self.ledger);
                            break;
                        }
                        cursor = rewind_to;
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        debug!("[{}] transient poll failure: {e}", self.ledger);
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] poll failed: {e}", self.ledger);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockChainAdapter;
    use crate::crypto::{self, HashAlgorithm, Secret};
    use crate::scheduler::SwapSignal;
    use crate::store::MemoryStore;
    use crate::test_utils::created_event;
    use tokio::sync::mpsc;

    struct Fixture {
        adapter: Arc<MockChainAdapter>,
        store: Arc<MemoryStore>,
        correlator: Arc<Correlator>,
        _signal_rx: mpsc::Receiver<SwapSignal>,
    }

    fn fixture(ledger: LedgerId) -> Fixture {
        let adapter = Arc::new(MockChainAdapter::new(ledger));
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(256);
        let correlator = Arc::new(Correlator::new(
            store.clone(),
            tx,
            Arc::new(CoordinatorMetrics::new_for_testing()),
        ));
        Fixture {
            adapter,
            store,
            correlator,
            _signal_rx: rx,
        }
    }

    fn ingestor(f: &Fixture) -> EventIngestor {
        EventIngestor::new(
            f.adapter.clone(),
            f.store.clone(),
            f.correlator.clone(),
            Arc::new(CoordinatorMetrics::new_for_testing()),
            Arc::new(RateLimiter::new(1_000)),
            10,
            100,
        )
    }

    #[tokio::test]
    async fn test_ingest_applies_events_and_advances_cursor() {
        let f = fixture(LedgerId::Evm);
        let secret = Secret([11u8; 32]);
        let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
        f.adapter
            .push_event_page(vec![created_event(LedgerId::Evm, "0xa", &digest, 42, 0)]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingestor(&f).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let _ = handle.await;

        let swap = f.store.find_swap_by_digest(&digest).await.unwrap();
        assert!(swap.is_some());
        let cursor = f.store.get_cursor(LedgerId::Evm).await.unwrap().unwrap();
        assert!(cursor >= EventCursor::new(42, 1));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let f = fixture(LedgerId::Evm);
        let secret = Secret([12u8; 32]);
        let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
        let event = created_event(LedgerId::Evm, "0xa", &digest, 50, 0);
        // The same event delivered on two consecutive polls.
        f.adapter.push_event_page(vec![event.clone()]);
        f.adapter.push_event_page(vec![event.clone()]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingestor(&f).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        let _ = handle.await;

        let swap = f
            .store
            .find_swap_by_digest(&digest)
            .await
            .unwrap()
            .unwrap()
            .swap;
        // Still exactly one attached side.
        assert!(swap.evm_side.is_some());
        assert!(swap.sui_side.is_none());
    }

    #[tokio::test]
    async fn test_cursor_gap_rewinds_and_reingests() {
        let f = fixture(LedgerId::Evm);
        let secret = Secret([13u8; 32]);
        let digest = crypto::digest(&secret, HashAlgorithm::Sha256);

        // First poll delivers the event, second poll reports a deep reorg
        // below it, third re-delivers it at a new position.
        f.adapter
            .push_event_page(vec![created_event(LedgerId::Evm, "0xa", &digest, 100, 0)]);
        f.adapter.push_poll_error(AdapterError::CursorGap {
            rewind_to: EventCursor::new(90, 0),
        });
        f.adapter
            .push_event_page(vec![created_event(LedgerId::Evm, "0xa", &digest, 95, 0)]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingestor(&f).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        let _ = handle.await;

        let swap = f
            .store
            .find_swap_by_digest(&digest)
            .await
            .unwrap()
            .unwrap()
            .swap;
        assert!(swap.evm_side.is_some());
        let cursor = f.store.get_cursor(LedgerId::Evm).await.unwrap().unwrap();
        assert!(cursor >= EventCursor::new(95, 1));
    }
}
