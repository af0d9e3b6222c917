// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle: wiring, resolver registration, health, graceful
//! shutdown.

use crate::adapter::evm::EvmAdapter;
use crate::adapter::sui::SuiAdapter;
use crate::adapter::ChainAdapter;
use crate::config::NodeConfig;
use crate::correlator::Correlator;
use crate::engine::SwapEngine;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ingest::EventIngestor;
use crate::metrics::CoordinatorMetrics;
use crate::scheduler::{RateLimiter, Scheduler, SignalReason, SwapSignal};
use crate::server::{run_ops_server, OpsState};
use crate::store::{SledStore, SwapStore};
use crate::types::{now_ms, StakeRecord, TxRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodic housekeeping cadence: retention purge, gauge refresh, deadline
/// safety sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Event batch size requested from adapters.
const INGEST_BATCH_LIMIT: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerHealth {
    pub connected: bool,
    pub latest_height: u64,
    pub cursor_height: u64,
    pub lag: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_ok: bool,
    pub evm: LedgerHealth,
    pub sui: LedgerHealth,
}

/// Connectivity and lag probe shared with the ops server.
pub struct HealthProbe {
    store: Arc<dyn SwapStore>,
    evm: Arc<dyn ChainAdapter>,
    sui: Arc<dyn ChainAdapter>,
    metrics: Arc<CoordinatorMetrics>,
}

impl HealthProbe {
    pub async fn check(&self) -> HealthReport {
        let store_ok = self.store.all_swaps().await.is_ok();
        let evm = self.probe_ledger(&self.evm).await;
        let sui = self.probe_ledger(&self.sui).await;
        self.metrics
            .ledger_connected
            .with_label_values(&["evm"])
            .set(evm.connected as i64);
        self.metrics
            .ledger_connected
            .with_label_values(&["sui"])
            .set(sui.connected as i64);
        HealthReport {
            healthy: store_ok && evm.connected && sui.connected,
            store_ok,
            evm,
            sui,
        }
    }

    async fn probe_ledger(&self, adapter: &Arc<dyn ChainAdapter>) -> LedgerHealth {
        let ledger = adapter.ledger();
        let cursor_height = self
            .store
            .get_cursor(ledger)
            .await
            .ok()
            .flatten()
            .map(|c| c.height)
            .unwrap_or(0);
        match adapter.latest_height().await {
            Ok(latest) => LedgerHealth {
                connected: true,
                latest_height: latest,
                cursor_height,
                lag: latest.saturating_sub(cursor_height),
            },
            Err(_) => LedgerHealth {
                connected: false,
                latest_height: 0,
                cursor_height,
                lag: 0,
            },
        }
    }
}

pub struct NodeHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    pub engine: Arc<SwapEngine>,
}

impl NodeHandle {
    /// Graceful stop: cancel waits at the next suspension point, let
    /// in-flight submits finish, checkpoint cursors.
    pub async fn stop(self) {
        info!("coordinator stopping");
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("coordinator stopped");
    }

    /// Run until all component tasks exit (they only exit on cancel).
    pub async fn wait(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Build adapters from config and start the coordinator.
pub async fn run_node(
    config: NodeConfig,
    registry: prometheus::Registry,
) -> CoordinatorResult<NodeHandle> {
    config.validate()?;
    let store: Arc<dyn SwapStore> = Arc::new(
        SledStore::open(&config.store_path)
            .map_err(|e| CoordinatorError::Internal(format!("store open failed: {e}")))?,
    );
    let evm: Arc<dyn ChainAdapter> = Arc::new(EvmAdapter::connect(&config.evm).await?);
    let sui: Arc<dyn ChainAdapter> = Arc::new(SuiAdapter::new(&config.sui));
    start_with_parts(config, store, evm, sui, registry).await
}

/// Start all components against prebuilt parts. Split out so tests can
/// drive the full node on in-memory adapters and store.
pub async fn start_with_parts(
    config: NodeConfig,
    store: Arc<dyn SwapStore>,
    evm: Arc<dyn ChainAdapter>,
    sui: Arc<dyn ChainAdapter>,
    registry: prometheus::Registry,
) -> CoordinatorResult<NodeHandle> {
    let metrics = Arc::new(CoordinatorMetrics::new(&registry));
    let cancel = CancellationToken::new();
    let started_at = std::time::Instant::now();

    let evm_limiter = Arc::new(RateLimiter::new(config.evm.rate_limit_rps));
    let sui_limiter = Arc::new(RateLimiter::new(config.sui.rate_limit_rps));

    let scheduler = Scheduler::new(config.channel_size, config.worker_count);
    let engine = Arc::new(SwapEngine::new(
        &config,
        store.clone(),
        (evm.clone(), evm_limiter.clone()),
        (sui.clone(), sui_limiter.clone()),
        scheduler.timer_handle(),
        metrics.clone(),
    ));
    let correlator = Arc::new(Correlator::new(
        store.clone(),
        scheduler.signal_sender(),
        metrics.clone(),
    ));

    register_as_resolver(&config, &store, &evm, &sui).await?;

    let mut handles = scheduler.run(engine.clone(), cancel.clone());

    for (adapter, limiter, poll_interval_ms) in [
        (evm.clone(), evm_limiter, config.evm.poll_interval_ms),
        (sui.clone(), sui_limiter, config.sui.poll_interval_ms),
    ] {
        let ingestor = EventIngestor::new(
            adapter,
            store.clone(),
            correlator.clone(),
            metrics.clone(),
            limiter,
            poll_interval_ms,
            INGEST_BATCH_LIMIT,
        );
        handles.push(tokio::spawn(ingestor.run(cancel.clone())));
    }

    // Rebuild timers and re-enter every non-terminal swap; stored
    // deadlines are the persisted form of the timer wheel.
    let signal_tx = scheduler.signal_sender();
    let resumed = store.all_swaps().await?;
    let mut reentered = 0usize;
    for v in resumed {
        if !v.swap.phase.is_terminal() {
            let _ = signal_tx
                .send(SwapSignal {
                    swap_id: v.swap.id.clone(),
                    reason: SignalReason::Startup,
                })
                .await;
            reentered += 1;
        }
    }
    info!("re-entered {} active swaps from the store", reentered);

    let health = Arc::new(HealthProbe {
        store: store.clone(),
        evm: evm.clone(),
        sui: sui.clone(),
        metrics: metrics.clone(),
    });
    handles.push(run_ops_server(
        config.ops_port,
        Arc::new(OpsState {
            registry,
            store: store.clone(),
            health: health.clone(),
            engine: engine.clone(),
        }),
        cancel.clone(),
    ));

    handles.push(tokio::spawn(run_sweeper(
        engine.clone(),
        store.clone(),
        scheduler.signal_sender(),
        metrics.clone(),
        health,
        started_at,
        cancel.clone(),
    )));

    info!("coordinator started");
    Ok(NodeHandle {
        cancel,
        handles,
        engine,
    })
}

async fn register_as_resolver(
    config: &NodeConfig,
    store: &Arc<dyn SwapStore>,
    evm: &Arc<dyn ChainAdapter>,
    sui: &Arc<dyn ChainAdapter>,
) -> CoordinatorResult<()> {
    for (adapter, stake) in [
        (evm, config.evm.resolver_stake),
        (sui, config.sui.resolver_stake),
    ] {
        let ledger = adapter.ledger();
        if store.get_stake(ledger).await?.is_some() {
            continue;
        }
        // Registration gates startup; ride out transient RPC noise.
        let tx_ref: Option<TxRef> = match crate::retry_with_max_elapsed_time!(
            adapter.register_resolver(stake),
            Duration::from_secs(30)
        ) {
            Ok(result) => {
                let result: crate::adapter::AdapterResult<Option<TxRef>> = result;
                result?
            }
            Err(e) => return Err(e.into()),
        };
        match &tx_ref {
            Some(tx) => info!("[{}] registered as resolver in {}", ledger, tx),
            None => info!("[{}] resolver registration already in place", ledger),
        }
        store
            .put_stake(&StakeRecord {
                ledger,
                amount: stake,
                tx_ref,
                registered_ms: now_ms(),
            })
            .await?;
    }
    Ok(())
}

async fn run_sweeper(
    engine: Arc<SwapEngine>,
    store: Arc<dyn SwapStore>,
    signal_tx: tokio::sync::mpsc::Sender<SwapSignal>,
    metrics: Arc<CoordinatorMetrics>,
    health: Arc<HealthProbe>,
    started_at: std::time::Instant,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("sweeper stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        metrics
            .uptime_seconds
            .set(started_at.elapsed().as_secs() as i64);
        let _ = health.check().await;

        match engine.purge_retired().await {
            Ok(0) => {}
            Ok(n) => info!("purged {} retired swaps", n),
            Err(e) => warn!("retention purge failed: {e}"),
        }
        if let Err(e) = engine.refresh_phase_gauges().await {
            warn!("phase gauge refresh failed: {e}");
        }

        // Safety net under the timer wheel: anything past its deadline
        // gets re-evaluated even if its timer was lost.
        match store.swaps_with_deadline_before(now_ms()).await {
            Ok(due) => {
                for v in due {
                    let _ = signal_tx
                        .send(SwapSignal {
                            swap_id: v.swap.id.clone(),
                            reason: SignalReason::TimerFired,
                        })
                        .await;
                }
            }
            Err(e) => warn!("deadline sweep failed: {e}"),
        }
    }
}
