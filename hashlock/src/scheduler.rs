// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Concurrency fabric for swap evaluation.
//!
//! Signals from the correlator and the timer wheel funnel into one bounded
//! queue. A dispatcher fans them out to a bounded worker pool with one hard
//! rule: at most one evaluation in flight per swap. Signals arriving for a
//! busy swap coalesce into a single re-run once the current evaluation
//! finishes.

use crate::types::SwapId;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info, warn};

/// Why a swap is being (re-)evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalReason {
    EscrowObserved,
    RevealObserved,
    RefundObserved,
    TimerFired,
    Startup,
    Operator,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::EscrowObserved => "escrow_observed",
            SignalReason::RevealObserved => "reveal_observed",
            SignalReason::RefundObserved => "refund_observed",
            SignalReason::TimerFired => "timer_fired",
            SignalReason::Startup => "startup",
            SignalReason::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapSignal {
    pub swap_id: SwapId,
    pub reason: SignalReason,
}

/// The state machine driver invoked by the worker pool.
#[async_trait]
pub trait SwapProcessor: Send + Sync + 'static {
    async fn process(&self, signal: SwapSignal);
}

/// Timer resolution. Deadlines are second-granular; nothing needs finer.
const TIMER_TICK: Duration = Duration::from_secs(1);

enum TimerRequest {
    Schedule { swap_id: SwapId, at_ms: u64 },
    Cancel { swap_id: SwapId },
}

/// Handle for arming per-swap timers. Timers are not persisted themselves;
/// they are rebuilt from stored deadlines on restart.
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::Sender<TimerRequest>,
}

impl TimerHandle {
    /// Arm (or pull forward) the timer for a swap. Keeps the earliest
    /// requested fire time.
    pub async fn schedule(&self, swap_id: SwapId, at_ms: u64) {
        let _ = self.tx.send(TimerRequest::Schedule { swap_id, at_ms }).await;
    }

    pub async fn cancel(&self, swap_id: SwapId) {
        let _ = self.tx.send(TimerRequest::Cancel { swap_id }).await;
    }
}

struct TimerEntry {
    key: Key,
    at_ms: u64,
}

async fn run_timer_wheel(
    mut rx: mpsc::Receiver<TimerRequest>,
    signal_tx: mpsc::Sender<SwapSignal>,
    cancel: CancellationToken,
) {
    let mut queue: DelayQueue<SwapId> = DelayQueue::new();
    let mut entries: HashMap<SwapId, TimerEntry> = HashMap::new();

    info!("timer wheel started (resolution {:?})", TIMER_TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("timer wheel cancelled");
                break;
            }
            request = rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    TimerRequest::Schedule { swap_id, at_ms } => {
                        let now = crate::types::now_ms();
                        let delay = Duration::from_millis(at_ms.saturating_sub(now));
                        match entries.get(&swap_id) {
                            Some(entry) if entry.at_ms <= at_ms => {
                                // Existing timer already fires sooner.
                            }
                            Some(entry) => {
                                queue.reset(&entry.key, delay);
                                entries.insert(swap_id, TimerEntry { key: entry.key, at_ms });
                            }
                            None => {
                                let key = queue.insert(swap_id.clone(), delay);
                                entries.insert(swap_id, TimerEntry { key, at_ms });
                            }
                        }
                    }
                    TimerRequest::Cancel { swap_id } => {
                        if let Some(entry) = entries.remove(&swap_id) {
                            queue.remove(&entry.key);
                        }
                    }
                }
            }
            expired = queue.next(), if !queue.is_empty() => {
                if let Some(expired) = expired {
                    let swap_id = expired.into_inner();
                    entries.remove(&swap_id);
                    debug!("timer fired for swap {}", swap_id);
                    let _ = signal_tx
                        .send(SwapSignal { swap_id, reason: SignalReason::TimerFired })
                        .await;
                }
            }
        }
    }
}

/// Token bucket limiting RPC submissions toward one ledger.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Self {
        let capacity = rps.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let (ref mut tokens, ref mut refreshed) = *state;
                let elapsed = refreshed.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
                *refreshed = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

#[derive(Default)]
struct InFlight {
    /// swap id -> whether a re-run was requested while busy.
    map: Mutex<HashMap<SwapId, bool>>,
}

/// Owns the signal queue, worker pool and timer wheel.
pub struct Scheduler {
    signal_tx: mpsc::Sender<SwapSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<SwapSignal>>>,
    timer_tx: mpsc::Sender<TimerRequest>,
    timer_rx: Mutex<Option<mpsc::Receiver<TimerRequest>>>,
    worker_count: usize,
}

impl Scheduler {
    pub fn new(channel_size: usize, worker_count: usize) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(channel_size);
        let (timer_tx, timer_rx) = mpsc::channel(channel_size);
        Self {
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            timer_tx,
            timer_rx: Mutex::new(Some(timer_rx)),
            worker_count,
        }
    }

    pub fn signal_sender(&self) -> mpsc::Sender<SwapSignal> {
        self.signal_tx.clone()
    }

    pub fn timer_handle(&self) -> TimerHandle {
        TimerHandle {
            tx: self.timer_tx.clone(),
        }
    }

    /// Spawn the dispatcher and timer wheel. Call once.
    pub fn run(
        &self,
        processor: Arc<dyn SwapProcessor>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let signal_rx = self
            .signal_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler already running");
        let timer_rx = self
            .timer_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler already running");

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_timer_wheel(
            timer_rx,
            self.signal_tx.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_dispatcher(
            signal_rx,
            processor,
            self.worker_count,
            cancel,
        )));
        handles
    }
}

async fn run_dispatcher(
    mut signal_rx: mpsc::Receiver<SwapSignal>,
    processor: Arc<dyn SwapProcessor>,
    worker_count: usize,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let inflight = Arc::new(InFlight::default());

    info!("dispatcher started with {} workers", worker_count);
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => {
                info!("dispatcher cancelled, draining stops");
                break;
            }
            signal = signal_rx.recv() => match signal {
                Some(s) => s,
                None => break,
            },
        };

        {
            let mut map = inflight.map.lock().unwrap();
            if let Some(resignal) = map.get_mut(&signal.swap_id) {
                // Coalesce: the running evaluation will re-run once.
                *resignal = true;
                continue;
            }
            map.insert(signal.swap_id.clone(), false);
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let processor = processor.clone();
        let inflight = inflight.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut reason = signal.reason;
            loop {
                processor
                    .process(SwapSignal {
                        swap_id: signal.swap_id.clone(),
                        reason,
                    })
                    .await;
                let rerun = {
                    let mut map = inflight.map.lock().unwrap();
                    match map.get_mut(&signal.swap_id) {
                        Some(resignal) if *resignal && !cancel.is_cancelled() => {
                            *resignal = false;
                            true
                        }
                        _ => {
                            map.remove(&signal.swap_id);
                            false
                        }
                    }
                };
                if !rerun {
                    break;
                }
                reason = SignalReason::EscrowObserved;
            }
        });
    }

    // Let in-flight evaluations finish; new ones are not started.
    let _ = semaphore.acquire_many(worker_count as u32).await;
    warn!("dispatcher drained");
}
