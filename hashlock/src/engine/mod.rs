// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-swap state machine.
//!
//! Evaluations are serialized per swap by the scheduler, so this code never
//! races against itself on one swap; it still races against other
//! coordinator instances through the store, which is why every persist
//! carries the version it read. Phases advance one step at a time and are
//! re-entered until settled, so a `BothLocked -> Completed` path always
//! traverses `Revealed`.

mod policy;

pub use policy::{backoff_delay_ms, SwapPolicy};

use crate::adapter::{AdapterError, ChainAdapter};
use crate::config::{NodeConfig, RetryConfig};
use crate::crypto::{self, Secret};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics::CoordinatorMetrics;
use crate::scheduler::{RateLimiter, SwapProcessor, SwapSignal, TimerHandle};
use crate::store::{StoreError, SwapStore};
use crate::types::{now_ms, LedgerId, Swap, SwapId, SwapPhase};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on immediate re-entries of one evaluation; covers the
/// longest legal phase chain plus a few conflict reloads.
const MAX_EVAL_ROUNDS: usize = 8;

/// Grace added when arming deadline timers, matching timer resolution.
const DEADLINE_GRACE_MS: u64 = 1_000;

struct LedgerPort {
    adapter: Arc<dyn ChainAdapter>,
    limiter: Arc<RateLimiter>,
}

pub struct SwapEngine {
    store: Arc<dyn SwapStore>,
    ports: HashMap<LedgerId, LedgerPort>,
    timers: TimerHandle,
    metrics: Arc<CoordinatorMetrics>,
    policy: SwapPolicy,
    retry: RetryConfig,
    retention_ms: u64,
}

enum StepOutcome {
    /// Nothing further to do this round.
    Settled,
    /// The phase moved; evaluate again immediately.
    Continue,
}

impl SwapEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &NodeConfig,
        store: Arc<dyn SwapStore>,
        evm: (Arc<dyn ChainAdapter>, Arc<RateLimiter>),
        sui: (Arc<dyn ChainAdapter>, Arc<RateLimiter>),
        timers: TimerHandle,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let mut ports = HashMap::new();
        ports.insert(
            LedgerId::Evm,
            LedgerPort {
                adapter: evm.0,
                limiter: evm.1,
            },
        );
        ports.insert(
            LedgerId::Sui,
            LedgerPort {
                adapter: sui.0,
                limiter: sui.1,
            },
        );
        Self {
            store,
            ports,
            timers,
            metrics,
            policy: SwapPolicy::from_config(config),
            retry: config.retry,
            retention_ms: config.retention_ms,
        }
    }

    fn port(&self, ledger: LedgerId) -> &LedgerPort {
        self.ports.get(&ledger).expect("both ledgers are wired")
    }

    /// Drive one swap as far as it can go right now.
    pub async fn evaluate(&self, swap_id: &SwapId) -> CoordinatorResult<()> {
        for _ in 0..MAX_EVAL_ROUNDS {
            let Some(versioned) = self.store.get_swap(swap_id).await? else {
                debug!("swap {} no longer in store", swap_id);
                return Ok(());
            };
            let mut swap = versioned.swap;
            let version = versioned.version;

            if swap.phase.is_terminal() {
                self.timers.cancel(swap_id.clone()).await;
                return Ok(());
            }
            if swap.hold.is_some() {
                debug!("swap {} is on hold, operator required", swap_id);
                return Ok(());
            }

            let now = now_ms();
            if let Some(next) = swap.next_attempt_ms {
                if next > now {
                    self.timers.schedule(swap_id.clone(), next).await;
                    return Ok(());
                }
            }

            let before = swap.phase;
            let outcome = self.step(&mut swap, now).await?;

            match self.store.put_swap(&swap, Some(version)).await {
                Ok(_) => {
                    if swap.phase != before {
                        self.metrics
                            .swap_transitions
                            .with_label_values(&[before.as_str(), swap.phase.as_str()])
                            .inc();
                        info!("swap {}: {} -> {}", swap.id, before, swap.phase);
                    }
                    self.arm_timers(&swap).await;
                    match outcome {
                        StepOutcome::Continue => continue,
                        StepOutcome::Settled => return Ok(()),
                    }
                }
                Err(StoreError::VersionConflict { .. }) => {
                    // Another instance advanced this swap; reload and
                    // re-decide from its state.
                    self.metrics
                        .version_conflicts
                        .with_label_values(&["engine"])
                        .inc();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!("swap {} did not settle within {} rounds", swap_id, MAX_EVAL_ROUNDS);
        Ok(())
    }

    async fn step(&self, swap: &mut Swap, now: u64) -> CoordinatorResult<StepOutcome> {
        match swap.phase {
            SwapPhase::Pending => {
                if swap.sides().next().is_some() {
                    self.transition(swap, SwapPhase::OneSideLocked, now);
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::Settled)
                }
            }
            SwapPhase::OneSideLocked => {
                let violation = [&swap.evm_side, &swap.sui_side]
                    .into_iter()
                    .flatten()
                    .find_map(|side| self.policy.check_side(side).err());
                if let Some(detail) = violation {
                    self.fail(swap, &detail, "policy_violation", now);
                    return Ok(StepOutcome::Settled);
                }
                if swap.both_locked() {
                    if let Err(detail) = self.policy.check_pair(swap) {
                        self.fail(swap, &detail, "policy_violation", now);
                        return Ok(StepOutcome::Settled);
                    }
                    self.transition(swap, SwapPhase::BothLocked, now);
                    return Ok(StepOutcome::Continue);
                }
                if self.reveal_known(swap) {
                    // The lone escrow was already claimed; nothing to pair.
                    self.transition(swap, SwapPhase::Revealed, now);
                    return Ok(StepOutcome::Continue);
                }
                if self.any_side_expired(swap, now) {
                    return self.drive_expiry(swap, now).await;
                }
                Ok(StepOutcome::Settled)
            }
            SwapPhase::BothLocked => {
                if self.reveal_known(swap) {
                    self.transition(swap, SwapPhase::Revealed, now);
                    return Ok(StepOutcome::Continue);
                }
                if swap.sides().any(|s| s.refunded) || self.any_side_expired(swap, now) {
                    return self.drive_expiry(swap, now).await;
                }
                Ok(StepOutcome::Settled)
            }
            SwapPhase::Revealed => self.drive_reveal(swap, now).await,
            // Terminal phases never reach step().
            SwapPhase::Completed | SwapPhase::Expired | SwapPhase::Failed => {
                Ok(StepOutcome::Settled)
            }
        }
    }

    fn reveal_known(&self, swap: &Swap) -> bool {
        swap.sides().any(|s| s.revealed_secret.is_some())
    }

    fn any_side_expired(&self, swap: &Swap, now: u64) -> bool {
        swap.sides()
            .any(|s| !s.is_terminal() && now > s.deadline_ms())
    }

    fn revealed_secret(&self, swap: &Swap) -> Option<Secret> {
        swap.sides().find_map(|s| s.revealed_secret)
    }

    /// Propagate an observed reveal to the complementary escrow.
    async fn drive_reveal(&self, swap: &mut Swap, now: u64) -> CoordinatorResult<StepOutcome> {
        let secret = match self.revealed_secret(swap) {
            Some(secret) => secret,
            None => match self.store.get_reveal(&swap.id).await? {
                Some(reveal) => reveal.secret,
                None => {
                    warn!("swap {} revealed without a recorded secret", swap.id);
                    return Ok(StepOutcome::Settled);
                }
            },
        };

        // Re-verify before acting on it; an escrow on the other ledger may
        // have been created under a different algorithm.
        if !crypto::verify(&secret, &swap.digest, swap.algorithm) {
            self.metrics
                .incidents
                .with_label_values(&["reveal_mismatch"])
                .inc();
            self.fail(
                swap,
                "revealed secret does not match the committed digest",
                "reveal_mismatch",
                now,
            );
            return Ok(StepOutcome::Settled);
        }

        let target = swap
            .sides()
            .find(|s| !s.withdrawn)
            .map(|s| (s.ledger, s.escrow_id.clone()));
        let Some((ledger, escrow_id)) = target else {
            self.transition(swap, SwapPhase::Completed, now);
            return Ok(StepOutcome::Settled);
        };

        let port = self.port(ledger);
        port.limiter.acquire().await;
        self.metrics
            .submissions
            .with_label_values(&[ledger.as_str(), "withdraw"])
            .inc();
        let started = std::time::Instant::now();
        let result = port.adapter.withdraw(&escrow_id, &secret).await;
        self.metrics
            .submission_latency
            .with_label_values(&[ledger.as_str(), "withdraw"])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(tx_ref) => {
                info!(
                    "[{}] withdraw of {} confirmed in {}",
                    ledger, escrow_id, tx_ref
                );
                self.mark_withdrawn(swap, ledger, secret, now);
                Ok(StepOutcome::Continue)
            }
            Err(AdapterError::AlreadyProcessed) => {
                // Someone else submitted the same secret first. The funds
                // moved; that is a success for the swap.
                debug!("[{}] withdraw of {} already processed", ledger, escrow_id);
                self.mark_withdrawn(swap, ledger, secret, now);
                Ok(StepOutcome::Continue)
            }
            Err(AdapterError::NotFound(_)) => {
                // The escrow object vanished after terminality; treat it as
                // claimed rather than depending on its continued existence.
                warn!("[{}] escrow {} vanished, assuming claimed", ledger, escrow_id);
                self.mark_withdrawn(swap, ledger, secret, now);
                Ok(StepOutcome::Continue)
            }
            Err(AdapterError::InvalidSecret) => {
                self.metrics
                    .submission_errors
                    .with_label_values(&[ledger.as_str(), "withdraw", "invalid_secret"])
                    .inc();
                self.metrics
                    .incidents
                    .with_label_values(&["invalid_secret"])
                    .inc();
                self.fail(
                    swap,
                    &format!("ledger {} rejected the revealed secret", ledger),
                    "invalid_secret",
                    now,
                );
                Ok(StepOutcome::Settled)
            }
            Err(AdapterError::Expired) => {
                // Claim window closed before we could act.
                warn!("[{}] withdraw window on {} expired", ledger, escrow_id);
                self.drive_expiry(swap, now).await
            }
            Err(e) => {
                self.metrics
                    .submission_errors
                    .with_label_values(&[ledger.as_str(), "withdraw", e.error_code()])
                    .inc();
                self.handle_action_error(swap, &e.into(), now);
                Ok(StepOutcome::Settled)
            }
        }
    }

    fn mark_withdrawn(&self, swap: &mut Swap, ledger: LedgerId, secret: Secret, now: u64) {
        if let Some(side) = swap.side_mut(ledger) {
            side.withdrawn = true;
            side.revealed_secret.get_or_insert(secret);
        }
        swap.clear_error();
        swap.touch(now);
        if swap.sides().all(|s| s.withdrawn) {
            self.transition(swap, SwapPhase::Completed, now);
        }
    }

    /// Refund every still-locked side whose deadline has passed. Sides this
    /// coordinator does not own are attempted too and an `Unauthorized`
    /// answer simply leaves them to their owner; the expiry gate only
    /// requires our own sides to be settled.
    async fn drive_expiry(&self, swap: &mut Swap, now: u64) -> CoordinatorResult<StepOutcome> {
        if self.reveal_known(swap) && swap.sides().any(|s| !s.is_terminal()) {
            // A reveal exists; claiming beats refunding.
            if swap.phase != SwapPhase::Revealed {
                self.transition(swap, SwapPhase::Revealed, now);
                return Ok(StepOutcome::Continue);
            }
        }

        let mut blocked = false;
        for ledger in [LedgerId::Evm, LedgerId::Sui] {
            let Some(side) = swap.side(ledger) else { continue };
            if side.is_terminal() {
                continue;
            }
            if now <= side.deadline_ms() {
                blocked = true;
                continue;
            }
            let escrow_id = side.escrow_id.clone();

            let port = self.port(ledger);
            port.limiter.acquire().await;
            self.metrics
                .submissions
                .with_label_values(&[ledger.as_str(), "refund"])
                .inc();
            let started = std::time::Instant::now();
            let result = port.adapter.refund(&escrow_id).await;
            self.metrics
                .submission_latency
                .with_label_values(&[ledger.as_str(), "refund"])
                .observe(started.elapsed().as_secs_f64());

            let mut settled = false;
            let mut retry_at = None;
            let mut action_error = None;
            match result {
                Ok(tx_ref) => {
                    info!("[{}] refund of {} confirmed in {}", ledger, escrow_id, tx_ref);
                    settled = true;
                }
                Err(AdapterError::AlreadyProcessed) => settled = true,
                Err(AdapterError::NotFound(_)) => {
                    warn!("[{}] escrow {} vanished, assuming settled", ledger, escrow_id);
                    settled = true;
                }
                Err(AdapterError::NotExpired { deadline_ms }) => {
                    // Clock skew against the ledger; come back just after
                    // the deadline it reports.
                    retry_at = Some(deadline_ms.max(now) + DEADLINE_GRACE_MS);
                }
                Err(AdapterError::Unauthorized) => {
                    debug!(
                        "[{}] not allowed to refund {}, leaving it to its owner",
                        ledger, escrow_id
                    );
                }
                Err(e) => {
                    self.metrics
                        .submission_errors
                        .with_label_values(&[ledger.as_str(), "refund", e.error_code()])
                        .inc();
                    action_error = Some(e);
                }
            }

            let side = swap.side_mut(ledger).expect("side present");
            side.refund_attempted = true;
            if settled {
                side.refunded = true;
            }
            if let Some(retry_at) = retry_at {
                swap.next_attempt_ms = Some(retry_at);
                blocked = true;
            }
            if let Some(e) = action_error {
                self.handle_action_error(swap, &e.into(), now);
                return Ok(StepOutcome::Settled);
            }
        }
        swap.touch(now);

        let ours_settled = swap.sides().all(|s| {
            let ours = self.is_ours(s.ledger, &s.owner);
            !ours || s.is_terminal() || (s.refund_attempted && now > s.deadline_ms())
        });
        let attempted_everywhere = swap
            .sides()
            .all(|s| s.is_terminal() || (s.refund_attempted && now > s.deadline_ms()));

        if !blocked && ours_settled && attempted_everywhere {
            swap.clear_error();
            self.transition(swap, SwapPhase::Expired, now);
        }
        Ok(StepOutcome::Settled)
    }

    fn is_ours(&self, ledger: LedgerId, owner: &str) -> bool {
        self.port(ledger).adapter.signer_address() == owner
    }

    /// Bounded-retry bookkeeping for a failed on-chain action.
    fn handle_action_error(&self, swap: &mut Swap, error: &CoordinatorError, now: u64) {
        if !error.is_retryable() {
            self.fail(swap, &error.to_string(), error.error_code(), now);
            return;
        }
        if swap.retry_count + 1 >= self.retry.max_attempts {
            self.metrics
                .incidents
                .with_label_values(&["retries_exhausted"])
                .inc();
            self.fail(
                swap,
                &format!(
                    "retries exhausted after {} attempts: {}",
                    swap.retry_count + 1,
                    error
                ),
                "retries_exhausted",
                now,
            );
            return;
        }
        let delay = backoff_delay_ms(
            swap.retry_count,
            self.retry.base_backoff_ms,
            self.retry.max_backoff_ms,
        );
        swap.record_error(&error.to_string(), now);
        swap.next_attempt_ms = Some(now + delay);
        debug!(
            "swap {}: attempt {} failed ({}), retrying in {}ms",
            swap.id, swap.retry_count, error, delay
        );
    }

    fn transition(&self, swap: &mut Swap, to: SwapPhase, now: u64) {
        swap.phase = to;
        swap.touch(now);
    }

    fn fail(&self, swap: &mut Swap, detail: &str, code: &str, now: u64) {
        warn!("swap {} failed ({}): {}", swap.id, code, detail);
        swap.last_error = Some(detail.to_string());
        self.transition(swap, SwapPhase::Failed, now);
    }

    async fn arm_timers(&self, swap: &Swap) {
        if swap.phase.is_terminal() {
            self.timers.cancel(swap.id.clone()).await;
            return;
        }
        let mut at = swap
            .sides()
            .filter(|s| !s.is_terminal())
            .map(|s| s.deadline_ms() + DEADLINE_GRACE_MS)
            .min();
        if let Some(next) = swap.next_attempt_ms {
            at = Some(at.map_or(next, |a| a.min(next)));
        }
        if let Some(at) = at {
            self.timers.schedule(swap.id.clone(), at).await;
        }
    }

    /// Operator action: refund every still-locked side whose deadline has
    /// passed, ignoring holds and auto-policy.
    pub async fn force_refund(&self, swap_id: &SwapId) -> CoordinatorResult<Swap> {
        let now = now_ms();
        let Some(versioned) = self.store.get_swap(swap_id).await? else {
            return Err(CoordinatorError::SwapNotFound {
                swap_id: swap_id.to_string(),
            });
        };
        let mut swap = versioned.swap;
        let version = versioned.version;

        let mut refunded_any = false;
        for ledger in [LedgerId::Evm, LedgerId::Sui] {
            let Some(side) = swap.side(ledger) else { continue };
            if side.is_terminal() {
                continue;
            }
            if now <= side.deadline_ms() {
                return Err(CoordinatorError::PolicyViolation {
                    swap_id: swap_id.to_string(),
                    detail: format!(
                        "escrow {} on {} is not past its deadline",
                        side.escrow_id, ledger
                    ),
                });
            }
            let escrow_id = side.escrow_id.clone();
            let port = self.port(ledger);
            port.limiter.acquire().await;
            let result = port.adapter.refund(&escrow_id).await;
            let side = swap.side_mut(ledger).expect("side present");
            side.refund_attempted = true;
            match result {
                Ok(_) | Err(AdapterError::AlreadyProcessed) => {
                    side.refunded = true;
                    refunded_any = true;
                }
                Err(AdapterError::NotFound(_)) => {
                    side.refunded = true;
                }
                Err(e) => {
                    warn!("force-refund of {} on {} failed: {}", escrow_id, ledger, e);
                }
            }
        }

        if refunded_any && !swap.phase.is_terminal() && swap.sides().all(|s| s.is_terminal()) {
            self.transition(&mut swap, SwapPhase::Expired, now);
        }
        swap.touch(now);
        match self.store.put_swap(&swap, Some(version)).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                // Concurrent progress; the operator can re-issue.
                self.metrics
                    .version_conflicts
                    .with_label_values(&["operator"])
                    .inc();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(swap)
    }

    /// Retention sweep for terminal swaps.
    pub async fn purge_retired(&self) -> CoordinatorResult<usize> {
        let horizon = now_ms().saturating_sub(self.retention_ms);
        Ok(self.store.purge_terminal_before(horizon).await?)
    }

    /// Refresh the per-phase gauge from the store.
    pub async fn refresh_phase_gauges(&self) -> CoordinatorResult<()> {
        let swaps = self.store.all_swaps().await?;
        for phase in SwapPhase::all() {
            let count = swaps.iter().filter(|v| v.swap.phase == phase).count();
            self.metrics
                .swaps_by_phase
                .with_label_values(&[phase.as_str()])
                .set(count as i64);
        }
        Ok(())
    }
}

#[async_trait]
impl SwapProcessor for SwapEngine {
    async fn process(&self, signal: SwapSignal) {
        debug!(
            "evaluating swap {} ({})",
            signal.swap_id,
            signal.reason.as_str()
        );
        if let Err(e) = self.evaluate(&signal.swap_id).await {
            warn!("evaluation of swap {} failed: {}", signal.swap_id, e);
        }
    }
}
