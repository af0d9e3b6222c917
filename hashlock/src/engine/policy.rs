// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pairing policy: what the coordinator is willing to progress
//! automatically, and how failed actions back off.

use crate::config::{NodeConfig, TimeoutProfile};
use crate::types::{EscrowSide, Swap};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct SwapPolicy {
    pub safety_margin_ms: u64,
    pub min_timeout_ms: u64,
    pub min_amount: u128,
}

impl SwapPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        let profile: TimeoutProfile = config.timeout_profile();
        Self {
            safety_margin_ms: profile.safety_margin_ms,
            min_timeout_ms: profile.min_timeout_ms,
            min_amount: config.min_swap_amount,
        }
    }

    /// Checks a single escrow against policy. Violations are permanent;
    /// the swap fails rather than retries.
    pub fn check_side(&self, side: &EscrowSide) -> Result<(), String> {
        if side.amount < self.min_amount {
            return Err(format!(
                "amount {} below minimum {} on {}",
                side.amount, self.min_amount, side.ledger
            ));
        }
        if side.lock_duration_ms < self.min_timeout_ms {
            return Err(format!(
                "lock duration {}ms below minimum {}ms on {}",
                side.lock_duration_ms, self.min_timeout_ms, side.ledger
            ));
        }
        Ok(())
    }

    /// Checks the cross-ledger timelock relationship once both escrows are
    /// known: deadlines must differ by at least the safety margin so the
    /// short side's claimer can react to a reveal before its own lock
    /// expires.
    pub fn check_pair(&self, swap: &Swap) -> Result<(), String> {
        let (Some(evm), Some(sui)) = (&swap.evm_side, &swap.sui_side) else {
            return Err("pair check requires both sides".into());
        };
        let a = evm.deadline_ms();
        let b = sui.deadline_ms();
        let gap = a.abs_diff(b);
        if gap < self.safety_margin_ms {
            return Err(format!(
                "deadline gap {}ms below safety margin {}ms",
                gap, self.safety_margin_ms
            ));
        }
        Ok(())
    }
}

/// Exponential backoff with ±25% jitter, base 2, capped.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = attempt.min(32);
    let raw = base_ms.saturating_mul(1u64 << exp.min(20)).min(max_ms);
    let jitter_span = raw / 4;
    if jitter_span == 0 {
        return raw.max(1);
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_span * 2);
    (raw - jitter_span + jitter).min(max_ms).max(1)
}
