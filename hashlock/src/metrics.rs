// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120., 300.,
];

#[derive(Clone, Debug)]
pub struct CoordinatorMetrics {
    /// Escrow events accepted per ledger and kind.
    pub(crate) events_received: IntCounterVec,
    /// Events skipped because they were already recorded.
    pub(crate) events_deduplicated: IntCounterVec,
    /// Cursor rewinds after deep reorgs, per ledger.
    pub(crate) cursor_rewinds: IntCounterVec,
    /// Last ingested height per ledger.
    pub(crate) cursor_height: IntGaugeVec,
    /// Last finalized height reported by the adapter, per ledger.
    pub(crate) finalized_height: IntGaugeVec,

    /// Swap count per phase, refreshed on evaluation.
    pub(crate) swaps_by_phase: IntGaugeVec,
    /// State transitions, labelled from/to.
    pub(crate) swap_transitions: IntCounterVec,
    /// Swaps put on hold for operator attention, by reason.
    pub(crate) swaps_on_hold: IntCounterVec,
    /// Incidents opened (invalid secret, retries exhausted), by code.
    pub(crate) incidents: IntCounterVec,

    /// On-chain submissions per ledger and action.
    pub(crate) submissions: IntCounterVec,
    /// Submission failures per ledger, action and error code.
    pub(crate) submission_errors: IntCounterVec,
    /// Submission latency per ledger and action.
    pub(crate) submission_latency: HistogramVec,
    /// Store version conflicts resolved by reload.
    pub(crate) version_conflicts: IntCounterVec,

    /// Ledger connectivity as seen by the last health probe.
    pub(crate) ledger_connected: IntGaugeVec,
    pub(crate) uptime_seconds: IntGauge,
}

impl CoordinatorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_received: register_int_counter_vec_with_registry!(
                "hashlock_events_received",
                "Escrow events accepted, by ledger and kind",
                &["ledger", "kind"],
                registry,
            )
            .unwrap(),
            events_deduplicated: register_int_counter_vec_with_registry!(
                "hashlock_events_deduplicated",
                "Escrow events skipped as already recorded, by ledger",
                &["ledger"],
                registry,
            )
            .unwrap(),
            cursor_rewinds: register_int_counter_vec_with_registry!(
                "hashlock_cursor_rewinds",
                "Cursor rewinds after deep reorgs, by ledger",
                &["ledger"],
                registry,
            )
            .unwrap(),
            cursor_height: register_int_gauge_vec_with_registry!(
                "hashlock_cursor_height",
                "Last ingested height, by ledger",
                &["ledger"],
                registry,
            )
            .unwrap(),
            finalized_height: register_int_gauge_vec_with_registry!(
                "hashlock_finalized_height",
                "Last finalized height reported by the adapter, by ledger",
                &["ledger"],
                registry,
            )
            .unwrap(),
            swaps_by_phase: register_int_gauge_vec_with_registry!(
                "hashlock_swaps_by_phase",
                "Number of swaps per phase",
                &["phase"],
                registry,
            )
            .unwrap(),
            swap_transitions: register_int_counter_vec_with_registry!(
                "hashlock_swap_transitions",
                "Swap phase transitions",
                &["from", "to"],
                registry,
            )
            .unwrap(),
            swaps_on_hold: register_int_counter_vec_with_registry!(
                "hashlock_swaps_on_hold",
                "Swaps excluded from automated progression, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            incidents: register_int_counter_vec_with_registry!(
                "hashlock_incidents",
                "Incidents requiring operator attention, by code",
                &["code"],
                registry,
            )
            .unwrap(),
            submissions: register_int_counter_vec_with_registry!(
                "hashlock_submissions",
                "On-chain submissions, by ledger and action",
                &["ledger", "action"],
                registry,
            )
            .unwrap(),
            submission_errors: register_int_counter_vec_with_registry!(
                "hashlock_submission_errors",
                "Failed on-chain submissions, by ledger, action and error code",
                &["ledger", "action", "code"],
                registry,
            )
            .unwrap(),
            submission_latency: register_histogram_vec_with_registry!(
                "hashlock_submission_latency_seconds",
                "Submission latency, by ledger and action",
                &["ledger", "action"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            version_conflicts: register_int_counter_vec_with_registry!(
                "hashlock_version_conflicts",
                "Store version conflicts resolved by reload, by component",
                &["component"],
                registry,
            )
            .unwrap(),
            ledger_connected: register_int_gauge_vec_with_registry!(
                "hashlock_ledger_connected",
                "1 when the last health probe reached the ledger",
                &["ledger"],
                registry,
            )
            .unwrap(),
            uptime_seconds: register_int_gauge_with_registry!(
                "hashlock_uptime_seconds",
                "Seconds since the coordinator started",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}
