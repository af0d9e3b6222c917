// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Top-level coordinator error. Every variant maps to a stable snake_case
/// code via [`CoordinatorError::error_code`]; those codes are used as metric
/// labels and in operator-facing output, so they must not change.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("hex decoding failed: {0}")]
    InvalidHex(String),

    #[error("unsupported hash algorithm flag: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("ledger adapter error: {0}")]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("ambiguous escrow pairing for digest {digest}: {detail}")]
    AmbiguousPairing { digest: String, detail: String },

    #[error("swap {swap_id} violates policy: {detail}")]
    PolicyViolation { swap_id: String, detail: String },

    #[error("swap {swap_id}: revealed secret does not match the committed digest")]
    RevealMismatch { swap_id: String },

    #[error("swap {swap_id} not found")]
    SwapNotFound { swap_id: String },

    #[error("swap {swap_id} requires operator intervention: {detail}")]
    OperatorRequired { swap_id: String, detail: String },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Stable code for metrics labels (lowercase, underscores only).
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidConfig(_) => "invalid_config",
            CoordinatorError::InvalidHex(_) => "invalid_hex",
            CoordinatorError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            CoordinatorError::Adapter(e) => e.error_code(),
            CoordinatorError::Store(e) => e.error_code(),
            CoordinatorError::AmbiguousPairing { .. } => "ambiguous_pairing",
            CoordinatorError::PolicyViolation { .. } => "policy_violation",
            CoordinatorError::RevealMismatch { .. } => "reveal_mismatch",
            CoordinatorError::SwapNotFound { .. } => "swap_not_found",
            CoordinatorError::OperatorRequired { .. } => "operator_required",
            CoordinatorError::RetriesExhausted { .. } => "retries_exhausted",
            CoordinatorError::ShuttingDown => "shutting_down",
            CoordinatorError::Internal(_) => "internal_error",
        }
    }

    /// Whether a bounded retry of the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Adapter(e) => e.is_retryable(),
            CoordinatorError::Store(e) => e.is_retryable(),
            CoordinatorError::Internal(_) => true,
            _ => false,
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
