// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core data model: ledgers, escrows, swaps, reveals, canonical escrow
//! events and cursors.

use crate::crypto::{HashAlgorithm, Secret, SecretDigest};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const BASIS_POINTS: u64 = 10_000;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// The two ledgers a swap spans. `Evm` is the account/contract-style A-chain,
/// `Sui` the object-style B-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerId {
    Evm,
    Sui,
}

impl LedgerId {
    pub fn other(&self) -> LedgerId {
        match self {
            LedgerId::Evm => LedgerId::Sui,
            LedgerId::Sui => LedgerId::Evm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerId::Evm => "evm",
            LedgerId::Sui => "sui",
        }
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerId::Evm => write!(f, "EVM"),
            LedgerId::Sui => write!(f, "SUI"),
        }
    }
}

/// Opaque escrow identity: a contract address on the EVM side, an object id
/// on the object side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscrowId(pub String);

impl EscrowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction reference on a ledger (hash or digest string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where on a ledger an event was observed. `(ledger, tx_ref, event_index)`
/// is the downstream dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    pub tx_ref: TxRef,
    pub block_height: u64,
    pub event_index: u32,
}

/// Per-ledger ingestion cursor. Monotone non-decreasing; persisted before
/// events are acknowledged downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EventCursor {
    pub height: u64,
    pub index: u32,
}

impl EventCursor {
    pub fn new(height: u64, index: u32) -> Self {
        Self { height, index }
    }

    /// Cursor positioned just after an event at `position`.
    pub fn after(position: &EventPosition) -> Self {
        Self {
            height: position.block_height,
            index: position.event_index + 1,
        }
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.index)
    }
}

/// Escrow creation observed on a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowCreated {
    pub ledger: LedgerId,
    pub escrow_id: EscrowId,
    pub digest: SecretDigest,
    pub algorithm: HashAlgorithm,
    pub owner: String,
    pub beneficiary: String,
    pub token: String,
    pub amount: u128,
    pub start_ms: u64,
    pub lock_duration_ms: u64,
    pub position: EventPosition,
}

impl EscrowCreated {
    pub fn deadline_ms(&self) -> u64 {
        self.start_ms + self.lock_duration_ms
    }
}

/// Withdrawal observed on a ledger; carries the revealed preimage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowWithdrawn {
    pub ledger: LedgerId,
    pub escrow_id: EscrowId,
    pub digest: SecretDigest,
    pub caller: String,
    pub secret: Secret,
    pub position: EventPosition,
}

/// Refund observed on a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRefunded {
    pub ledger: LedgerId,
    pub escrow_id: EscrowId,
    pub digest: SecretDigest,
    pub owner: String,
    pub position: EventPosition,
}

/// Canonical escrow lifecycle event, one closed type per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EscrowEvent {
    Created(EscrowCreated),
    Withdrawn(EscrowWithdrawn),
    Refunded(EscrowRefunded),
}

impl EscrowEvent {
    pub fn ledger(&self) -> LedgerId {
        match self {
            EscrowEvent::Created(e) => e.ledger,
            EscrowEvent::Withdrawn(e) => e.ledger,
            EscrowEvent::Refunded(e) => e.ledger,
        }
    }

    pub fn escrow_id(&self) -> &EscrowId {
        match self {
            EscrowEvent::Created(e) => &e.escrow_id,
            EscrowEvent::Withdrawn(e) => &e.escrow_id,
            EscrowEvent::Refunded(e) => &e.escrow_id,
        }
    }

    pub fn digest(&self) -> &SecretDigest {
        match self {
            EscrowEvent::Created(e) => &e.digest,
            EscrowEvent::Withdrawn(e) => &e.digest,
            EscrowEvent::Refunded(e) => &e.digest,
        }
    }

    pub fn position(&self) -> &EventPosition {
        match self {
            EscrowEvent::Created(e) => &e.position,
            EscrowEvent::Withdrawn(e) => &e.position,
            EscrowEvent::Refunded(e) => &e.position,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EscrowEvent::Created(_) => "created",
            EscrowEvent::Withdrawn(_) => "withdrawn",
            EscrowEvent::Refunded(_) => "refunded",
        }
    }

    /// Store key for exactly-once processing.
    pub fn dedup_key(&self) -> String {
        let p = self.position();
        format!("{}:{}:{}", self.ledger().as_str(), p.tx_ref, p.event_index)
    }
}

/// Swap identity. Content-addressed from the shared commitment so that both
/// ledgers' events resolve to the same swap, or caller-supplied for
/// operator-created swaps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapId(pub String);

impl SwapId {
    /// Derive the canonical id for a digest/algorithm commitment. Pure
    /// function of its inputs.
    pub fn derive(digest: &SecretDigest, algorithm: HashAlgorithm) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"hashlock-swap-v1");
        hasher.update([algorithm.flag()]);
        hasher.update(digest.0);
        let out = hasher.finalize();
        SwapId(hex::encode(&out[..16]))
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        SwapId(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a side within a swap. The initiator's deadline is the later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapRole {
    Initiator,
    Counterparty,
}

/// Coordinator-visible swap lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapPhase {
    Pending,
    OneSideLocked,
    BothLocked,
    Revealed,
    Completed,
    Expired,
    Failed,
}

impl SwapPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapPhase::Completed | SwapPhase::Expired | SwapPhase::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapPhase::Pending => "pending",
            SwapPhase::OneSideLocked => "one_side_locked",
            SwapPhase::BothLocked => "both_locked",
            SwapPhase::Revealed => "revealed",
            SwapPhase::Completed => "completed",
            SwapPhase::Expired => "expired",
            SwapPhase::Failed => "failed",
        }
    }

    pub fn all() -> [SwapPhase; 7] {
        [
            SwapPhase::Pending,
            SwapPhase::OneSideLocked,
            SwapPhase::BothLocked,
            SwapPhase::Revealed,
            SwapPhase::Completed,
            SwapPhase::Expired,
            SwapPhase::Failed,
        ]
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a swap is excluded from automated progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    /// More than one valid pairing candidate shares the digest, or the
    /// candidates do not form a valid cross-ledger pair.
    AmbiguousPairing,
}

/// One side of a swap: a single escrow and everything the coordinator knows
/// about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowSide {
    pub ledger: LedgerId,
    pub escrow_id: EscrowId,
    pub owner: String,
    pub beneficiary: String,
    pub token: String,
    pub amount: u128,
    pub start_ms: u64,
    pub lock_duration_ms: u64,
    pub withdrawn: bool,
    pub refunded: bool,
    /// Set once a withdrawal on this side revealed the preimage.
    pub revealed_secret: Option<Secret>,
    /// Recorded when this coordinator submitted a refund for this side.
    pub refund_attempted: bool,
}

impl EscrowSide {
    pub fn from_created(event: &EscrowCreated) -> Self {
        Self {
            ledger: event.ledger,
            escrow_id: event.escrow_id.clone(),
            owner: event.owner.clone(),
            beneficiary: event.beneficiary.clone(),
            token: event.token.clone(),
            amount: event.amount,
            start_ms: event.start_ms,
            lock_duration_ms: event.lock_duration_ms,
            withdrawn: false,
            refunded: false,
            revealed_secret: None,
            refund_attempted: false,
        }
    }

    pub fn deadline_ms(&self) -> u64 {
        self.start_ms + self.lock_duration_ms
    }

    /// Terminal flags are mutually exclusive and monotone.
    pub fn is_terminal(&self) -> bool {
        self.withdrawn || self.refunded
    }
}

/// The coordinator's unit of work: a pair of escrows bound by one
/// commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub digest: SecretDigest,
    pub algorithm: HashAlgorithm,
    pub phase: SwapPhase,
    pub evm_side: Option<EscrowSide>,
    pub sui_side: Option<EscrowSide>,
    pub hold: Option<HoldReason>,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Earliest time the engine should re-evaluate this swap after a
    /// retryable failure.
    pub next_attempt_ms: Option<u64>,
}

impl Swap {
    pub fn new(id: SwapId, digest: SecretDigest, algorithm: HashAlgorithm, now: u64) -> Self {
        Self {
            id,
            digest,
            algorithm,
            phase: SwapPhase::Pending,
            evm_side: None,
            sui_side: None,
            hold: None,
            created_ms: now,
            updated_ms: now,
            last_error: None,
            retry_count: 0,
            next_attempt_ms: None,
        }
    }

    pub fn side(&self, ledger: LedgerId) -> Option<&EscrowSide> {
        match ledger {
            LedgerId::Evm => self.evm_side.as_ref(),
            LedgerId::Sui => self.sui_side.as_ref(),
        }
    }

    pub fn side_mut(&mut self, ledger: LedgerId) -> Option<&mut EscrowSide> {
        match ledger {
            LedgerId::Evm => self.evm_side.as_mut(),
            LedgerId::Sui => self.sui_side.as_mut(),
        }
    }

    pub fn set_side(&mut self, side: EscrowSide) {
        match side.ledger {
            LedgerId::Evm => self.evm_side = Some(side),
            LedgerId::Sui => self.sui_side = Some(side),
        }
    }

    pub fn sides(&self) -> impl Iterator<Item = &EscrowSide> {
        self.evm_side.iter().chain(self.sui_side.iter())
    }

    pub fn both_locked(&self) -> bool {
        self.evm_side.is_some() && self.sui_side.is_some()
    }

    /// Earliest deadline across known sides, if any.
    pub fn earliest_deadline_ms(&self) -> Option<u64> {
        self.sides().map(|s| s.deadline_ms()).min()
    }

    pub fn latest_deadline_ms(&self) -> Option<u64> {
        self.sides().map(|s| s.deadline_ms()).max()
    }

    /// The side whose deadline is later carries the initiator role.
    pub fn role_of(&self, ledger: LedgerId) -> Option<SwapRole> {
        let this = self.side(ledger)?;
        let other = self.side(ledger.other())?;
        if this.deadline_ms() >= other.deadline_ms() {
            Some(SwapRole::Initiator)
        } else {
            Some(SwapRole::Counterparty)
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.updated_ms = now;
    }

    pub fn record_error(&mut self, error: &str, now: u64) {
        self.last_error = Some(error.to_string());
        self.retry_count += 1;
        self.updated_ms = now;
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.retry_count = 0;
        self.next_attempt_ms = None;
    }
}

/// A preimage reveal observed on-chain, bound to its swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reveal {
    pub swap_id: SwapId,
    pub digest: SecretDigest,
    pub secret: Secret,
    pub source_ledger: LedgerId,
    pub source_tx_ref: TxRef,
    pub observed_ms: u64,
}

/// Resolver stake recorded at registration time. Opaque precondition; the
/// coordinator never re-checks it after registration succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeRecord {
    pub ledger: LedgerId,
    pub amount: u128,
    pub tx_ref: Option<TxRef>,
    pub registered_ms: u64,
}

/// Split `amount` into `(net, fee)` at `fee_bps` basis points. No unit is
/// lost: `net + fee == amount`.
pub fn split_fee(amount: u128, fee_bps: u16) -> (u128, u128) {
    debug_assert!(fee_bps as u64 <= BASIS_POINTS);
    let net = amount * (BASIS_POINTS - fee_bps as u64) as u128 / BASIS_POINTS as u128;
    (net, amount - net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn digest_of(byte: u8) -> SecretDigest {
        SecretDigest([byte; 32])
    }

    #[test]
    fn test_swap_id_is_deterministic() {
        let d = digest_of(0xab);
        let a = SwapId::derive(&d, HashAlgorithm::Sha256);
        let b = SwapId::derive(&d, HashAlgorithm::Sha256);
        assert_eq!(a, b);
        // Algorithm participates in the identity.
        let c = SwapId::derive(&d, HashAlgorithm::Keccak256);
        assert_ne!(a, c);
        // And so does the digest.
        let e = SwapId::derive(&digest_of(0xac), HashAlgorithm::Sha256);
        assert_ne!(a, e);
    }

    #[test]
    fn test_cursor_ordering() {
        let a = EventCursor::new(10, 0);
        let b = EventCursor::new(10, 3);
        let c = EventCursor::new(11, 0);
        assert!(a < b && b < c);

        let position = EventPosition {
            tx_ref: TxRef("0xaa".into()),
            block_height: 10,
            event_index: 3,
        };
        assert_eq!(EventCursor::after(&position), EventCursor::new(10, 4));
    }

    #[test]
    fn test_role_assignment_by_deadline() {
        let secret = Secret([9u8; 32]);
        let d = crypto::digest(&secret, HashAlgorithm::Sha256);
        let mut swap = Swap::new(
            SwapId::derive(&d, HashAlgorithm::Sha256),
            d,
            HashAlgorithm::Sha256,
            0,
        );
        swap.set_side(EscrowSide {
            ledger: LedgerId::Evm,
            escrow_id: EscrowId("0x1".into()),
            owner: "alice".into(),
            beneficiary: "resolver".into(),
            token: "USDT".into(),
            amount: 1000,
            start_ms: 0,
            lock_duration_ms: 10_800_000,
            withdrawn: false,
            refunded: false,
            revealed_secret: None,
            refund_attempted: false,
        });
        swap.set_side(EscrowSide {
            ledger: LedgerId::Sui,
            escrow_id: EscrowId("0x2".into()),
            owner: "resolver".into(),
            beneficiary: "alice".into(),
            token: "WSUI".into(),
            amount: 1_000_000_000,
            start_ms: 0,
            lock_duration_ms: 9_000_000,
            withdrawn: false,
            refunded: false,
            revealed_secret: None,
            refund_attempted: false,
        });
        assert_eq!(swap.role_of(LedgerId::Evm), Some(SwapRole::Initiator));
        assert_eq!(swap.role_of(LedgerId::Sui), Some(SwapRole::Counterparty));
        assert_eq!(swap.earliest_deadline_ms(), Some(9_000_000));
        assert_eq!(swap.latest_deadline_ms(), Some(10_800_000));
    }

    #[test]
    fn test_phase_terminality() {
        assert!(SwapPhase::Completed.is_terminal());
        assert!(SwapPhase::Expired.is_terminal());
        assert!(SwapPhase::Failed.is_terminal());
        assert!(!SwapPhase::Revealed.is_terminal());
        assert!(!SwapPhase::Pending.is_terminal());
    }

    #[test]
    fn test_split_fee_loses_nothing() {
        for (amount, bps) in [
            (0u128, 0u16),
            (1, 1),
            (999, 30),
            (1_000_000_000, 25),
            (u64::MAX as u128, 9_999),
            (12345, 10_000),
        ] {
            let (net, fee) = split_fee(amount, bps);
            assert_eq!(net + fee, amount, "amount={} bps={}", amount, bps);
            if bps == 0 {
                assert_eq!(fee, 0);
            }
            if bps == 10_000 {
                assert_eq!(net, 0);
            }
        }
        // floor semantics: 999 * 9970 / 10000 = 996.003 -> 996
        let (net, fee) = split_fee(999, 30);
        assert_eq!(net, 996);
        assert_eq!(fee, 3);
    }

    #[test]
    fn test_event_dedup_key() {
        let event = EscrowEvent::Refunded(EscrowRefunded {
            ledger: LedgerId::Sui,
            escrow_id: EscrowId("0xdead".into()),
            digest: digest_of(1),
            owner: "bob".into(),
            position: EventPosition {
                tx_ref: TxRef("0xbeef".into()),
                block_height: 42,
                event_index: 2,
            },
        });
        assert_eq!(event.dedup_key(), "sui:0xbeef:2");
        assert_eq!(event.kind(), "refunded");
    }
}
