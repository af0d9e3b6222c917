// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for unit and scenario tests.

use crate::crypto::{HashAlgorithm, Secret, SecretDigest};
use crate::types::{
    now_ms, EscrowCreated, EscrowEvent, EscrowId, EscrowRefunded, EscrowSide, EscrowWithdrawn,
    EventPosition, LedgerId, Swap, SwapId, TxRef,
};

pub fn position(ledger: LedgerId, height: u64, index: u32) -> EventPosition {
    EventPosition {
        tx_ref: TxRef(format!("0x{}tx{}-{}", ledger.as_str(), height, index)),
        block_height: height,
        event_index: index,
    }
}

/// A Created event with mainnet-shaped defaults: the EVM side carries the
/// longer (source) lock, the object side the shorter (destination) lock.
pub fn created_event(
    ledger: LedgerId,
    escrow_id: &str,
    digest: &SecretDigest,
    height: u64,
    index: u32,
) -> EscrowEvent {
    let (owner, beneficiary, token, amount, lock_duration_ms) = match ledger {
        LedgerId::Evm => (
            "0xalice",
            "0xresolver",
            "0xtoken",
            1_000u128,
            3 * 60 * 60 * 1000,
        ),
        LedgerId::Sui => (
            "0xresolver-sui",
            "0xalice-sui",
            "0x2::wsui::WSUI",
            1_000_000_000u128,
            (3 * 60 * 60 - 40 * 60) * 1000,
        ),
    };
    EscrowEvent::Created(EscrowCreated {
        ledger,
        escrow_id: EscrowId(escrow_id.to_string()),
        digest: *digest,
        algorithm: HashAlgorithm::Sha256,
        owner: owner.to_string(),
        beneficiary: beneficiary.to_string(),
        token: token.to_string(),
        amount,
        start_ms: now_ms(),
        lock_duration_ms,
        position: position(ledger, height, index),
    })
}

pub fn withdrawn_event(
    ledger: LedgerId,
    escrow_id: &str,
    digest: &SecretDigest,
    secret: &Secret,
    height: u64,
    index: u32,
) -> EscrowEvent {
    EscrowEvent::Withdrawn(EscrowWithdrawn {
        ledger,
        escrow_id: EscrowId(escrow_id.to_string()),
        digest: *digest,
        caller: "0xclaimer".to_string(),
        secret: *secret,
        position: position(ledger, height, index),
    })
}

pub fn refunded_event(
    ledger: LedgerId,
    escrow_id: &str,
    digest: &SecretDigest,
    height: u64,
    index: u32,
) -> EscrowEvent {
    EscrowEvent::Refunded(EscrowRefunded {
        ledger,
        escrow_id: EscrowId(escrow_id.to_string()),
        digest: *digest,
        owner: "0xowner".to_string(),
        position: position(ledger, height, index),
    })
}

pub struct SideSpec {
    pub ledger: LedgerId,
    pub escrow_id: &'static str,
    pub owner: &'static str,
    pub beneficiary: &'static str,
    pub amount: u128,
    pub start_ms: u64,
    pub lock_duration_ms: u64,
}

pub fn side_from_spec(spec: &SideSpec) -> EscrowSide {
    EscrowSide {
        ledger: spec.ledger,
        escrow_id: EscrowId(spec.escrow_id.to_string()),
        owner: spec.owner.to_string(),
        beneficiary: spec.beneficiary.to_string(),
        token: match spec.ledger {
            LedgerId::Evm => "0xtoken".to_string(),
            LedgerId::Sui => "0x2::wsui::WSUI".to_string(),
        },
        amount: spec.amount,
        start_ms: spec.start_ms,
        lock_duration_ms: spec.lock_duration_ms,
        withdrawn: false,
        refunded: false,
        revealed_secret: None,
        refund_attempted: false,
    }
}

/// A paired swap for engine tests. The EVM side is the initiator (longer
/// deadline), the object side the counterparty.
pub fn paired_swap(secret: &Secret, start_ms: u64) -> Swap {
    let digest = crate::crypto::digest(secret, HashAlgorithm::Sha256);
    let mut swap = Swap::new(
        SwapId::derive(&digest, HashAlgorithm::Sha256),
        digest,
        HashAlgorithm::Sha256,
        start_ms,
    );
    swap.set_side(side_from_spec(&SideSpec {
        ledger: LedgerId::Evm,
        escrow_id: "0xescrow-a",
        owner: "0xalice",
        beneficiary: "evm-resolver",
        amount: 1_000,
        start_ms,
        lock_duration_ms: 3 * 60 * 60 * 1000,
    }));
    swap.set_side(side_from_spec(&SideSpec {
        ledger: LedgerId::Sui,
        escrow_id: "0xescrow-b",
        owner: "sui-resolver",
        beneficiary: "0xalice-sui",
        amount: 1_000_000_000,
        start_ms,
        lock_duration_ms: (3 * 60 * 60 - 40 * 60) * 1000,
    }));
    swap
}
