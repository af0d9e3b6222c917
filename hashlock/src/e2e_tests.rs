// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios against the fully wired coordinator on in-memory
//! adapters. Each test drives on-chain history through the mock adapters'
//! event pages and observes the store.

use crate::adapter::mock::MockChainAdapter;
use crate::adapter::{AdapterError, ChainAdapter, EscrowSnapshot};
use crate::config::NodeConfig;
use crate::crypto::{self, HashAlgorithm, Secret, SecretDigest};
use crate::engine::SwapEngine;
use crate::node::start_with_parts;
use crate::scheduler::{RateLimiter, Scheduler};
use crate::store::{MemoryStore, SledStore, SwapStore};
use crate::test_utils::{created_event, withdrawn_event};
use crate::types::{now_ms, EscrowId, EventCursor, LedgerId, Swap, SwapId, SwapPhase};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> NodeConfig {
    let yaml = r#"
network: devnet
store-path: /tmp/unused
ops-port: 0
evm:
  rpc-url: http://localhost:8545
  escrow-registry-address: "0xaa"
  key-ref: /tmp/k
  poll-interval-ms: 20
  rate-limit-rps: 1000
sui:
  rpc-url: http://localhost:9000
  escrow-registry-object: "0xbb"
  key-ref: "0xcc"
  poll-interval-ms: 20
  rate-limit-rps: 1000
retry:
  max-attempts: 4
  base-backoff-ms: 20
  max-backoff-ms: 200
"#;
    serde_yaml::from_str(yaml).unwrap()
}

struct Net {
    evm: Arc<MockChainAdapter>,
    sui: Arc<MockChainAdapter>,
}

impl Net {
    fn new() -> Self {
        Self {
            evm: Arc::new(MockChainAdapter::new(LedgerId::Evm).with_signer("evm-resolver")),
            sui: Arc::new(MockChainAdapter::new(LedgerId::Sui).with_signer("sui-resolver")),
        }
    }

    /// Seed both ledgers with a locked pair for `digest` and emit the
    /// Created events. `evm_start/sui_start` place the deadlines.
    fn lock_pair(&self, digest: &SecretDigest, evm_start: u64, sui_start: u64) {
        let mut evm_event = created_event(LedgerId::Evm, "0xescrow-a", digest, 100, 0);
        let mut sui_event = created_event(LedgerId::Sui, "0xobj-b", digest, 200, 0);
        let (evm_duration, sui_duration) = (600_000, 300_000);
        if let crate::types::EscrowEvent::Created(c) = &mut evm_event {
            c.start_ms = evm_start;
            c.lock_duration_ms = evm_duration;
            c.beneficiary = "evm-resolver".into();
        }
        if let crate::types::EscrowEvent::Created(c) = &mut sui_event {
            c.start_ms = sui_start;
            c.lock_duration_ms = sui_duration;
            c.owner = "sui-resolver".into();
        }

        for (adapter, event) in [(&self.evm, &evm_event), (&self.sui, &sui_event)] {
            if let crate::types::EscrowEvent::Created(c) = event {
                adapter.add_escrow(EscrowSnapshot {
                    escrow_id: c.escrow_id.clone(),
                    owner: c.owner.clone(),
                    beneficiary: c.beneficiary.clone(),
                    token: c.token.clone(),
                    amount: c.amount,
                    digest: c.digest,
                    algorithm: c.algorithm,
                    start_ms: c.start_ms,
                    lock_duration_ms: c.lock_duration_ms,
                    withdrawn: false,
                    refunded: false,
                    revealed_secret: None,
                });
            }
            adapter.push_event_page(vec![event.clone()]);
        }
    }
}

async fn wait_for_phase(
    store: &Arc<dyn SwapStore>,
    swap_id: &SwapId,
    phase: SwapPhase,
    timeout: Duration,
) -> Swap {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(v)) = store.get_swap(swap_id).await {
            if v.swap.phase == phase {
                return v.swap;
            }
        }
        if tokio::time::Instant::now() > deadline {
            let found = store.get_swap(swap_id).await.unwrap();
            panic!("swap never reached {phase:?}; current: {found:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn swap_id_for(digest: &SecretDigest) -> SwapId {
    SwapId::derive(digest, HashAlgorithm::Sha256)
}

#[tokio::test]
async fn test_s1_happy_path_reveal_propagates() {
    let net = Net::new();
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let secret = Secret([0x41; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
    let now = now_ms();
    net.lock_pair(&digest, now, now);

    let node = start_with_parts(
        test_config(),
        store.clone(),
        net.evm.clone(),
        net.sui.clone(),
        prometheus::Registry::new(),
    )
    .await
    .unwrap();

    let swap_id = swap_id_for(&digest);
    wait_for_phase(&store, &swap_id, SwapPhase::BothLocked, Duration::from_secs(3)).await;

    // Alice claims the object-side escrow, revealing the preimage.
    net.sui
        .externally_withdraw(&EscrowId("0xobj-b".into()), secret);
    net.sui.push_event_page(vec![withdrawn_event(
        LedgerId::Sui,
        "0xobj-b",
        &digest,
        &secret,
        210,
        0,
    )]);

    let swap = wait_for_phase(&store, &swap_id, SwapPhase::Completed, Duration::from_secs(5)).await;
    assert!(swap.sides().all(|s| s.withdrawn));
    // The coordinator drove the complementary withdraw with the revealed
    // secret.
    let calls = net.evm.withdraw_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, secret);
    // And the reveal was recorded with its on-chain provenance.
    let reveal = store.get_reveal(&swap_id).await.unwrap().unwrap();
    assert_eq!(reveal.source_ledger, LedgerId::Sui);
    assert_eq!(reveal.secret, secret);

    node.stop().await;
}

#[tokio::test]
async fn test_s2_no_reveal_both_sides_refund() {
    let net = Net::new();
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let secret = Secret([0x42; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);

    // Both locks are already past their deadlines, two minutes apart to
    // satisfy the safety margin.
    let now = now_ms();
    net.lock_pair(&digest, now - 600_000 - 10_000, now - 300_000 - 130_000);

    // Record both locks before the engine runs so the pairing is complete
    // when expiry handling starts.
    {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let correlator = crate::correlator::Correlator::new(
            store.clone(),
            tx,
            Arc::new(crate::metrics::CoordinatorMetrics::new_for_testing()),
        );
        let mut evm_event = created_event(LedgerId::Evm, "0xescrow-a", &digest, 100, 0);
        let mut sui_event = created_event(LedgerId::Sui, "0xobj-b", &digest, 200, 0);
        if let crate::types::EscrowEvent::Created(c) = &mut evm_event {
            c.start_ms = now - 600_000 - 10_000;
            c.lock_duration_ms = 600_000;
        }
        if let crate::types::EscrowEvent::Created(c) = &mut sui_event {
            c.start_ms = now - 300_000 - 130_000;
            c.lock_duration_ms = 300_000;
            c.owner = "sui-resolver".into();
        }
        correlator
            .apply_event(&evm_event, EventCursor::new(100, 1))
            .await
            .unwrap();
        correlator
            .apply_event(&sui_event, EventCursor::new(200, 1))
            .await
            .unwrap();
    }

    let node = start_with_parts(
        test_config(),
        store.clone(),
        net.evm.clone(),
        net.sui.clone(),
        prometheus::Registry::new(),
    )
    .await
    .unwrap();

    let swap_id = swap_id_for(&digest);
    let swap = wait_for_phase(&store, &swap_id, SwapPhase::Expired, Duration::from_secs(5)).await;
    assert!(swap.sides().all(|s| s.refunded && !s.withdrawn));
    assert!(!net.evm.refund_calls().is_empty());
    assert!(!net.sui.refund_calls().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_s3_reveal_race_already_processed_still_completes() {
    let net = Net::new();
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let secret = Secret([0x43; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
    let now = now_ms();
    net.lock_pair(&digest, now, now);

    let node = start_with_parts(
        test_config(),
        store.clone(),
        net.evm.clone(),
        net.sui.clone(),
        prometheus::Registry::new(),
    )
    .await
    .unwrap();

    let swap_id = swap_id_for(&digest);
    wait_for_phase(&store, &swap_id, SwapPhase::BothLocked, Duration::from_secs(3)).await;

    // Someone else wins the complementary withdraw; our submit reports
    // AlreadyProcessed.
    net.evm
        .push_withdraw_result(Err(AdapterError::AlreadyProcessed));
    net.sui
        .externally_withdraw(&EscrowId("0xobj-b".into()), secret);
    net.sui.push_event_page(vec![withdrawn_event(
        LedgerId::Sui,
        "0xobj-b",
        &digest,
        &secret,
        210,
        0,
    )]);

    let swap = wait_for_phase(&store, &swap_id, SwapPhase::Completed, Duration::from_secs(5)).await;
    assert!(swap.sides().all(|s| s.withdrawn));

    node.stop().await;
}

#[tokio::test]
async fn test_s4_invalid_secret_fails_and_alerts() {
    let net = Net::new();
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let secret = Secret([0x44; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
    let now = now_ms();
    net.lock_pair(&digest, now, now);

    let node = start_with_parts(
        test_config(),
        store.clone(),
        net.evm.clone(),
        net.sui.clone(),
        prometheus::Registry::new(),
    )
    .await
    .unwrap();

    let swap_id = swap_id_for(&digest);
    wait_for_phase(&store, &swap_id, SwapPhase::BothLocked, Duration::from_secs(3)).await;

    // The A-side contract rejects the revealed value.
    net.evm.push_withdraw_result(Err(AdapterError::InvalidSecret));
    net.sui
        .externally_withdraw(&EscrowId("0xobj-b".into()), secret);
    net.sui.push_event_page(vec![withdrawn_event(
        LedgerId::Sui,
        "0xobj-b",
        &digest,
        &secret,
        210,
        0,
    )]);

    let swap = wait_for_phase(&store, &swap_id, SwapPhase::Failed, Duration::from_secs(5)).await;
    assert!(swap.last_error.unwrap().contains("secret"));

    node.stop().await;
}

#[tokio::test]
async fn test_s5_deep_reorg_removes_unpaired_swap() {
    let net = Net::new();
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let secret = Secret([0x45; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);

    // Only the A-side lock appears, then a reorg wipes it.
    let event = created_event(LedgerId::Evm, "0xescrow-a", &digest, 100, 0);
    net.evm.push_event_page(vec![event]);
    net.evm.push_poll_error(AdapterError::CursorGap {
        rewind_to: EventCursor::new(90, 0),
    });

    let node = start_with_parts(
        test_config(),
        store.clone(),
        net.evm.clone(),
        net.sui.clone(),
        prometheus::Registry::new(),
    )
    .await
    .unwrap();

    let swap_id = swap_id_for(&digest);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let gone = store.get_swap(&swap_id).await.unwrap().is_none();
        let rewound = store
            .get_cursor(LedgerId::Evm)
            .await
            .unwrap()
            .is_some_and(|c| c.height <= 95);
        if gone && rewound {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("reorg cleanup did not happen");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // No on-chain action was taken during the window of uncertainty.
    assert!(net.evm.withdraw_calls().is_empty());
    assert!(net.evm.refund_calls().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_s6_two_instances_complete_without_double_spend() {
    // Two engines share a store and both react to the same reveal.
    let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
    let net = Net::new();
    let secret = Secret([0x46; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
    let now = now_ms();
    net.lock_pair(&digest, now, now);

    let config = test_config();
    let make_engine = |scheduler: &Scheduler| {
        let evm: Arc<dyn ChainAdapter> = net.evm.clone();
        let sui: Arc<dyn ChainAdapter> = net.sui.clone();
        SwapEngine::new(
            &config,
            store.clone(),
            (evm, Arc::new(RateLimiter::new(1_000))),
            (sui, Arc::new(RateLimiter::new(1_000))),
            scheduler.timer_handle(),
            Arc::new(crate::metrics::CoordinatorMetrics::new_for_testing()),
        )
    };
    let scheduler_a = Scheduler::new(64, 2);
    let scheduler_b = Scheduler::new(64, 2);
    let engine_a = make_engine(&scheduler_a);
    let engine_b = make_engine(&scheduler_b);

    // Seed the store with the revealed swap both instances observed.
    let mut swap = crate::test_utils::paired_swap(&secret, now);
    {
        let side = swap.side_mut(LedgerId::Sui).unwrap();
        side.withdrawn = true;
        side.revealed_secret = Some(secret);
    }
    swap.phase = SwapPhase::Revealed;
    store.put_swap(&swap, None).await.unwrap();
    // Point the engines at the seeded escrows.
    net.evm.add_escrow(EscrowSnapshot {
        escrow_id: EscrowId("0xescrow-a".into()),
        owner: "0xalice".into(),
        beneficiary: "evm-resolver".into(),
        token: "0xtoken".into(),
        amount: 1_000,
        digest,
        algorithm: HashAlgorithm::Sha256,
        start_ms: now,
        lock_duration_ms: 600_000,
        withdrawn: false,
        refunded: false,
        revealed_secret: None,
    });

    let (ra, rb) = tokio::join!(engine_a.evaluate(&swap.id), engine_b.evaluate(&swap.id));
    ra.unwrap();
    rb.unwrap();

    let stored = store.get_swap(&swap.id).await.unwrap().unwrap().swap;
    assert_eq!(stored.phase, SwapPhase::Completed);
    // The escrow itself moved exactly once.
    let escrow = net.evm.escrow(&EscrowId("0xescrow-a".into())).unwrap();
    assert!(escrow.withdrawn);
    assert!(!escrow.refunded);
}

#[tokio::test]
async fn test_crash_restart_reaches_same_phase() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let secret = Secret([0x47; 32]);
    let digest = crypto::digest(&secret, HashAlgorithm::Sha256);
    let swap_id = swap_id_for(&digest);
    let now = now_ms();

    // First run: observe both locks, then stop before any reveal.
    {
        let net = Net::new();
        net.lock_pair(&digest, now, now);
        let store: Arc<dyn SwapStore> = Arc::new(SledStore::open(&path).unwrap());
        let node = start_with_parts(
            test_config(),
            store.clone(),
            net.evm.clone(),
            net.sui.clone(),
            prometheus::Registry::new(),
        )
        .await
        .unwrap();
        wait_for_phase(&store, &swap_id, SwapPhase::BothLocked, Duration::from_secs(3)).await;
        node.stop().await;
    }

    // Second run on the same store: the reveal arrives and the swap
    // completes exactly as it would have without the restart.
    {
        let net = Net::new();
        // Escrow state as the ledgers still see it.
        net.evm.add_escrow(EscrowSnapshot {
            escrow_id: EscrowId("0xescrow-a".into()),
            owner: "0xalice".into(),
            beneficiary: "evm-resolver".into(),
            token: "0xtoken".into(),
            amount: 1_000,
            digest,
            algorithm: HashAlgorithm::Sha256,
            start_ms: now,
            lock_duration_ms: 600_000,
            withdrawn: false,
            refunded: false,
            revealed_secret: None,
        });
        net.sui.push_event_page(vec![withdrawn_event(
            LedgerId::Sui,
            "0xobj-b",
            &digest,
            &secret,
            210,
            0,
        )]);

        let store: Arc<dyn SwapStore> = Arc::new(SledStore::open(&path).unwrap());
        let node = start_with_parts(
            test_config(),
            store.clone(),
            net.evm.clone(),
            net.sui.clone(),
            prometheus::Registry::new(),
        )
        .await
        .unwrap();

        let swap =
            wait_for_phase(&store, &swap_id, SwapPhase::Completed, Duration::from_secs(5)).await;
        assert!(swap.sides().all(|s| s.withdrawn));
        node.stop().await;
    }
}
