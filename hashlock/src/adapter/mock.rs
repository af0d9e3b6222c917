// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory ledger adapter used in test environments.
//!
//! Default behavior emulates the escrow contract semantics against an
//! in-memory object map; individual calls can be overridden by pushing
//! scripted results.

use crate::adapter::{
    AdapterError, AdapterResult, ChainAdapter, CreateEscrowParams, EscrowSnapshot, EventBatch,
};
use crate::crypto::{self, Secret, SecretDigest};
use crate::types::{now_ms, EscrowEvent, EscrowId, EventCursor, LedgerId, TxRef};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockChainAdapter {
    ledger: LedgerId,
    signer: String,
    height: Arc<AtomicU64>,
    escrows: Arc<Mutex<HashMap<String, EscrowSnapshot>>>,
    /// FIFO of poll outcomes: pages and injected errors interleave in the
    /// order they were scripted.
    poll_results: Arc<Mutex<VecDeque<AdapterResult<Vec<EscrowEvent>>>>>,
    withdraw_results: Arc<Mutex<VecDeque<AdapterResult<TxRef>>>>,
    refund_results: Arc<Mutex<VecDeque<AdapterResult<TxRef>>>>,
    withdraw_calls: Arc<Mutex<Vec<(EscrowId, Secret)>>>,
    refund_calls: Arc<Mutex<Vec<EscrowId>>>,
    registered: Arc<Mutex<bool>>,
    ping_ok: Arc<Mutex<bool>>,
    tx_counter: Arc<AtomicU64>,
}

impl MockChainAdapter {
    pub fn new(ledger: LedgerId) -> Self {
        Self {
            ledger,
            signer: format!("{}-resolver", ledger.as_str()),
            height: Arc::new(AtomicU64::new(100)),
            escrows: Default::default(),
            poll_results: Default::default(),
            withdraw_results: Default::default(),
            refund_results: Default::default(),
            withdraw_calls: Default::default(),
            refund_calls: Default::default(),
            registered: Arc::new(Mutex::new(false)),
            ping_ok: Arc::new(Mutex::new(true)),
            tx_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_signer(mut self, signer: &str) -> Self {
        self.signer = signer.to_string();
        self
    }

    pub fn add_escrow(&self, snapshot: EscrowSnapshot) {
        self.escrows
            .lock()
            .unwrap()
            .insert(snapshot.escrow_id.0.clone(), snapshot);
    }

    pub fn escrow(&self, escrow_id: &EscrowId) -> Option<EscrowSnapshot> {
        self.escrows.lock().unwrap().get(&escrow_id.0).cloned()
    }

    pub fn remove_escrow(&self, escrow_id: &EscrowId) {
        self.escrows.lock().unwrap().remove(&escrow_id.0);
    }

    /// Mark an escrow withdrawn as if a third party claimed it.
    pub fn externally_withdraw(&self, escrow_id: &EscrowId, secret: Secret) {
        let mut escrows = self.escrows.lock().unwrap();
        if let Some(e) = escrows.get_mut(&escrow_id.0) {
            e.withdrawn = true;
            e.revealed_secret = Some(secret);
        }
    }

    pub fn push_event_page(&self, events: Vec<EscrowEvent>) {
        self.poll_results.lock().unwrap().push_back(Ok(events));
    }

    pub fn push_withdraw_result(&self, result: AdapterResult<TxRef>) {
        self.withdraw_results.lock().unwrap().push_back(result);
    }

    pub fn push_refund_result(&self, result: AdapterResult<TxRef>) {
        self.refund_results.lock().unwrap().push_back(result);
    }

    pub fn push_poll_error(&self, error: AdapterError) {
        self.poll_results.lock().unwrap().push_back(Err(error));
    }

    pub fn withdraw_calls(&self) -> Vec<(EscrowId, Secret)> {
        self.withdraw_calls.lock().unwrap().clone()
    }

    pub fn refund_calls(&self) -> Vec<EscrowId> {
        self.refund_calls.lock().unwrap().clone()
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        *self.ping_ok.lock().unwrap() = ok;
    }

    pub fn is_registered(&self) -> bool {
        *self.registered.lock().unwrap()
    }

    fn next_tx_ref(&self, kind: &str) -> TxRef {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        TxRef(format!("mock-{}-{}-{}", self.ledger.as_str(), kind, n))
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn ledger(&self) -> LedgerId {
        self.ledger
    }

    fn signer_address(&self) -> String {
        self.signer.clone()
    }

    async fn create_escrow(
        &self,
        params: CreateEscrowParams,
    ) -> AdapterResult<(EscrowId, TxRef)> {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let escrow_id = EscrowId(format!("mock-{}-escrow-{}", self.ledger.as_str(), n));
        let snapshot = EscrowSnapshot {
            escrow_id: escrow_id.clone(),
            owner: self.signer.clone(),
            beneficiary: params.beneficiary,
            token: params.token,
            amount: params.amount,
            digest: params.digest,
            algorithm: params.algorithm,
            start_ms: now_ms(),
            lock_duration_ms: params.lock_duration_ms,
            withdrawn: false,
            refunded: false,
            revealed_secret: None,
        };
        self.add_escrow(snapshot);
        Ok((escrow_id, self.next_tx_ref("create")))
    }

    async fn withdraw(&self, escrow_id: &EscrowId, secret: &Secret) -> AdapterResult<TxRef> {
        self.withdraw_calls
            .lock()
            .unwrap()
            .push((escrow_id.clone(), *secret));

        if let Some(result) = self.withdraw_results.lock().unwrap().pop_front() {
            return result;
        }

        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows
            .get_mut(&escrow_id.0)
            .ok_or_else(|| AdapterError::NotFound(escrow_id.0.clone()))?;
        if escrow.withdrawn {
            return Err(AdapterError::AlreadyProcessed);
        }
        if escrow.refunded {
            return Err(AdapterError::Expired);
        }
        if !crypto::verify(secret, &escrow.digest, escrow.algorithm) {
            return Err(AdapterError::InvalidSecret);
        }
        escrow.withdrawn = true;
        escrow.revealed_secret = Some(*secret);
        drop(escrows);
        Ok(self.next_tx_ref("withdraw"))
    }

    async fn refund(&self, escrow_id: &EscrowId) -> AdapterResult<TxRef> {
        self.refund_calls.lock().unwrap().push(escrow_id.clone());

        if let Some(result) = self.refund_results.lock().unwrap().pop_front() {
            return result;
        }

        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows
            .get_mut(&escrow_id.0)
            .ok_or_else(|| AdapterError::NotFound(escrow_id.0.clone()))?;
        if escrow.refunded {
            return Err(AdapterError::AlreadyProcessed);
        }
        if escrow.withdrawn {
            return Err(AdapterError::Rejected("already withdrawn".into()));
        }
        let deadline = escrow.deadline_ms();
        if now_ms() <= deadline {
            return Err(AdapterError::NotExpired {
                deadline_ms: deadline,
            });
        }
        escrow.refunded = true;
        drop(escrows);
        Ok(self.next_tx_ref("refund"))
    }

    async fn get_escrow(&self, escrow_id: &EscrowId) -> AdapterResult<EscrowSnapshot> {
        self.escrows
            .lock()
            .unwrap()
            .get(&escrow_id.0)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(escrow_id.0.clone()))
    }

    async fn find_escrows_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> AdapterResult<Vec<EscrowId>> {
        Ok(self
            .escrows
            .lock()
            .unwrap()
            .values()
            .filter(|e| &e.digest == digest)
            .map(|e| e.escrow_id.clone())
            .collect())
    }

    async fn poll_events(&self, cursor: EventCursor, _limit: usize) -> AdapterResult<EventBatch> {
        let height = self.height.load(Ordering::SeqCst);
        match self.poll_results.lock().unwrap().pop_front() {
            Some(Err(error)) => Err(error),
            Some(Ok(events)) => {
                let next_cursor = events
                    .last()
                    .map(|e| EventCursor::after(e.position()))
                    .unwrap_or(cursor);
                Ok(EventBatch {
                    events,
                    next_cursor,
                    finalized_height: height,
                })
            }
            None => Ok(EventBatch {
                events: Vec::new(),
                next_cursor: cursor,
                finalized_height: height,
            }),
        }
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn ping(&self) -> AdapterResult<()> {
        if *self.ping_ok.lock().unwrap() {
            Ok(())
        } else {
            Err(AdapterError::Unavailable("mock ping disabled".into()))
        }
    }

    async fn register_resolver(&self, _stake: u128) -> AdapterResult<Option<TxRef>> {
        let mut registered = self.registered.lock().unwrap();
        if *registered {
            return Ok(None);
        }
        *registered = true;
        Ok(Some(self.next_tx_ref("register")))
    }
}
