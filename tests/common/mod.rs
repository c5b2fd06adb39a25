//! In-memory oracle and chain used by the integration tests
#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use pythora::adapters::{
    ChainClient, FeedSource, OnchainPrice, PriceUpdateEvent, ReceiptInfo, TxRequest,
};
use pythora::config::{FeedConfig, SchedulerConfig};
use pythora::coordination::ShutdownToken;
use pythora::domain::{AttestationBatch, PriceAttestation, UpdateMode};
use pythora::error::{FetchError, SubmissionError};
use pythora::services::{CycleContext, FeedRunner, Metrics, SubmissionQueue, SubmitterConfig};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn contract() -> Address {
    Address::repeat_byte(0x42)
}

/// Oracle returning one attestation per symbol at a settable price
pub struct FakeSource {
    price: AtomicI64,
    delay: Duration,
    errors: Mutex<VecDeque<FetchError>>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new(price: i64) -> Self {
        Self::with_delay(price, Duration::ZERO)
    }

    pub fn with_delay(price: i64, delay: Duration) -> Self {
        Self {
            price: AtomicI64::new(price),
            delay,
            errors: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_price(&self, price: i64) {
        self.price.store(price, Ordering::SeqCst);
    }

    /// Fail the next fetch with `err`
    pub fn fail_next(&self, err: FetchError) {
        self.errors.lock().unwrap().push_back(err);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

pub fn price_id_for(symbol: &str) -> B256 {
    let mut id = [0u8; 32];
    for (slot, byte) in id.iter_mut().zip(symbol.bytes()) {
        *slot = byte;
    }
    B256::from(id)
}

#[async_trait]
impl FeedSource for FakeSource {
    async fn fetch(&self, symbols: &[String]) -> Result<AttestationBatch, FetchError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) as u8;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let price = self.price.load(Ordering::SeqCst);
        let attestations = symbols
            .iter()
            .map(|symbol| PriceAttestation {
                symbol: symbol.clone(),
                price_id: price_id_for(symbol),
                price,
                conf: 10,
                expo: -2,
                publish_time: Utc::now().timestamp(),
                proof: Bytes::from(vec![b'P', b'N', b'A', b'U', 1, n]),
            })
            .collect();
        Ok(AttestationBatch::new(attestations))
    }
}

/// Chain that includes every valid transaction in the next block and mines a
/// block on every receipt or head poll
pub struct FakeChain {
    signer: Address,
    has_code: bool,
    head: AtomicU64,
    next_nonce: AtomicU64,
    broadcast_errors: Mutex<VecDeque<SubmissionError>>,
    included: Mutex<HashMap<B256, u64>>,
    pub sent: Mutex<Vec<TxRequest>>,
}

impl FakeChain {
    pub fn new(signer: Address) -> Self {
        Self {
            signer,
            has_code: true,
            head: AtomicU64::new(100),
            next_nonce: AtomicU64::new(0),
            broadcast_errors: Mutex::new(VecDeque::new()),
            included: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn without_code(signer: Address) -> Self {
        Self {
            has_code: false,
            ..Self::new(signer)
        }
    }

    /// Fail the next broadcast with `err` without consuming a nonce
    pub fn fail_next_broadcast(&self, err: SubmissionError) {
        self.broadcast_errors.lock().unwrap().push_back(err);
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|tx| tx.nonce).collect()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn signer_address(&self) -> Option<Address> {
        Some(self.signer)
    }

    fn contract_address(&self) -> Address {
        contract()
    }

    async fn pending_nonce(&self) -> Result<u64, SubmissionError> {
        Ok(self.next_nonce.load(Ordering::SeqCst))
    }

    async fn has_code(&self) -> Result<bool, SubmissionError> {
        Ok(self.has_code)
    }

    async fn update_fee(&self, update_data: Vec<Bytes>) -> Result<U256, SubmissionError> {
        Ok(U256::from(update_data.len() as u64))
    }

    async fn broadcast(&self, tx: TxRequest) -> Result<B256, SubmissionError> {
        if let Some(err) = self.broadcast_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let expected = self.next_nonce.load(Ordering::SeqCst);
        if tx.nonce != expected {
            return Err(SubmissionError::NonceConflict(format!(
                "nonce too low: expected {expected}, got {}",
                tx.nonce
            )));
        }
        self.next_nonce.fetch_add(1, Ordering::SeqCst);

        let mut seed = [0u8; 32];
        seed[..20].copy_from_slice(self.signer.as_slice());
        seed[24..].copy_from_slice(&tx.nonce.to_be_bytes());
        let hash = B256::from(seed);

        let block = self.head.load(Ordering::SeqCst) + 1;
        self.included.lock().unwrap().insert(hash, block);
        self.sent.lock().unwrap().push(tx);
        Ok(hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, SubmissionError> {
        let head = self.head.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self
            .included
            .lock()
            .unwrap()
            .get(&tx_hash)
            .filter(|block| **block <= head)
            .map(|block| ReceiptInfo {
                block_number: *block,
                success: true,
            }))
    }

    async fn block_number(&self) -> Result<u64, SubmissionError> {
        Ok(self.head.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn price_unsafe(&self, _price_id: B256) -> Result<OnchainPrice, SubmissionError> {
        Ok(OnchainPrice {
            price: 0,
            conf: 0,
            expo: -8,
            publish_time: 0,
        })
    }

    async fn price_no_older_than(
        &self,
        price_id: B256,
        _max_age_secs: u64,
    ) -> Result<OnchainPrice, SubmissionError> {
        self.price_unsafe(price_id).await
    }

    async fn price_updates(
        &self,
        _price_id: Option<B256>,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<PriceUpdateEvent>, SubmissionError> {
        Ok(Vec::new())
    }
}

pub fn feed(name: &str, symbols: &[&str], deviation_pct: Decimal) -> FeedConfig {
    FeedConfig {
        name: name.to_string(),
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        update_interval_secs: 10,
        deviation_threshold_pct: deviation_pct,
        staleness_threshold_secs: 3600,
        signer_env: None,
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        retry_backoff_ms: 10,
        max_backoff_ms: 100,
        max_retries: 2,
        failure_threshold: 5,
        recovery_timeout_secs: 30,
        drain_timeout_secs: 5,
        metrics_log_interval_secs: 0,
    }
}

pub fn submitter_config(confirmations: u64) -> SubmitterConfig {
    SubmitterConfig {
        contract: contract(),
        confirmations,
        confirmation_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(200),
        gas_limit: None,
        queue_capacity: 16,
    }
}

pub fn spawn_queue(
    chain: Arc<FakeChain>,
    confirmations: u64,
    metrics: Arc<Metrics>,
) -> (SubmissionQueue, JoinHandle<()>) {
    SubmissionQueue::spawn(chain, submitter_config(confirmations), metrics)
        .expect("fake chain has a signer")
}

pub fn runner(
    feed: FeedConfig,
    source: Arc<FakeSource>,
    queue: SubmissionQueue,
    ctx: &CycleContext,
    token: ShutdownToken,
) -> Arc<FeedRunner> {
    runner_with_config(feed, source, queue, ctx, &scheduler_config(), token)
}

pub fn runner_with_config(
    feed: FeedConfig,
    source: Arc<FakeSource>,
    queue: SubmissionQueue,
    ctx: &CycleContext,
    config: &SchedulerConfig,
    token: ShutdownToken,
) -> Arc<FeedRunner> {
    Arc::new(FeedRunner::new(
        feed,
        UpdateMode::Always,
        source,
        queue,
        ctx.clone(),
        config,
        token,
    ))
}
