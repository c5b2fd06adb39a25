//! Ordered submission queue, one per signing key
//!
//! Every job for a key is handled by a single worker task, start to finish:
//! fee quote, nonce allocation, broadcast and the confirmation wait. Nonces
//! are therefore issued strictly one after another and a nonce is never
//! handed out while an earlier transaction from the same key is unresolved.

use crate::adapters::{ChainClient, TxRequest};
use crate::config::ChainConfig;
use crate::domain::{SubmissionResult, UpdatePayload};
use crate::error::{PythoraError, Result, SubmissionError};
use crate::services::Metrics;
use crate::signing::{NonceManager, NonceStats};
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub contract: Address,
    /// Blocks required on top of the inclusion block, counting it
    pub confirmations: u64,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub gas_limit: Option<u64>,
    pub queue_capacity: usize,
}

impl SubmitterConfig {
    pub fn from_chain(chain: &ChainConfig) -> Result<Self> {
        let contract = chain
            .contract_address()
            .map_err(PythoraError::AddressParsing)?;
        Ok(Self {
            contract,
            confirmations: chain.confirmations,
            confirmation_timeout: chain.confirmation_timeout(),
            poll_interval: chain.receipt_poll_interval(),
            gas_limit: chain.gas_limit,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }
}

struct SubmissionJob {
    feed: String,
    payload: UpdatePayload,
    reply: oneshot::Sender<std::result::Result<SubmissionResult, SubmissionError>>,
}

/// Handle to a signing key's submission worker
///
/// Cheap to clone; the worker exits once every handle is dropped and the
/// queued jobs are done.
#[derive(Clone)]
pub struct SubmissionQueue {
    tx: mpsc::Sender<SubmissionJob>,
    signer: Address,
    nonces: Arc<NonceManager>,
}

impl SubmissionQueue {
    /// Start the worker for the key `chain` signs with
    pub fn spawn(
        chain: Arc<dyn ChainClient>,
        config: SubmitterConfig,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let signer = chain.signer_address().ok_or_else(|| {
            PythoraError::Wallet("submission queue needs a signing chain client".to_string())
        })?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let nonces = Arc::new(NonceManager::new(signer));

        let worker = SubmissionWorker {
            chain,
            config,
            nonces: Arc::clone(&nonces),
            metrics,
            contract_verified: false,
        };
        let handle = tokio::spawn(
            worker
                .run(rx)
                .instrument(info_span!("submission_worker", signer = %signer)),
        );

        info!(signer = %signer, "Submission queue started");
        Ok((Self { tx, signer, nonces }, handle))
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn nonce_stats(&self) -> NonceStats {
        self.nonces.stats()
    }

    /// Enqueue a payload and wait for its outcome
    pub async fn submit(
        &self,
        feed: &str,
        payload: UpdatePayload,
    ) -> std::result::Result<SubmissionResult, SubmissionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SubmissionJob {
                feed: feed.to_string(),
                payload,
                reply,
            })
            .await
            .map_err(|_| SubmissionError::QueueClosed)?;

        rx.await.map_err(|_| SubmissionError::QueueClosed)?
    }
}

impl std::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("signer", &self.signer)
            .finish()
    }
}

struct SubmissionWorker {
    chain: Arc<dyn ChainClient>,
    config: SubmitterConfig,
    nonces: Arc<NonceManager>,
    metrics: Arc<Metrics>,
    contract_verified: bool,
}

impl SubmissionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SubmissionJob>) {
        while let Some(job) = rx.recv().await {
            let span = info_span!(
                "submit",
                feed = %job.feed,
                fetch_id = %job.payload.fetch_id,
            );
            let result = self.process(&job.payload).instrument(span).await;

            if job.reply.send(result).is_err() {
                // Cycle gone (shutdown); the outcome is already logged
                debug!(feed = %job.feed, "Submission outcome had no receiver");
            }
        }
        info!("Submission worker stopped");
    }

    async fn ensure_contract(&mut self) -> std::result::Result<(), SubmissionError> {
        if self.contract_verified {
            return Ok(());
        }
        if !self.chain.has_code().await? {
            return Err(SubmissionError::InvalidContract(format!(
                "no code at {}",
                self.config.contract
            )));
        }
        self.contract_verified = true;
        Ok(())
    }

    async fn process(
        &mut self,
        payload: &UpdatePayload,
    ) -> std::result::Result<SubmissionResult, SubmissionError> {
        self.ensure_contract().await?;

        let fee = self.chain.update_fee(payload.update_data.clone()).await?;
        let nonce = self.nonces.allocate(self.chain.as_ref()).await?;

        let tx = TxRequest {
            to: self.config.contract,
            calldata: payload.calldata.clone(),
            value: fee,
            nonce,
            gas_limit: self.config.gas_limit,
        };

        let tx_hash = match self.chain.broadcast(tx).await {
            Ok(hash) => hash,
            Err(e @ SubmissionError::NonceConflict(_)) => {
                self.nonces.release(nonce, e.kind()).await;
                // Another sender used this key; resync before the retry asks for a nonce
                if let Err(recover_err) = self.nonces.recover(self.chain.as_ref()).await {
                    warn!(error = %recover_err, "Nonce resync failed, next allocation will retry");
                }
                return Err(e);
            }
            Err(e) => {
                self.nonces.release(nonce, e.kind()).await;
                return Err(e);
            }
        };
        self.metrics.inc_transactions_sent();
        info!(
            %tx_hash,
            nonce,
            fee_wei = %fee,
            symbols = payload.len(),
            mode = %payload.mode,
            "Price update broadcast"
        );

        match self.await_confirmation(tx_hash, nonce).await {
            Ok(block_number) => {
                self.nonces.mark_used(nonce, &tx_hash.to_string());
                self.metrics.inc_transactions_confirmed();
                info!(%tx_hash, block_number, nonce, "Price update confirmed");
                Ok(SubmissionResult::confirmed(tx_hash, block_number, nonce, fee))
            }
            Err(e @ SubmissionError::Reverted { .. }) => {
                self.nonces.mark_used(nonce, &tx_hash.to_string());
                warn!(%tx_hash, nonce, error = %e, "Price update reverted");
                Err(e)
            }
            Err(e) => {
                error!(%tx_hash, nonce, error = %e, "Price update not confirmed");
                self.nonces.release(nonce, e.kind()).await;
                Err(e)
            }
        }
    }

    /// Poll until the receipt has enough blocks on top, returning its block
    async fn await_confirmation(
        &self,
        tx_hash: B256,
        nonce: u64,
    ) -> std::result::Result<u64, SubmissionError> {
        let started = Instant::now();
        let deadline = started + self.config.confirmation_timeout;

        loop {
            match self.chain.receipt(tx_hash).await {
                Ok(Some(receipt)) if !receipt.success => {
                    return Err(SubmissionError::Reverted {
                        tx_hash: format!("{tx_hash:?}"),
                        reason: format!("status 0 in block {}", receipt.block_number),
                    });
                }
                Ok(Some(receipt)) => match self.chain.block_number().await {
                    Ok(head) if head + 1 >= receipt.block_number + self.config.confirmations => {
                        return Ok(receipt.block_number);
                    }
                    Ok(head) => debug!(
                        head,
                        included = receipt.block_number,
                        "Waiting for confirmations"
                    ),
                    Err(e) => debug!(error = %e, "Block number poll failed"),
                },
                Ok(None) => debug!(%tx_hash, "Receipt not available yet"),
                Err(e) => debug!(error = %e, "Receipt poll failed"),
            }

            if Instant::now() >= deadline {
                return Err(SubmissionError::ConfirmationTimeout {
                    tx_hash: format!("{tx_hash:?}"),
                    nonce,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::evm::MockChainClient;
    use crate::adapters::ReceiptInfo;
    use crate::domain::UpdateMode;
    use alloy::primitives::{Bytes, U256};
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn config() -> SubmitterConfig {
        SubmitterConfig {
            contract: Address::repeat_byte(0x42),
            confirmations: 2,
            confirmation_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            gas_limit: None,
            queue_capacity: 4,
        }
    }

    fn payload() -> UpdatePayload {
        UpdatePayload {
            fetch_id: Uuid::new_v4(),
            mode: UpdateMode::Always,
            symbols: vec!["BTC/USD".to_string()],
            update_data: vec![Bytes::from_static(b"PNAU")],
            price_ids: vec![B256::repeat_byte(1)],
            publish_times: vec![1_718_000_000],
            calldata: Bytes::from_static(&[0xef, 0x9e, 0x5e, 0x28]),
        }
    }

    fn base_chain() -> MockChainClient {
        let mut chain = MockChainClient::new();
        chain
            .expect_signer_address()
            .returning(|| Some(Address::repeat_byte(0x11)));
        chain.expect_has_code().returning(|| Ok(true));
        chain.expect_update_fee().returning(|_| Ok(U256::from(1u64)));
        chain.expect_pending_nonce().returning(|| Ok(5));
        chain
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_after_required_blocks() {
        let mut chain = base_chain();
        chain
            .expect_broadcast()
            .withf(|tx| tx.nonce == 5 && tx.value == U256::from(1u64))
            .returning(|_| Ok(B256::repeat_byte(0xaa)));
        chain
            .expect_receipt()
            .with(eq(B256::repeat_byte(0xaa)))
            .returning(|_| {
                Ok(Some(ReceiptInfo {
                    block_number: 100,
                    success: true,
                }))
            });
        chain.expect_block_number().returning(|| Ok(101));

        let metrics = Arc::new(Metrics::new());
        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::clone(&metrics)).unwrap();

        let result = queue.submit("majors", payload()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.block_number, Some(100));
        assert_eq!(result.nonce, 5);
        assert!(result.tx_hash.starts_with("0xaaaa"));
        assert_eq!(metrics.snapshot().transactions_confirmed, 1);
        assert_eq!(queue.nonce_stats().used_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_code_is_invalid_contract() {
        let mut chain = MockChainClient::new();
        chain
            .expect_signer_address()
            .returning(|| Some(Address::repeat_byte(0x11)));
        chain.expect_has_code().returning(|| Ok(false));
        chain.expect_broadcast().never();

        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new())).unwrap();

        let err = queue.submit("majors", payload()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidContract(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_releases_nonce() {
        let mut chain = base_chain();
        chain
            .expect_broadcast()
            .returning(|_| Err(SubmissionError::NonceConflict("nonce too low".into())));

        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new())).unwrap();

        let err = queue.submit("majors", payload()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(queue.nonce_stats().released_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_conflict_resyncs_from_chain() {
        let mut chain = MockChainClient::new();
        chain
            .expect_signer_address()
            .returning(|| Some(Address::repeat_byte(0x11)));
        chain.expect_has_code().returning(|| Ok(true));
        chain.expect_update_fee().returning(|_| Ok(U256::from(1u64)));
        // Seed sees 5; by the resync an outside transaction has taken it
        let mut seeds = vec![6u64, 5];
        chain
            .expect_pending_nonce()
            .times(2)
            .returning(move || Ok(seeds.pop().unwrap_or(6)));
        chain
            .expect_broadcast()
            .withf(|tx| tx.nonce == 5)
            .times(1)
            .returning(|_| Err(SubmissionError::NonceConflict("nonce too low".into())));
        chain
            .expect_broadcast()
            .withf(|tx| tx.nonce == 6)
            .times(1)
            .returning(|_| Ok(B256::repeat_byte(0xdd)));
        chain.expect_receipt().returning(|_| {
            Ok(Some(ReceiptInfo {
                block_number: 100,
                success: true,
            }))
        });
        chain.expect_block_number().returning(|| Ok(101));

        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new())).unwrap();

        let err = queue.submit("majors", payload()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::NonceConflict(_)));

        // The resynced counter is used directly, without another chain query
        let result = queue.submit("majors", payload()).await.unwrap();
        assert_eq!(result.nonce, 6);

        let stats = queue.nonce_stats();
        assert_eq!(stats.released_count, 1);
        assert_eq!(stats.used_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_receipt() {
        let mut chain = base_chain();
        chain
            .expect_broadcast()
            .returning(|_| Ok(B256::repeat_byte(0xbb)));
        chain.expect_receipt().returning(|_| {
            Ok(Some(ReceiptInfo {
                block_number: 7,
                success: false,
            }))
        });

        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new())).unwrap();

        let err = queue.submit("majors", payload()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Reverted { .. }));
        assert!(!err.is_retryable() && !err.is_fatal());
        assert_eq!(queue.nonce_stats().used_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout() {
        let mut chain = base_chain();
        chain
            .expect_broadcast()
            .returning(|_| Ok(B256::repeat_byte(0xcc)));
        chain.expect_receipt().returning(|_| Ok(None));

        let (queue, _worker) =
            SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new())).unwrap();

        let err = queue.submit("majors", payload()).await.unwrap_err();
        match err {
            SubmissionError::ConfirmationTimeout { nonce, waited_secs, .. } => {
                assert_eq!(nonce, 5);
                assert!(waited_secs >= 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(queue.nonce_stats().released_count, 1);
    }

    #[test]
    fn test_read_only_client_rejected() {
        let mut chain = MockChainClient::new();
        chain.expect_signer_address().returning(|| None);

        let result = SubmissionQueue::spawn(Arc::new(chain), config(), Arc::new(Metrics::new()));
        assert!(matches!(result, Err(PythoraError::Wallet(_))));
    }
}
