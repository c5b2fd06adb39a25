use crate::adapters::ChainClient;
use crate::error::SubmissionError;
use alloy::primitives::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Nonce manager for one signing key
///
/// Hands out strictly increasing nonces from an in-memory counter that is
/// seeded from the chain's pending transaction count.
///
/// # How it works
/// 1. The first allocation (or the first after a release) recovers the
///    counter from `eth_getTransactionCount(addr, "pending")`
/// 2. Each allocation returns the counter and advances it
/// 3. A nonce that reached the chain is marked used
/// 4. A nonce that never landed is released, which drops the cache so the
///    next allocation resyncs with the chain instead of leaving a gap
/// 5. After a nonce conflict the worker calls [`NonceManager::recover`] so
///    the resync happens before the retried cycle asks for a nonce
///
/// # Example
/// ```rust,ignore
/// let nonces = NonceManager::new(signer);
///
/// let nonce = nonces.allocate(chain.as_ref()).await?;
/// match chain.broadcast(tx.with_nonce(nonce)).await {
///     Ok(hash) => nonces.mark_used(nonce, &hash.to_string()),
///     Err(e) => nonces.release(nonce, &e.to_string()).await,
/// }
/// ```
pub struct NonceManager {
    address: Address,
    next: Mutex<Option<u64>>,
    allocations: AtomicU64,
    used: AtomicU64,
    released: AtomicU64,
    highest: AtomicU64,
}

impl NonceManager {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            next: Mutex::new(None),
            allocations: AtomicU64::new(0),
            used: AtomicU64::new(0),
            released: AtomicU64::new(0),
            highest: AtomicU64::new(0),
        }
    }

    /// Reset the counter to the chain's pending transaction count
    pub async fn recover(&self, chain: &dyn ChainClient) -> Result<u64, SubmissionError> {
        let mut next = self.next.lock().await;
        let pending = chain.pending_nonce().await?;

        if let Some(cached) = *next {
            if cached != pending {
                warn!(
                    address = %self.address,
                    cached,
                    pending,
                    "Nonce cache out of sync with chain, resyncing"
                );
            }
        }
        *next = Some(pending);

        info!(address = %self.address, nonce = pending, "Recovered nonce from chain");
        Ok(pending)
    }

    /// Allocate the next nonce
    pub async fn allocate(&self, chain: &dyn ChainClient) -> Result<u64, SubmissionError> {
        let mut next = self.next.lock().await;

        let nonce = match *next {
            Some(n) => n,
            None => {
                let pending = chain.pending_nonce().await?;
                debug!(address = %self.address, nonce = pending, "Seeded nonce from chain");
                pending
            }
        };
        *next = Some(nonce + 1);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.highest.fetch_max(nonce, Ordering::Relaxed);

        debug!(address = %self.address, nonce, "Allocated nonce");
        Ok(nonce)
    }

    /// Record that a nonce was consumed on chain
    pub fn mark_used(&self, nonce: u64, tx_hash: &str) {
        self.used.fetch_add(1, Ordering::Relaxed);
        debug!(address = %self.address, nonce, tx_hash, "Nonce used");
    }

    /// Give back a nonce whose transaction did not land
    pub async fn release(&self, nonce: u64, reason: &str) {
        *self.next.lock().await = None;
        self.released.fetch_add(1, Ordering::Relaxed);
        warn!(address = %self.address, nonce, reason, "Released nonce, will resync from chain");
    }

    /// Next nonce that would be handed out, if known
    pub async fn current(&self) -> Option<u64> {
        *self.next.lock().await
    }

    pub fn stats(&self) -> NonceStats {
        let allocations = self.allocations.load(Ordering::Relaxed);
        let used = self.used.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        NonceStats {
            total_allocations: allocations,
            used_count: used,
            released_count: released,
            pending_count: allocations.saturating_sub(used + released),
            highest_nonce: (allocations > 0).then(|| self.highest.load(Ordering::Relaxed)),
        }
    }
}

/// Nonce usage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceStats {
    pub total_allocations: u64,
    pub used_count: u64,
    pub released_count: u64,
    pub pending_count: u64,
    pub highest_nonce: Option<u64>,
}
