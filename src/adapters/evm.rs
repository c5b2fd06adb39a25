//! EVM chain access for the on-chain Pyth contract
//!
//! `ChainClient` is the seam the submission queue talks to. The alloy-backed
//! implementation signs with a local key; tests plug in fakes.

use crate::domain::fixed_to_decimal;
use crate::error::{PythoraError, Result, SubmissionError};
use crate::signing::Wallet;
use alloy::network::{ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IPyth {
        struct Price {
            int64 price;
            uint64 conf;
            int32 expo;
            uint256 publishTime;
        }

        /// Fee in wei required to apply the given updates
        function getUpdateFee(bytes[] calldata updateData) external view returns (uint256 feeAmount);

        function updatePriceFeeds(bytes[] calldata updateData) external payable;

        /// Reverts with NoFreshUpdate when every feed is already at least as recent
        function updatePriceFeedsIfNecessary(
            bytes[] calldata updateData,
            bytes32[] calldata priceIds,
            uint64[] calldata publishTimes
        ) external payable;

        function getPriceUnsafe(bytes32 id) external view returns (Price memory price);

        /// Reverts with StalePrice when the stored price is older than `age` seconds
        function getPriceNoOlderThan(bytes32 id, uint256 age) external view returns (Price memory price);

        event PriceFeedUpdate(bytes32 indexed id, uint64 publishTime, int64 price, uint64 conf);
    }
}

/// Unsigned transaction handed to the chain client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: Option<u64>,
}

/// Minimal view of a mined receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub success: bool,
}

/// Price currently stored by the contract for one feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnchainPrice {
    pub price: i64,
    pub conf: u64,
    pub expo: i32,
    pub publish_time: u64,
}

impl OnchainPrice {
    pub fn price_decimal(&self) -> Option<Decimal> {
        fixed_to_decimal(self.price as i128, self.expo)
    }
}

impl From<IPyth::Price> for OnchainPrice {
    fn from(price: IPyth::Price) -> Self {
        Self {
            price: price.price,
            conf: price.conf,
            expo: price.expo,
            publish_time: price.publishTime.saturating_to::<u64>(),
        }
    }
}

/// One `PriceFeedUpdate` event emitted by the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceUpdateEvent {
    pub price_id: B256,
    pub publish_time: u64,
    pub price: i64,
    pub conf: u64,
    pub block_number: Option<u64>,
    pub tx_hash: Option<B256>,
}

/// Operations the service needs from the target chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address transactions are signed with, `None` for read-only clients
    fn signer_address(&self) -> Option<Address>;

    fn contract_address(&self) -> Address;

    /// Transaction count of the signer including pending transactions
    async fn pending_nonce(&self) -> std::result::Result<u64, SubmissionError>;

    /// Whether the configured contract address holds code
    async fn has_code(&self) -> std::result::Result<bool, SubmissionError>;

    async fn update_fee(&self, update_data: Vec<Bytes>) -> std::result::Result<U256, SubmissionError>;

    /// Sign and broadcast; returns the transaction hash without waiting
    async fn broadcast(&self, tx: TxRequest) -> std::result::Result<B256, SubmissionError>;

    async fn receipt(&self, tx_hash: B256)
        -> std::result::Result<Option<ReceiptInfo>, SubmissionError>;

    async fn block_number(&self) -> std::result::Result<u64, SubmissionError>;

    async fn price_unsafe(&self, price_id: B256) -> std::result::Result<OnchainPrice, SubmissionError>;

    /// Stored price, failing when it was published more than `max_age_secs` ago
    async fn price_no_older_than(
        &self,
        price_id: B256,
        max_age_secs: u64,
    ) -> std::result::Result<OnchainPrice, SubmissionError>;

    /// `PriceFeedUpdate` events in `from_block..=to_block`, optionally for one feed
    async fn price_updates(
        &self,
        price_id: Option<B256>,
        from_block: u64,
        to_block: u64,
    ) -> std::result::Result<Vec<PriceUpdateEvent>, SubmissionError>;
}

/// Map an RPC or node error message onto a submission failure
pub fn classify_rpc_error(message: &str) -> SubmissionError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("insufficient funds") {
        SubmissionError::InsufficientFunds(message.to_string())
    } else if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("invalid nonce")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
    {
        SubmissionError::NonceConflict(message.to_string())
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        SubmissionError::Reverted {
            tx_hash: String::new(),
            reason: message.to_string(),
        }
    } else {
        SubmissionError::RpcUnreachable(message.to_string())
    }
}

/// alloy-backed chain client for one signing key
#[derive(Clone)]
pub struct AlloyChainClient {
    provider: DynProvider,
    contract: Address,
    signer: Option<Address>,
    gas_limit: Option<u64>,
}

impl AlloyChainClient {
    /// Signing client; every broadcast is signed by `wallet`
    pub fn new(
        rpc_url: &str,
        wallet: &Wallet,
        contract: Address,
        gas_limit: Option<u64>,
    ) -> Result<Self> {
        let url = parse_rpc_url(rpc_url)?;
        let provider = ProviderBuilder::new()
            .wallet(wallet.ethereum_wallet())
            .connect_http(url)
            .erased();

        info!(
            signer = %wallet.address(),
            contract = %contract,
            "Chain client connected"
        );

        Ok(Self {
            provider,
            contract,
            signer: Some(wallet.address()),
            gas_limit,
        })
    }

    /// Client for view calls only
    pub fn read_only(rpc_url: &str, contract: Address) -> Result<Self> {
        let url = parse_rpc_url(rpc_url)?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self {
            provider,
            contract,
            signer: None,
            gas_limit: None,
        })
    }

    fn pyth(&self) -> IPyth::IPythInstance<DynProvider> {
        IPyth::new(self.contract, self.provider.clone())
    }
}

fn parse_rpc_url(rpc_url: &str) -> Result<url::Url> {
    rpc_url
        .parse()
        .map_err(|e| PythoraError::AddressParsing(format!("Invalid RPC URL {}: {}", rpc_url, e)))
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    fn signer_address(&self) -> Option<Address> {
        self.signer
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn pending_nonce(&self) -> std::result::Result<u64, SubmissionError> {
        let signer = self.signer.ok_or_else(|| {
            SubmissionError::RpcUnreachable("read-only client has no signer".to_string())
        })?;
        self.provider
            .get_transaction_count(signer)
            .pending()
            .await
            .map_err(|e| classify_rpc_error(&e.to_string()))
    }

    async fn has_code(&self) -> std::result::Result<bool, SubmissionError> {
        let code = self
            .provider
            .get_code_at(self.contract)
            .await
            .map_err(|e| SubmissionError::RpcUnreachable(e.to_string()))?;
        Ok(!code.is_empty())
    }

    async fn update_fee(&self, update_data: Vec<Bytes>) -> std::result::Result<U256, SubmissionError> {
        self.pyth()
            .getUpdateFee(update_data)
            .call()
            .await
            .map_err(|e| classify_rpc_error(&e.to_string()))
    }

    async fn broadcast(&self, tx: TxRequest) -> std::result::Result<B256, SubmissionError> {
        if self.signer.is_none() {
            return Err(SubmissionError::RpcUnreachable(
                "read-only client cannot broadcast".to_string(),
            ));
        }

        let mut request = TransactionRequest::default()
            .with_to(tx.to)
            .with_input(tx.calldata)
            .with_value(tx.value)
            .with_nonce(tx.nonce);
        if let Some(gas) = tx.gas_limit.or(self.gas_limit) {
            request = request.with_gas_limit(gas);
        }

        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|e| classify_rpc_error(&e.to_string()))?;
        let tx_hash = *pending.tx_hash();

        debug!(%tx_hash, nonce = tx.nonce, "Transaction broadcast");
        Ok(tx_hash)
    }

    async fn receipt(
        &self,
        tx_hash: B256,
    ) -> std::result::Result<Option<ReceiptInfo>, SubmissionError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| SubmissionError::RpcUnreachable(e.to_string()))?;

        Ok(receipt.and_then(|r| {
            r.block_number().map(|block_number| ReceiptInfo {
                block_number,
                success: r.status(),
            })
        }))
    }

    async fn block_number(&self) -> std::result::Result<u64, SubmissionError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| SubmissionError::RpcUnreachable(e.to_string()))
    }

    async fn price_unsafe(&self, price_id: B256) -> std::result::Result<OnchainPrice, SubmissionError> {
        self.pyth()
            .getPriceUnsafe(price_id)
            .call()
            .await
            .map(OnchainPrice::from)
            .map_err(|e| classify_rpc_error(&e.to_string()))
    }

    async fn price_no_older_than(
        &self,
        price_id: B256,
        max_age_secs: u64,
    ) -> std::result::Result<OnchainPrice, SubmissionError> {
        self.pyth()
            .getPriceNoOlderThan(price_id, U256::from(max_age_secs))
            .call()
            .await
            .map(OnchainPrice::from)
            .map_err(|e| classify_rpc_error(&e.to_string()))
    }

    async fn price_updates(
        &self,
        price_id: Option<B256>,
        from_block: u64,
        to_block: u64,
    ) -> std::result::Result<Vec<PriceUpdateEvent>, SubmissionError> {
        let mut filter = Filter::new()
            .address(self.contract)
            .event_signature(IPyth::PriceFeedUpdate::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);
        if let Some(id) = price_id {
            filter = filter.topic1(id);
        }

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| SubmissionError::RpcUnreachable(e.to_string()))?;
        debug!(logs = logs.len(), from_block, to_block, "Fetched price update events");

        logs.into_iter()
            .map(|log| {
                let block_number = log.block_number;
                let tx_hash = log.transaction_hash;
                let event = log.log_decode::<IPyth::PriceFeedUpdate>().map_err(|e| {
                    SubmissionError::RpcUnreachable(format!("undecodable PriceFeedUpdate log: {e}"))
                })?;
                let data = event.inner.data;
                Ok(PriceUpdateEvent {
                    price_id: data.id,
                    publish_time: data.publishTime,
                    price: data.price,
                    conf: data.conf,
                    block_number,
                    tx_hash,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for AlloyChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlloyChainClient")
            .field("contract", &self.contract)
            .field("signer", &self.signer)
            .finish()
    }
}
