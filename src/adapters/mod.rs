pub mod evm;
pub mod hermes;

pub use evm::{
    classify_rpc_error, AlloyChainClient, ChainClient, IPyth, OnchainPrice, PriceUpdateEvent,
    ReceiptInfo, TxRequest,
};
pub use hermes::{FeedSource, HermesClient};
