pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod services;
pub mod signing;

pub use adapters::{AlloyChainClient, ChainClient, FeedSource, HermesClient};
pub use config::AppConfig;
pub use coordination::{
    CircuitState, FeedCircuitBreaker, GracefulShutdown, ShutdownSignal, ShutdownToken,
};
pub use domain::{
    AttestationBatch, CycleState, PriceAttestation, SubmissionResult, UpdateMode, UpdatePayload,
};
pub use error::{CycleError, EncodingError, FetchError, PythoraError, Result, SubmissionError};
pub use services::{
    CycleContext, CycleOutcome, FeedRunner, Metrics, Scheduler, SubmissionQueue, SubmitterConfig,
};
pub use signing::{NonceManager, Wallet};
