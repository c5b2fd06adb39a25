use thiserror::Error;

/// Main error type for the price pusher
#[derive(Error, Debug)]
pub enum PythoraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Cycle stage errors
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Address parsing error: {0}")]
    AddressParsing(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for PythoraError
pub type Result<T> = std::result::Result<T, PythoraError>;

/// Errors raised while fetching attestations from the price oracle.
///
/// All variants are recoverable: the feed waits for its next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Oracle request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed oracle response: {0}")]
    Malformed(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Stale attestation for {symbol}: {age_secs}s old (max {max_age_secs}s)")]
    StaleAttestation {
        symbol: String,
        age_secs: i64,
        max_age_secs: u64,
    },
}

/// Errors raised while turning attestations into an update payload.
///
/// Recoverable only through a fresh fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("No attestations to encode")]
    Empty,

    #[error("Attestation for {symbol} is missing {field}")]
    MissingField { symbol: String, field: &'static str },

    #[error("Malformed proof for {symbol}: {reason}")]
    MalformedProof { symbol: String, reason: String },

    #[error("Duplicate price feed in batch: {symbol}")]
    DuplicateFeed { symbol: String },
}

/// Errors raised by the chain submitter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("RPC unreachable: {0}")]
    RpcUnreachable(String),

    #[error("Execution reverted (tx {tx_hash}): {reason}")]
    Reverted { tx_hash: String, reason: String },

    #[error("Confirmation timeout after {waited_secs}s (tx {tx_hash}, nonce {nonce})")]
    ConfirmationTimeout {
        tx_hash: String,
        nonce: u64,
        waited_secs: u64,
    },

    #[error("Invalid contract: {0}")]
    InvalidContract(String),

    #[error("Submission queue closed")]
    QueueClosed,
}

impl SubmissionError {
    /// Errors that need operator intervention; the feed halts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubmissionError::InsufficientFunds(_) | SubmissionError::InvalidContract(_)
        )
    }

    /// Errors worth an immediate fresh cycle after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionError::NonceConflict(_)
                | SubmissionError::RpcUnreachable(_)
                | SubmissionError::ConfirmationTimeout { .. }
        )
    }

    /// Short label for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            SubmissionError::InsufficientFunds(_) => "insufficient_funds",
            SubmissionError::NonceConflict(_) => "nonce_conflict",
            SubmissionError::RpcUnreachable(_) => "rpc_unreachable",
            SubmissionError::Reverted { .. } => "reverted",
            SubmissionError::ConfirmationTimeout { .. } => "confirmation_timeout",
            SubmissionError::InvalidContract(_) => "invalid_contract",
            SubmissionError::QueueClosed => "queue_closed",
        }
    }
}

/// Failure of one cycle, tagged by the stage that produced it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl CycleError {
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Fetch(_) => "fetch",
            CycleError::Encoding(_) => "encode",
            CycleError::Submission(_) => "submit",
        }
    }

    /// Only submission errors can halt a feed
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Submission(e) if e.is_fatal())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CycleError::Submission(e) if e.is_retryable())
    }
}

impl From<CycleError> for PythoraError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Fetch(e) => PythoraError::Fetch(e),
            CycleError::Encoding(e) => PythoraError::Encoding(e),
            CycleError::Submission(e) => PythoraError::Submission(e),
        }
    }
}
