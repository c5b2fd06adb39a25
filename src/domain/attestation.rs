use alloy::primitives::{Bytes, B256, U256};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest exponent magnitude `Decimal` can represent
const MAX_DECIMAL_SCALE: u32 = 28;

/// Convert a fixed-point mantissa/exponent pair into a `Decimal`.
///
/// Returns `None` when the value does not fit.
pub fn fixed_to_decimal(mantissa: i128, expo: i32) -> Option<Decimal> {
    if expo <= 0 {
        let scale = expo.unsigned_abs();
        if scale > MAX_DECIMAL_SCALE {
            return None;
        }
        Decimal::try_from_i128_with_scale(mantissa, scale).ok()
    } else {
        let mut value = Decimal::try_from_i128_with_scale(mantissa, 0).ok()?;
        for _ in 0..expo {
            value = value.checked_mul(Decimal::TEN)?;
        }
        Some(value)
    }
}

/// A signed price statement for one feed at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceAttestation {
    /// Human symbol (e.g., "BTC/USD")
    pub symbol: String,
    /// Oracle price feed id
    pub price_id: B256,
    /// Price mantissa
    pub price: i64,
    /// Confidence interval, same exponent as `price`
    pub conf: u64,
    pub expo: i32,
    /// Unix seconds
    pub publish_time: i64,
    /// Signed update blob accepted by the on-chain contract
    pub proof: Bytes,
}

impl PriceAttestation {
    pub fn price_decimal(&self) -> Option<Decimal> {
        fixed_to_decimal(self.price as i128, self.expo)
    }

    pub fn conf_decimal(&self) -> Option<Decimal> {
        fixed_to_decimal(self.conf as i128, self.expo)
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.publish_time, 0).single()
    }

    /// Seconds between publication and `now` (negative if published in the future)
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.publish_time
    }
}

/// The attestations produced by exactly one fetch.
///
/// Deliberately not `Clone`: a batch is moved into the cycle that fetched it
/// and dropped with it, so no later cycle can submit its proofs.
#[derive(Debug)]
pub struct AttestationBatch {
    fetch_id: Uuid,
    attestations: Vec<PriceAttestation>,
}

impl AttestationBatch {
    pub fn new(attestations: Vec<PriceAttestation>) -> Self {
        Self {
            fetch_id: Uuid::new_v4(),
            attestations,
        }
    }

    pub fn fetch_id(&self) -> Uuid {
        self.fetch_id
    }

    pub fn attestations(&self) -> &[PriceAttestation] {
        &self.attestations
    }

    pub fn symbols(&self) -> Vec<String> {
        self.attestations.iter().map(|a| a.symbol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.attestations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attestations.is_empty()
    }
}

/// Which contract entry point receives the update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// `updatePriceFeeds(bytes[])`
    #[default]
    Always,
    /// `updatePriceFeedsIfNecessary(bytes[], bytes32[], uint64[])`
    IfNecessary,
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMode::Always => write!(f, "always"),
            UpdateMode::IfNecessary => write!(f, "if_necessary"),
        }
    }
}

/// Encoded contract call for one cycle
#[derive(Debug, PartialEq, Eq)]
pub struct UpdatePayload {
    pub fetch_id: Uuid,
    pub mode: UpdateMode,
    pub symbols: Vec<String>,
    pub update_data: Vec<Bytes>,
    pub price_ids: Vec<B256>,
    pub publish_times: Vec<u64>,
    /// ABI-encoded call, selector included
    pub calldata: Bytes,
}

impl UpdatePayload {
    pub fn len(&self) -> usize {
        self.update_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.update_data.is_empty()
    }
}

/// Outcome of a submission as reported back to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionResult {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub nonce: u64,
    pub fee_wei: U256,
}

impl SubmissionResult {
    pub fn confirmed(tx_hash: B256, block_number: u64, nonce: u64, fee_wei: U256) -> Self {
        Self {
            tx_hash: format!("{tx_hash:?}"),
            block_number: Some(block_number),
            success: true,
            failure_reason: None,
            nonce,
            fee_wei,
        }
    }
}
