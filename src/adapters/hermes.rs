//! Hermes price-oracle client
//!
//! Fetches the latest signed price updates for a set of symbols. Each symbol
//! is requested on its own so every attestation carries its own proof blob;
//! the requests run concurrently and any single failure fails the whole fetch.

use crate::config::{parse_price_id, OracleConfig};
use crate::domain::{AttestationBatch, PriceAttestation};
use crate::error::{FetchError, PythoraError, Result};
use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const LATEST_UPDATES_PATH: &str = "/v2/updates/price/latest";

/// Source of price attestations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// One attestation per requested symbol, in request order, or an error
    async fn fetch(&self, symbols: &[String]) -> std::result::Result<AttestationBatch, FetchError>;
}

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
struct LatestUpdatesResponse {
    binary: BinaryUpdate,
    #[serde(default)]
    parsed: Vec<ParsedPriceUpdate>,
}

#[derive(Debug, Deserialize)]
struct BinaryUpdate {
    encoding: String,
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ParsedPriceUpdate {
    id: String,
    price: RpcPrice,
}

#[derive(Debug, Deserialize)]
struct RpcPrice {
    price: StrOrNum,
    conf: StrOrNum,
    expo: i32,
    publish_time: i64,
}

/// Hermes encodes 64-bit integers as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StrOrNum {
    Str(String),
    Num(i64),
}

impl StrOrNum {
    fn as_i128(&self) -> Option<i128> {
        match self {
            StrOrNum::Str(s) => s.trim().parse().ok(),
            StrOrNum::Num(n) => Some(*n as i128),
        }
    }
}

fn normalize_id(id: &str) -> String {
    id.trim().trim_start_matches("0x").to_ascii_lowercase()
}

// ==================== Client ====================

/// HTTP client for a Hermes-compatible endpoint
#[derive(Clone)]
pub struct HermesClient {
    http: Client,
    endpoint: String,
    price_ids: HashMap<String, B256>,
    timeout: Duration,
    max_attestation_age_secs: u64,
}

impl HermesClient {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PythoraError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let mut price_ids = HashMap::with_capacity(config.symbols.len());
        for s in &config.symbols {
            let id = parse_price_id(&s.price_id).map_err(PythoraError::Internal)?;
            price_ids.insert(s.symbol.clone(), id);
        }

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            price_ids,
            timeout,
            max_attestation_age_secs: config.max_attestation_age_secs,
        })
    }

    pub fn price_id(&self, symbol: &str) -> Option<B256> {
        self.price_ids.get(symbol).copied()
    }

    fn map_transport_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                elapsed_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch_one(&self, symbol: &str) -> std::result::Result<PriceAttestation, FetchError> {
        let price_id = self
            .price_id(symbol)
            .ok_or_else(|| FetchError::UnknownSymbol(symbol.to_string()))?;
        let id_hex = hex::encode(price_id);

        let url = format!("{}{}", self.endpoint, LATEST_UPDATES_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("ids[]", id_hex.as_str()),
                ("encoding", "hex"),
                ("parsed", "true"),
            ])
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Err(FetchError::UnknownSymbol(symbol.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let parsed: LatestUpdatesResponse = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("{}: {}", symbol, e)))?;

        let attestation = self.to_attestation(symbol, price_id, parsed)?;
        self.check_age(&attestation)?;

        debug!(
            symbol,
            price = attestation.price,
            expo = attestation.expo,
            publish_time = attestation.publish_time,
            "Fetched attestation"
        );
        Ok(attestation)
    }

    fn to_attestation(
        &self,
        symbol: &str,
        price_id: B256,
        response: LatestUpdatesResponse,
    ) -> std::result::Result<PriceAttestation, FetchError> {
        let wanted = hex::encode(price_id);
        let update = response
            .parsed
            .into_iter()
            .find(|p| normalize_id(&p.id) == wanted)
            .ok_or_else(|| FetchError::UnknownSymbol(symbol.to_string()))?;

        if !response.binary.encoding.eq_ignore_ascii_case("hex") {
            return Err(FetchError::Malformed(format!(
                "{}: unsupported binary encoding {}",
                symbol, response.binary.encoding
            )));
        }
        let [blob] = response.binary.data.as_slice() else {
            return Err(FetchError::Malformed(format!(
                "{}: expected one update blob, got {}",
                symbol,
                response.binary.data.len()
            )));
        };
        let proof = hex::decode(blob.trim_start_matches("0x"))
            .map_err(|e| FetchError::Malformed(format!("{}: proof is not hex: {}", symbol, e)))?;

        let price = update
            .price
            .price
            .as_i128()
            .and_then(|p| i64::try_from(p).ok())
            .ok_or_else(|| FetchError::Malformed(format!("{}: bad price", symbol)))?;
        let conf = update
            .price
            .conf
            .as_i128()
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| FetchError::Malformed(format!("{}: bad confidence", symbol)))?;

        Ok(PriceAttestation {
            symbol: symbol.to_string(),
            price_id,
            price,
            conf,
            expo: update.price.expo,
            publish_time: update.price.publish_time,
            proof: Bytes::from(proof),
        })
    }

    fn check_age(&self, attestation: &PriceAttestation) -> std::result::Result<(), FetchError> {
        if self.max_attestation_age_secs == 0 {
            return Ok(());
        }
        let age = attestation.age_secs(Utc::now());
        if age > self.max_attestation_age_secs as i64 {
            warn!(
                symbol = %attestation.symbol,
                age_secs = age,
                "Oracle returned a stale attestation"
            );
            return Err(FetchError::StaleAttestation {
                symbol: attestation.symbol.clone(),
                age_secs: age,
                max_age_secs: self.max_attestation_age_secs,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FeedSource for HermesClient {
    async fn fetch(&self, symbols: &[String]) -> std::result::Result<AttestationBatch, FetchError> {
        // Resolve everything first so an unmapped symbol costs no requests
        if let Some(unknown) = symbols.iter().find(|s| !self.price_ids.contains_key(*s)) {
            return Err(FetchError::UnknownSymbol(unknown.clone()));
        }

        let attestations = try_join_all(symbols.iter().map(|s| self.fetch_one(s))).await?;
        Ok(AttestationBatch::new(attestations))
    }
}

impl std::fmt::Debug for HermesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HermesClient")
            .field("endpoint", &self.endpoint)
            .field("symbols", &self.price_ids.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
