//! Last-pushed price per symbol and the push gate built on it

use crate::config::FeedConfig;
use crate::domain::AttestationBatch;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

/// Price last confirmed on chain for a symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedPrice {
    pub price: Decimal,
    pub publish_time: i64,
    pub pushed_at: DateTime<Utc>,
}

/// Why a symbol needs a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushReason {
    /// Nothing pushed for this symbol yet
    FirstObservation,
    /// Deviation gating disabled or not computable
    Always,
    /// Price moved at least the threshold
    Deviation { pct: Decimal },
    /// Last push older than the staleness threshold
    Stale { age_secs: i64 },
}

impl std::fmt::Display for PushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushReason::FirstObservation => write!(f, "first observation"),
            PushReason::Always => write!(f, "always"),
            PushReason::Deviation { pct } => write!(f, "deviation {}%", pct.round_dp(4)),
            PushReason::Stale { age_secs } => write!(f, "stale {}s", age_secs),
        }
    }
}

/// Push gate verdict for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushDecision {
    /// Symbols that need a push, with the reason
    pub triggers: Vec<(String, PushReason)>,
}

impl PushDecision {
    /// The whole batch is pushed when any symbol needs it
    pub fn should_push(&self) -> bool {
        !self.triggers.is_empty()
    }

    pub fn describe(&self) -> String {
        self.triggers
            .iter()
            .map(|(symbol, reason)| format!("{}: {}", symbol, reason))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Shared cache of last pushed prices, keyed by symbol
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: DashMap<String, PushedPrice>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<PushedPrice> {
        self.prices.get(symbol).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Decide whether `batch` warrants an on-chain update for `feed`
    pub fn evaluate(
        &self,
        batch: &AttestationBatch,
        feed: &FeedConfig,
        now: DateTime<Utc>,
    ) -> PushDecision {
        let mut decision = PushDecision::default();

        for att in batch.attestations() {
            let reason = match (self.prices.get(&att.symbol), att.price_decimal()) {
                (None, _) => Some(PushReason::FirstObservation),
                // Unrepresentable price: let the contract decide
                (Some(_), None) => Some(PushReason::Always),
                (Some(last), Some(current)) => {
                    let age_secs = (now - last.pushed_at).num_seconds();
                    if feed.deviation_threshold_pct.is_zero() {
                        Some(PushReason::Always)
                    } else if feed.staleness_threshold_secs > 0
                        && age_secs >= feed.staleness_threshold_secs as i64
                    {
                        Some(PushReason::Stale { age_secs })
                    } else {
                        match deviation_pct(last.price, current) {
                            Some(pct) if pct >= feed.deviation_threshold_pct => {
                                Some(PushReason::Deviation { pct })
                            }
                            Some(_) => None,
                            // Moved away from zero
                            None => Some(PushReason::Always),
                        }
                    }
                }
            };

            if let Some(reason) = reason {
                decision.triggers.push((att.symbol.clone(), reason));
            }
        }

        decision
    }

    /// Remember the prices of a batch that was confirmed on chain
    pub fn record(&self, batch: &AttestationBatch, pushed_at: DateTime<Utc>) {
        for att in batch.attestations() {
            if let Some(price) = att.price_decimal() {
                self.prices.insert(
                    att.symbol.clone(),
                    PushedPrice {
                        price,
                        publish_time: att.publish_time,
                        pushed_at,
                    },
                );
            }
        }
    }
}

/// Absolute change from `previous` to `current` in percent
fn deviation_pct(previous: Decimal, current: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        return if current.is_zero() {
            Some(Decimal::ZERO)
        } else {
            None
        };
    }
    let diff = (current - previous).abs();
    diff.checked_mul(Decimal::ONE_HUNDRED)?
        .checked_div(previous.abs())
}
