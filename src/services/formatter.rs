//! Builds the on-chain update payload from a fetched attestation batch

use crate::adapters::evm::IPyth;
use crate::domain::{AttestationBatch, UpdateMode, UpdatePayload};
use crate::error::EncodingError;
use alloy::primitives::{Bytes, B256};
use alloy::sol_types::SolCall;
use std::collections::HashSet;

/// Magic prefix of an accumulator price update ("PNAU")
pub const ACCUMULATOR_MAGIC: [u8; 4] = *b"PNAU";

/// Validate a batch and ABI-encode the contract call for it
///
/// Output order follows the batch order, so the same batch always encodes
/// to the same calldata.
pub fn format_update(
    batch: &AttestationBatch,
    mode: UpdateMode,
) -> Result<UpdatePayload, EncodingError> {
    if batch.is_empty() {
        return Err(EncodingError::Empty);
    }

    let mut seen = HashSet::with_capacity(batch.len());
    let mut update_data = Vec::with_capacity(batch.len());
    let mut price_ids = Vec::with_capacity(batch.len());
    let mut publish_times = Vec::with_capacity(batch.len());
    let mut symbols = Vec::with_capacity(batch.len());

    for att in batch.attestations() {
        if att.symbol.trim().is_empty() {
            return Err(EncodingError::MissingField {
                symbol: att.symbol.clone(),
                field: "symbol",
            });
        }
        if att.price_id == B256::ZERO {
            return Err(EncodingError::MissingField {
                symbol: att.symbol.clone(),
                field: "price_id",
            });
        }
        if att.publish_time <= 0 {
            return Err(EncodingError::MissingField {
                symbol: att.symbol.clone(),
                field: "publish_time",
            });
        }
        if att.proof.is_empty() {
            return Err(EncodingError::MissingField {
                symbol: att.symbol.clone(),
                field: "proof",
            });
        }
        if !att.proof.starts_with(&ACCUMULATOR_MAGIC) {
            return Err(EncodingError::MalformedProof {
                symbol: att.symbol.clone(),
                reason: format!(
                    "expected PNAU header, got 0x{}",
                    hex::encode(&att.proof[..att.proof.len().min(4)])
                ),
            });
        }
        if !seen.insert(att.price_id) {
            return Err(EncodingError::DuplicateFeed {
                symbol: att.symbol.clone(),
            });
        }

        update_data.push(att.proof.clone());
        price_ids.push(att.price_id);
        publish_times.push(att.publish_time as u64);
        symbols.push(att.symbol.clone());
    }

    let calldata = encode_call(mode, &update_data, &price_ids, &publish_times);

    Ok(UpdatePayload {
        fetch_id: batch.fetch_id(),
        mode,
        symbols,
        update_data,
        price_ids,
        publish_times,
        calldata,
    })
}

fn encode_call(
    mode: UpdateMode,
    update_data: &[Bytes],
    price_ids: &[B256],
    publish_times: &[u64],
) -> Bytes {
    let encoded = match mode {
        UpdateMode::Always => IPyth::updatePriceFeedsCall {
            updateData: update_data.to_vec(),
        }
        .abi_encode(),
        UpdateMode::IfNecessary => IPyth::updatePriceFeedsIfNecessaryCall {
            updateData: update_data.to_vec(),
            priceIds: price_ids.to_vec(),
            publishTimes: publish_times.to_vec(),
        }
        .abi_encode(),
    };
    Bytes::from(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceAttestation;

    fn attestation(symbol: &str, id_byte: u8, proof: &'static [u8]) -> PriceAttestation {
        PriceAttestation {
            symbol: symbol.to_string(),
            price_id: B256::repeat_byte(id_byte),
            price: 6_500_012,
            conf: 5,
            expo: -2,
            publish_time: 1_718_000_000,
            proof: Bytes::from_static(proof),
        }
    }

    #[test]
    fn test_formats_update_price_feeds_call() {
        let batch = AttestationBatch::new(vec![
            attestation("BTC/USD", 1, b"PNAU\x01"),
            attestation("ETH/USD", 2, b"PNAU\x02"),
        ]);

        let payload = format_update(&batch, UpdateMode::Always).unwrap();

        assert_eq!(payload.fetch_id, batch.fetch_id());
        assert_eq!(payload.symbols, vec!["BTC/USD", "ETH/USD"]);
        assert_eq!(payload.update_data.len(), 2);
        assert_eq!(&payload.calldata[..4], &IPyth::updatePriceFeedsCall::SELECTOR);

        let decoded = IPyth::updatePriceFeedsCall::abi_decode(&payload.calldata).unwrap();
        assert_eq!(decoded.updateData, payload.update_data);
    }

    #[test]
    fn test_if_necessary_carries_ids_and_times() {
        let batch = AttestationBatch::new(vec![attestation("BTC/USD", 1, b"PNAU")]);
        let payload = format_update(&batch, UpdateMode::IfNecessary).unwrap();

        assert_eq!(
            &payload.calldata[..4],
            &IPyth::updatePriceFeedsIfNecessaryCall::SELECTOR
        );
        let decoded =
            IPyth::updatePriceFeedsIfNecessaryCall::abi_decode(&payload.calldata).unwrap();
        assert_eq!(decoded.priceIds, vec![B256::repeat_byte(1)]);
        assert_eq!(decoded.publishTimes, vec![1_718_000_000u64]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let batch = AttestationBatch::new(vec![
            attestation("BTC/USD", 1, b"PNAU\x01"),
            attestation("ETH/USD", 2, b"PNAU\x02"),
        ]);
        let a = format_update(&batch, UpdateMode::Always).unwrap();
        let b = format_update(&batch, UpdateMode::Always).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let batch = AttestationBatch::new(vec![]);
        assert_eq!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::Empty)
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut att = attestation("BTC/USD", 1, b"PNAU");
        att.publish_time = 0;
        let batch = AttestationBatch::new(vec![att]);
        assert!(matches!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::MissingField { field: "publish_time", .. })
        ));

        let batch = AttestationBatch::new(vec![attestation("BTC/USD", 1, b"")]);
        assert!(matches!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::MissingField { field: "proof", .. })
        ));

        let batch = AttestationBatch::new(vec![attestation("BTC/USD", 0, b"PNAU")]);
        assert!(matches!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::MissingField { field: "price_id", .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let batch = AttestationBatch::new(vec![attestation("BTC/USD", 1, b"\x01\x00\x00\x00\x00")]);
        assert!(matches!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::MalformedProof { .. })
        ));
    }

    #[test]
    fn test_duplicate_feed_rejected() {
        let batch = AttestationBatch::new(vec![
            attestation("BTC/USD", 1, b"PNAU"),
            attestation("BTC/USD", 1, b"PNAU"),
        ]);
        assert_eq!(
            format_update(&batch, UpdateMode::Always),
            Err(EncodingError::DuplicateFeed {
                symbol: "BTC/USD".to_string()
            })
        );
    }
}
