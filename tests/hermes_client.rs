//! HermesClient against a local HTTP server speaking the latest-updates API

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use pythora::adapters::{FeedSource, HermesClient};
use pythora::config::{OracleConfig, SymbolConfig};
use pythora::error::FetchError;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const BTC_ID: &str = "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43";
const ETH_ID: &str = "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace";
const PATH: &str = "/v2/updates/price/latest";

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(endpoint: String, timeout_ms: u64) -> HermesClient {
    HermesClient::new(&OracleConfig {
        endpoint,
        request_timeout_ms: timeout_ms,
        max_attestation_age_secs: 60,
        symbols: vec![
            SymbolConfig {
                symbol: "BTC/USD".to_string(),
                price_id: format!("0x{BTC_ID}"),
            },
            SymbolConfig {
                symbol: "ETH/USD".to_string(),
                price_id: ETH_ID.to_string(),
            },
        ],
    })
    .unwrap()
}

fn update(id: &str, price: &str, publish_time: i64) -> serde_json::Value {
    json!({
        "binary": { "encoding": "hex", "data": [format!("504e4155{}", &id[..8])] },
        "parsed": [{
            "id": id,
            "price": { "price": price, "conf": "1500", "expo": -8, "publish_time": publish_time },
            "ema_price": { "price": price, "conf": "1500", "expo": -8, "publish_time": publish_time },
            "metadata": { "slot": 1, "proof_available_time": publish_time, "prev_publish_time": publish_time - 1 }
        }]
    })
}

async fn latest(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let now = Utc::now().timestamp();
    match params.get("ids[]").map(String::as_str) {
        Some(BTC_ID) => (StatusCode::OK, Json(update(BTC_ID, "6500012345678", now))).into_response(),
        Some(ETH_ID) => (StatusCode::OK, Json(update(ETH_ID, "350000000000", now))).into_response(),
        _ => (StatusCode::NOT_FOUND, "Price ids not found").into_response(),
    }
}

#[tokio::test]
async fn fetches_one_attestation_per_symbol_in_order() {
    let endpoint = serve(Router::new().route(PATH, get(latest))).await;
    let hermes = client(endpoint, 2_000);

    let batch = hermes
        .fetch(&["ETH/USD".to_string(), "BTC/USD".to_string()])
        .await
        .unwrap();

    assert_eq!(batch.symbols(), vec!["ETH/USD", "BTC/USD"]);
    let btc = &batch.attestations()[1];
    assert_eq!(btc.price, 6_500_012_345_678);
    assert_eq!(btc.expo, -8);
    assert_eq!(btc.conf, 1500);
    assert_eq!(&btc.proof[..4], b"PNAU");
    assert_eq!(hex::encode(btc.price_id), BTC_ID);
}

#[tokio::test]
async fn unmapped_symbol_fails_before_any_request() {
    let hermes = client("http://127.0.0.1:1".to_string(), 500);
    let err = hermes
        .fetch(&["BTC/USD".to_string(), "DOGE/USD".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::UnknownSymbol("DOGE/USD".to_string()));
}

#[tokio::test]
async fn not_found_maps_to_unknown_symbol() {
    let endpoint = serve(Router::new().route(
        PATH,
        get(|| async { (StatusCode::NOT_FOUND, "Price ids not found") }),
    ))
    .await;

    let err = client(endpoint, 2_000)
        .fetch(&["BTC/USD".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::UnknownSymbol("BTC/USD".to_string()));
}

#[tokio::test]
async fn server_error_maps_to_status() {
    let endpoint = serve(Router::new().route(
        PATH,
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
    ))
    .await;

    let err = client(endpoint, 2_000)
        .fetch(&["BTC/USD".to_string()])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FetchError::Status {
            status: 503,
            body: "overloaded".to_string()
        }
    );
}

#[tokio::test]
async fn slow_server_times_out() {
    let endpoint = serve(Router::new().route(
        PATH,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        }),
    ))
    .await;

    let err = client(endpoint, 200)
        .fetch(&["BTC/USD".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::Timeout { elapsed_ms: 200 });
}

#[tokio::test]
async fn old_attestation_is_rejected_as_stale() {
    let endpoint = serve(Router::new().route(
        PATH,
        get(|| async {
            let published = Utc::now().timestamp() - 600;
            Json(update(BTC_ID, "6500012345678", published))
        }),
    ))
    .await;

    let err = client(endpoint, 2_000)
        .fetch(&["BTC/USD".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FetchError::StaleAttestation { ref symbol, max_age_secs: 60, .. } if symbol == "BTC/USD"
    ));
}

#[tokio::test]
async fn non_hex_proof_is_malformed() {
    let endpoint = serve(Router::new().route(
        PATH,
        get(|| async {
            let mut body = update(BTC_ID, "1", Utc::now().timestamp());
            body["binary"]["data"] = json!(["not-hex"]);
            Json(body)
        }),
    ))
    .await;

    let err = client(endpoint, 2_000)
        .fetch(&["BTC/USD".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Malformed(_)));
}
