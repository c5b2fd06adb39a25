use crate::domain::UpdateMode;
use alloy::primitives::{Address, B256};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (disabled when unset)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Hermes-compatible base URL
    pub endpoint: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Reject attestations published longer ago than this
    #[serde(default = "default_max_attestation_age_secs")]
    pub max_attestation_age_secs: u64,
    /// Symbol to price feed id mapping
    pub symbols: Vec<SymbolConfig>,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_attestation_age_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    /// Human symbol (e.g., "BTC/USD")
    pub symbol: String,
    /// 32-byte hex feed id
    pub price_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// EVM JSON-RPC endpoint
    pub rpc_url: String,
    pub chain_id: u64,
    /// Pyth contract address
    pub contract_address: String,
    /// Blocks counted from the inclusion block (1 = included)
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    #[serde(default)]
    pub update_mode: UpdateMode,
    /// Fixed gas limit; estimated by the node when unset
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

fn default_confirmations() -> u64 {
    2
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_receipt_poll_interval_ms() -> u64 {
    1000
}

impl ChainConfig {
    pub fn contract_address(&self) -> Result<Address, String> {
        Address::from_str(self.contract_address.trim())
            .map_err(|e| format!("invalid contract_address {}: {e}", self.contract_address))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Base backoff after a failed cycle
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Fresh-cycle retries after a retryable submission failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failed cycles before the feed's circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Time allowed for in-flight cycles on shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Interval of the counters summary log (0 disables)
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    300
}

fn default_drain_timeout_secs() -> u64 {
    60
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

/// One independently scheduled set of symbols
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub symbols: Vec<String>,
    pub update_interval_secs: u64,
    /// Push when the price moved at least this many percent since the last push
    pub deviation_threshold_pct: Decimal,
    /// Push at least this often regardless of deviation
    pub staleness_threshold_secs: u64,
    /// Environment variable holding this feed's signing key (default key when unset)
    #[serde(default)]
    pub signer_env: Option<String>,
}

impl FeedConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a 32-byte feed id, with or without `0x`
pub fn parse_price_id(raw: &str) -> Result<B256, String> {
    B256::from_str(raw.trim()).map_err(|e| format!("invalid price id {raw}: {e}"))
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("oracle.request_timeout_ms", 5000)?
            .set_default("chain.confirmations", 2)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PYTHORA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PYTHORA_CHAIN__RPC_URL, etc.)
            .add_source(
                Environment::with_prefix("PYTHORA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single config file (used by the `--config` flag)
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("PYTHORA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create a default configuration pushing BTC/USD and ETH/USD
    pub fn default_config(rpc_url: &str, contract_address: &str) -> Self {
        use rust_decimal_macros::dec;

        Self {
            oracle: OracleConfig {
                endpoint: "https://hermes.pyth.network".to_string(),
                request_timeout_ms: 5000,
                max_attestation_age_secs: 60,
                symbols: vec![
                    SymbolConfig {
                        symbol: "BTC/USD".to_string(),
                        price_id:
                            "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43"
                                .to_string(),
                    },
                    SymbolConfig {
                        symbol: "ETH/USD".to_string(),
                        price_id:
                            "0xff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace"
                                .to_string(),
                    },
                ],
            },
            chain: ChainConfig {
                rpc_url: rpc_url.to_string(),
                chain_id: 1,
                contract_address: contract_address.to_string(),
                confirmations: 2,
                confirmation_timeout_secs: 60,
                receipt_poll_interval_ms: 1000,
                update_mode: UpdateMode::Always,
                gas_limit: None,
            },
            scheduler: SchedulerConfig::default(),
            feeds: vec![
                FeedConfig {
                    name: "btc-usd".to_string(),
                    symbols: vec!["BTC/USD".to_string()],
                    update_interval_secs: 10,
                    deviation_threshold_pct: dec!(0.5),
                    staleness_threshold_secs: 3600,
                    signer_env: None,
                },
                FeedConfig {
                    name: "eth-usd".to_string(),
                    symbols: vec!["ETH/USD".to_string()],
                    update_interval_secs: 10,
                    deviation_threshold_pct: dec!(0.5),
                    staleness_threshold_secs: 3600,
                    signer_env: None,
                },
            ],
            logging: LoggingConfig::default(),
            health_port: None,
        }
    }

    /// Feed id for a configured symbol
    pub fn price_id(&self, symbol: &str) -> Option<B256> {
        self.oracle
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(|s| parse_price_id(&s.price_id).ok())
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.name == name)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Oracle
        if url::Url::parse(&self.oracle.endpoint).is_err() {
            errors.push(format!("oracle.endpoint is not a URL: {}", self.oracle.endpoint));
        }
        if self.oracle.request_timeout_ms == 0 {
            errors.push("oracle.request_timeout_ms must be positive".to_string());
        }
        let mut known_symbols = HashSet::new();
        let mut price_ids = HashMap::new();
        for s in &self.oracle.symbols {
            if !known_symbols.insert(s.symbol.as_str()) {
                errors.push(format!("symbol {} is mapped twice", s.symbol));
            }
            match parse_price_id(&s.price_id) {
                Ok(id) => {
                    if let Some(first) = price_ids.insert(id, s.symbol.as_str()) {
                        errors.push(format!(
                            "symbols {} and {} map to the same price_id {}",
                            first, s.symbol, id
                        ));
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        // Chain
        if url::Url::parse(&self.chain.rpc_url).is_err() {
            errors.push(format!("chain.rpc_url is not a URL: {}", self.chain.rpc_url));
        }
        if let Err(e) = self.chain.contract_address() {
            errors.push(e);
        }
        if self.chain.confirmations == 0 {
            errors.push("chain.confirmations must be at least 1".to_string());
        }
        if self.chain.confirmation_timeout_secs == 0 {
            errors.push("chain.confirmation_timeout_secs must be positive".to_string());
        }

        // Scheduler
        if self.scheduler.max_backoff_ms < self.scheduler.retry_backoff_ms {
            errors.push("scheduler.max_backoff_ms must be >= retry_backoff_ms".to_string());
        }
        if self.scheduler.failure_threshold == 0 {
            errors.push("scheduler.failure_threshold must be positive".to_string());
        }

        // Feeds
        if self.feeds.is_empty() {
            errors.push("at least one feed must be configured".to_string());
        }
        let mut names = HashSet::new();
        for feed in &self.feeds {
            if !names.insert(feed.name.as_str()) {
                errors.push(format!("feed name {} is used twice", feed.name));
            }
            if feed.symbols.is_empty() {
                errors.push(format!("feed {} has no symbols", feed.name));
            }
            let mut feed_symbols = HashSet::new();
            for symbol in &feed.symbols {
                if !feed_symbols.insert(symbol.as_str()) {
                    errors.push(format!("feed {} lists symbol {} twice", feed.name, symbol));
                }
                if !known_symbols.contains(symbol.as_str()) {
                    errors.push(format!(
                        "feed {} references unmapped symbol {}",
                        feed.name, symbol
                    ));
                }
            }
            if feed.update_interval_secs == 0 {
                errors.push(format!("feed {} update_interval_secs must be positive", feed.name));
            }
            if feed.deviation_threshold_pct < Decimal::ZERO {
                errors.push(format!(
                    "feed {} deviation_threshold_pct must not be negative",
                    feed.name
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
