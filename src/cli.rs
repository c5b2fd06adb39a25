use clap::{Parser, Subcommand};
use std::io::{stdout, Write};

use crate::adapters::{ChainClient, FeedSource, PriceUpdateEvent};
use crate::config::AppConfig;
use crate::domain::PriceAttestation;
use crate::error::Result;
use alloy::primitives::B256;
use chrono::Utc;

#[derive(Parser, Debug)]
#[command(name = "pythora")]
#[command(version = "0.1.0")]
#[command(about = "Pushes Pyth price attestations to an EVM contract", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path (defaults to config/default.toml plus PYTHORA_ENV overlay)
    #[arg(short, long, env = "PYTHORA_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run every configured feed until shutdown
    Run,
    /// Run a single cycle for each feed (or one feed) and exit
    Once {
        /// Only run this feed
        #[arg(short, long)]
        feed: Option<String>,
    },
    /// Fetch and print the latest attestations without submitting
    Fetch {
        /// Comma-separated symbols (defaults to every mapped symbol)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Read the price currently stored on chain for a symbol
    Price {
        #[arg(short, long)]
        symbol: String,
        /// Fail unless the stored price is at most this many seconds old
        #[arg(long)]
        max_age: Option<u64>,
    },
    /// List recent PriceFeedUpdate events emitted by the contract
    Updates {
        /// Only this symbol (defaults to every feed)
        #[arg(short, long)]
        symbol: Option<String>,
        /// Number of blocks to search back from the head
        #[arg(long, default_value_t = 1000)]
        look_back: u64,
    },
    /// Validate the configuration and exit
    Validate,
}

fn format_attestation(att: &PriceAttestation, now: chrono::DateTime<Utc>) -> String {
    let price = att
        .price_decimal()
        .map(|p| p.to_string())
        .unwrap_or_else(|| format!("{}e{}", att.price, att.expo));
    let conf = att
        .conf_decimal()
        .map(|c| c.to_string())
        .unwrap_or_else(|| format!("{}e{}", att.conf, att.expo));

    format!(
        "  {:<10} {:>18} ± {:<12} age {:>4}s  proof {} bytes",
        att.symbol,
        price,
        conf,
        att.age_secs(now),
        att.proof.len()
    )
}

/// Fetch and print attestations
pub async fn show_latest_prices(source: &dyn FeedSource, symbols: &[String]) -> Result<()> {
    print!("Fetching {} symbol(s)... ", symbols.len());
    stdout().flush()?;

    let batch = match source.fetch(symbols).await {
        Ok(batch) => batch,
        Err(e) => {
            println!("\x1b[31mFAILED\x1b[0m");
            println!("    Error: {}", e);
            return Err(e.into());
        }
    };

    println!("\x1b[32mOK\x1b[0m (fetch {})\n", batch.fetch_id());
    let now = Utc::now();
    for att in batch.attestations() {
        println!("{}", format_attestation(att, now));
    }
    println!();
    Ok(())
}

/// Print the on-chain price for a feed id, optionally bounded in age
pub async fn show_onchain_price(
    chain: &dyn ChainClient,
    symbol: &str,
    price_id: B256,
    max_age_secs: Option<u64>,
) -> Result<()> {
    println!(
        "Reading {} from contract {}\n",
        symbol,
        chain.contract_address()
    );

    let onchain = match max_age_secs {
        Some(age) => chain.price_no_older_than(price_id, age).await?,
        None => chain.price_unsafe(price_id).await?,
    };
    let price = onchain
        .price_decimal()
        .map(|p| p.to_string())
        .unwrap_or_else(|| format!("{}e{}", onchain.price, onchain.expo));
    let age = Utc::now().timestamp() - onchain.publish_time as i64;

    println!("  Price:        {}", price);
    println!("  Confidence:   {} (expo {})", onchain.conf, onchain.expo);
    println!("  Publish time: {} ({}s ago)", onchain.publish_time, age);
    println!();
    Ok(())
}

fn format_update_event(event: &PriceUpdateEvent, label: &str) -> String {
    let block = event
        .block_number
        .map(|b| b.to_string())
        .unwrap_or_else(|| "pending".to_string());
    let tx = event
        .tx_hash
        .map(|h| h.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  block {:>10}  {:<10} price {:>20} conf {:<12} published {}  tx {}",
        block, label, event.price, event.conf, event.publish_time, tx
    )
}

/// Print `PriceFeedUpdate` events from the last `look_back` blocks
///
/// `symbols` maps feed ids back to configured names; unknown ids print as hex.
pub async fn show_price_updates(
    chain: &dyn ChainClient,
    symbols: &[(String, B256)],
    price_id: Option<B256>,
    look_back: u64,
) -> Result<Vec<PriceUpdateEvent>> {
    let to_block = chain.block_number().await?;
    let from_block = to_block.saturating_sub(look_back);
    println!(
        "PriceFeedUpdate events on {} in blocks {}..={}\n",
        chain.contract_address(),
        from_block,
        to_block
    );

    let events = chain.price_updates(price_id, from_block, to_block).await?;
    for event in &events {
        let label = symbols
            .iter()
            .find(|(_, id)| *id == event.price_id)
            .map(|(symbol, _)| symbol.clone())
            .unwrap_or_else(|| event.price_id.to_string());
        println!("{}", format_update_event(event, &label));
    }
    println!("\n  {} event(s)", events.len());
    Ok(events)
}

/// Print validation results; returns whether the config is usable
pub fn print_validation(config: &AppConfig) -> bool {
    match config.validate() {
        Ok(()) => {
            println!("\x1b[32mConfiguration OK\x1b[0m");
            println!("  Oracle:   {}", config.oracle.endpoint);
            println!(
                "  Chain:    {} (chain id {}, contract {})",
                config.chain.rpc_url, config.chain.chain_id, config.chain.contract_address
            );
            println!("  Mode:     {}", config.chain.update_mode);
            for feed in &config.feeds {
                println!(
                    "  Feed {:<12} every {}s, {}% / {}s, symbols {}",
                    feed.name,
                    feed.update_interval_secs,
                    feed.deviation_threshold_pct,
                    feed.staleness_threshold_secs,
                    feed.symbols.join(",")
                );
            }
            true
        }
        Err(errors) => {
            println!("\x1b[31mConfiguration invalid\x1b[0m");
            for e in errors {
                println!("  - {}", e);
            }
            false
        }
    }
}
