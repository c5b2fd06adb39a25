use alloy::primitives::B256;
use clap::Parser;
use pythora::adapters::{AlloyChainClient, HermesClient};
use pythora::config::AppConfig;
use pythora::cli::{self, Cli, Commands};
use pythora::error::{PythoraError, Result};
use tracing::info;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, load_config, run_once, run_service};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_logging(&config.logging);
            validate(&config)?;
            info!(
                feeds = config.feeds.len(),
                mode = %config.chain.update_mode,
                "Starting pythora price pusher"
            );
            run_service(config).await?;
        }
        Commands::Once { feed } => {
            let _guard = init_logging(&config.logging);
            validate(&config)?;
            run_once(config, feed.as_deref()).await?;
        }
        Commands::Fetch { symbols } => {
            init_logging_simple();
            let symbols = if symbols.is_empty() {
                config.oracle.symbols.iter().map(|s| s.symbol.clone()).collect()
            } else {
                symbols
            };
            let source = HermesClient::new(&config.oracle)?;
            cli::show_latest_prices(&source, &symbols).await?;
        }
        Commands::Price { symbol, max_age } => {
            init_logging_simple();
            let price_id = mapped_price_id(&config, &symbol)?;
            let chain = read_only_chain(&config)?;
            cli::show_onchain_price(&chain, &symbol, price_id, max_age).await?;
        }
        Commands::Updates { symbol, look_back } => {
            init_logging_simple();
            let price_id = symbol
                .as_deref()
                .map(|s| mapped_price_id(&config, s))
                .transpose()?;
            let symbols: Vec<(String, B256)> = config
                .oracle
                .symbols
                .iter()
                .filter_map(|s| Some((s.symbol.clone(), config.price_id(&s.symbol)?)))
                .collect();
            let chain = read_only_chain(&config)?;
            cli::show_price_updates(&chain, &symbols, price_id, look_back).await?;
        }
        Commands::Validate => {
            if !cli::print_validation(&config) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    config.validate().map_err(PythoraError::InvalidConfig)
}

fn mapped_price_id(config: &AppConfig, symbol: &str) -> Result<B256> {
    config.price_id(symbol).ok_or_else(|| {
        PythoraError::InvalidConfig(vec![format!("symbol {symbol} is not mapped")])
    })
}

fn read_only_chain(config: &AppConfig) -> Result<AlloyChainClient> {
    let contract = config
        .chain
        .contract_address()
        .map_err(PythoraError::AddressParsing)?;
    AlloyChainClient::read_only(&config.chain.rpc_url, contract)
}
