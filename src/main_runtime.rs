use pythora::adapters::{AlloyChainClient, ChainClient, FeedSource, HermesClient};
use pythora::config::{AppConfig, LoggingConfig};
use pythora::coordination::{GracefulShutdown, ShutdownConfig};
use pythora::error::{PythoraError, Result};
use pythora::services::{
    CycleContext, FeedRunner, HealthServer, Metrics, Scheduler, SubmissionQueue, SubmitterConfig,
};
use pythora::signing::Wallet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => AppConfig::load_file(p)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

/// Console logging plus an optional daily rolling file; keep the guard alive
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},pythora=debug", config.level)));

    // `rolling::daily` panics if the first file cannot be created, so check first
    let (file_layer, guard) = match config.dir.as_deref() {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "pythora.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        Some(dir) => {
            eprintln!("Warning: could not create log directory {dir}, file logging disabled");
            (None, None)
        }
        None => (None, None),
    };

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn load_wallet(signer_env: Option<&str>, chain_id: u64) -> Result<Wallet> {
    match signer_env {
        Some(var) => Wallet::from_env_var(var, chain_id),
        None => Wallet::from_env(chain_id),
    }
}

/// Feed runners sharing one submission queue per distinct signing address
pub struct Runtime {
    pub runners: Vec<Arc<FeedRunner>>,
    pub workers: Vec<JoinHandle<()>>,
    pub ctx: CycleContext,
}

pub fn build_runtime(
    config: &AppConfig,
    only_feed: Option<&str>,
    shutdown: &GracefulShutdown,
) -> Result<Runtime> {
    let metrics = Arc::new(Metrics::new());
    let ctx = CycleContext::new(Arc::clone(&metrics));
    let source: Arc<dyn FeedSource> = Arc::new(HermesClient::new(&config.oracle)?);
    let submitter_config = SubmitterConfig::from_chain(&config.chain)?;

    let feeds: Vec<_> = match only_feed {
        Some(name) => vec![config
            .feed(name)
            .ok_or_else(|| PythoraError::InvalidConfig(vec![format!("unknown feed {name}")]))?],
        None => config.feeds.iter().collect(),
    };

    let mut queues: HashMap<alloy::primitives::Address, SubmissionQueue> = HashMap::new();
    let mut workers = Vec::new();
    let mut runners = Vec::with_capacity(feeds.len());

    for feed in feeds {
        let wallet = load_wallet(feed.signer_env.as_deref(), config.chain.chain_id)?;
        let queue = match queues.get(&wallet.address()) {
            Some(queue) => queue.clone(),
            None => {
                let chain: Arc<dyn ChainClient> = Arc::new(AlloyChainClient::new(
                    &config.chain.rpc_url,
                    &wallet,
                    submitter_config.contract,
                    submitter_config.gas_limit,
                )?);
                let (queue, worker) = SubmissionQueue::spawn(
                    chain,
                    submitter_config.clone(),
                    Arc::clone(&metrics),
                )?;
                workers.push(worker);
                queues.insert(wallet.address(), queue.clone());
                queue
            }
        };

        info!(feed = %feed.name, signer = %queue.signer(), "Feed configured");
        runners.push(Arc::new(FeedRunner::new(
            feed.clone(),
            config.chain.update_mode,
            Arc::clone(&source),
            queue,
            ctx.clone(),
            &config.scheduler,
            shutdown.token(),
        )));
    }

    Ok(Runtime {
        runners,
        workers,
        ctx,
    })
}

fn shutdown_for(config: &AppConfig) -> Arc<GracefulShutdown> {
    Arc::new(GracefulShutdown::new(ShutdownConfig {
        drain_timeout_secs: config.scheduler.drain_timeout_secs,
        ..ShutdownConfig::default()
    }))
}

pub async fn run_service(config: AppConfig) -> Result<()> {
    let shutdown = shutdown_for(&config);
    let runtime = build_runtime(&config, None, &shutdown)?;

    if let Some(port) = config.health_port {
        let server = HealthServer::new(Arc::clone(&runtime.ctx.health), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Health server stopped");
            }
        });
    }

    pythora::coordination::install_signal_handlers(Arc::clone(&shutdown));

    let scheduler = Scheduler::new(
        runtime.runners,
        runtime.workers,
        Arc::clone(&runtime.ctx.metrics),
        shutdown,
        &config.scheduler,
    );

    scheduler
        .run()
        .await
        .map_err(|e| PythoraError::Internal(e.to_string()))
}

/// One cycle per feed; fails when any feed failed
pub async fn run_once(config: AppConfig, feed: Option<&str>) -> Result<()> {
    let shutdown = shutdown_for(&config);
    let runtime = build_runtime(&config, feed, &shutdown)?;
    let scheduler = Scheduler::new(
        runtime.runners,
        runtime.workers,
        Arc::clone(&runtime.ctx.metrics),
        shutdown,
        &config.scheduler,
    );

    let mut failed = Vec::new();
    for (name, outcome) in scheduler.run_once().await {
        info!(feed = %name, ?outcome, "Cycle finished");
        if !outcome.is_success() {
            failed.push(name);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(PythoraError::Internal(format!(
            "cycle failed for feed(s): {}",
            failed.join(", ")
        )))
    }
}
