//! Cycle scheduler
//!
//! Each feed gets its own ticker task. A tick starts one fetch → format →
//! submit cycle as a separate task; a tick that lands while the previous
//! cycle is still running is skipped. Retryable submission failures start a
//! fresh cycle (new fetch) after an exponential backoff.

use crate::adapters::FeedSource;
use crate::config::{FeedConfig, SchedulerConfig};
use crate::coordination::{
    FeedCircuitBreaker, FeedCircuitBreakerConfig, GracefulShutdown, ShutdownError, ShutdownToken,
};
use crate::domain::{CycleState, SubmissionResult, UpdateMode};
use crate::error::CycleError;
use crate::services::formatter::format_update;
use crate::services::{HealthState, Metrics, PriceCache, SubmissionQueue};
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Result of one cycle, including its retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Update confirmed on chain
    Pushed(SubmissionResult),
    /// Push gate found every symbol within bounds
    NoUpdateNeeded,
    Failed(CycleError),
    /// Fatal error, the feed no longer runs
    Halted(CycleError),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Pushed(_) | CycleOutcome::NoUpdateNeeded)
    }
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    SkippedInFlight,
    SkippedCircuitOpen,
    Halted,
}

/// Exponential backoff with jitter for retryable submission failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            max_retries: config.max_retries,
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt,
    /// capped, plus up to 25% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let jitter_ms = (delay.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Services shared by every feed
#[derive(Clone)]
pub struct CycleContext {
    pub cache: Arc<PriceCache>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthState>,
}

impl CycleContext {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            cache: Arc::new(PriceCache::new()),
            health: Arc::new(HealthState::new().with_metrics(Arc::clone(&metrics))),
            metrics,
        }
    }
}

/// Clears the in-flight flag when a cycle task ends, even on panic
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives the cycles of one feed
pub struct FeedRunner {
    feed: FeedConfig,
    mode: UpdateMode,
    source: Arc<dyn FeedSource>,
    queue: SubmissionQueue,
    ctx: CycleContext,
    breaker: FeedCircuitBreaker,
    retry: RetryPolicy,
    state: RwLock<CycleState>,
    in_flight: AtomicBool,
    halted: AtomicBool,
    shutdown: ShutdownToken,
}

impl FeedRunner {
    pub fn new(
        feed: FeedConfig,
        mode: UpdateMode,
        source: Arc<dyn FeedSource>,
        queue: SubmissionQueue,
        ctx: CycleContext,
        config: &SchedulerConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        ctx.health.register_feed(&feed.name);
        Self {
            breaker: FeedCircuitBreaker::new(
                feed.name.clone(),
                FeedCircuitBreakerConfig::from(config),
            ),
            retry: RetryPolicy::from_config(config),
            feed,
            mode,
            source,
            queue,
            ctx,
            state: RwLock::new(CycleState::Idle),
            in_flight: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.feed.name
    }

    pub fn feed(&self) -> &FeedConfig {
        &self.feed
    }

    pub fn queue(&self) -> &SubmissionQueue {
        &self.queue
    }

    pub fn breaker(&self) -> &FeedCircuitBreaker {
        &self.breaker
    }

    pub async fn state(&self) -> CycleState {
        *self.state.read().await
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn transition(&self, next: CycleState) {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            warn!(
                feed = %self.feed.name,
                from = %*state,
                to = %next,
                "Unexpected cycle state transition"
            );
        }
        debug!(feed = %self.feed.name, from = %*state, to = %next, "Cycle state");
        *state = next;
        self.ctx.health.set_feed_state(&self.feed.name, next);
    }

    /// Handle a scheduler tick, spawning a cycle into `cycles` when allowed
    pub async fn tick(self: &Arc<Self>, cycles: &mut JoinSet<CycleOutcome>) -> TickOutcome {
        self.ctx.metrics.inc_ticks();

        if self.is_halted() {
            return TickOutcome::Halted;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.ctx.metrics.inc_skipped_in_flight();
            debug!(feed = %self.feed.name, "Previous cycle still in flight, skipping tick");
            return TickOutcome::SkippedInFlight;
        }

        if !self.breaker.should_allow().await {
            self.in_flight.store(false, Ordering::SeqCst);
            self.ctx.metrics.inc_skipped_circuit_open();
            let retry_in_secs = self.breaker.time_until_recovery().await;
            debug!(feed = %self.feed.name, retry_in_secs, "Circuit open, skipping tick");
            return TickOutcome::SkippedCircuitOpen;
        }

        self.ctx.metrics.inc_cycles_started();
        let runner = Arc::clone(self);
        cycles.spawn(async move {
            let _guard = InFlightGuard(&runner.in_flight);
            runner.run_once().await
        });
        TickOutcome::Started
    }

    /// Run one cycle, retrying retryable submission failures with a fresh fetch
    pub async fn run_once(&self) -> CycleOutcome {
        let mut attempt = 0u32;

        loop {
            let span = info_span!(
                "cycle",
                feed = %self.feed.name,
                attempt,
                fetch_id = tracing::field::Empty,
            );

            let err = match self.run_cycle().instrument(span).await {
                Ok(Some(result)) => {
                    self.breaker.record_success().await;
                    self.ctx.health.record_success(&self.feed.name, Some(&result));
                    return CycleOutcome::Pushed(result);
                }
                Ok(None) => {
                    self.breaker.record_success().await;
                    self.ctx.health.record_success(&self.feed.name, None);
                    return CycleOutcome::NoUpdateNeeded;
                }
                Err(err) => err,
            };

            self.ctx.metrics.record_cycle_error(&err);
            self.transition(CycleState::Failed).await;
            warn!(
                feed = %self.feed.name,
                stage = err.stage(),
                attempt,
                error = %err,
                "Cycle failed"
            );

            if err.is_fatal() {
                self.halt(&err).await;
                return CycleOutcome::Halted(err);
            }

            self.transition(CycleState::Idle).await;

            if err.is_retryable() && attempt < self.retry.max_retries {
                let delay = self.retry.backoff(attempt);
                attempt += 1;
                self.ctx.metrics.inc_retries();
                info!(
                    feed = %self.feed.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying with a fresh fetch"
                );
                if self.sleep_unless_shutdown(delay).await {
                    continue;
                }
                info!(feed = %self.feed.name, "Shutdown during backoff, abandoning retry");
            }

            self.breaker.record_failure(&err.to_string()).await;
            self.ctx.health.record_failure(&self.feed.name, &err.to_string());
            return CycleOutcome::Failed(err);
        }
    }

    /// One fetch → gate → format → submit pass
    async fn run_cycle(&self) -> Result<Option<SubmissionResult>, CycleError> {
        self.transition(CycleState::Fetching).await;
        let batch = self.source.fetch(&self.feed.symbols).await?;
        Span::current().record("fetch_id", tracing::field::display(batch.fetch_id()));
        debug!(attestations = batch.len(), "Fetched attestations");

        let decision = self.ctx.cache.evaluate(&batch, &self.feed, Utc::now());
        if !decision.should_push() {
            self.ctx.metrics.inc_no_update_needed();
            self.transition(CycleState::Idle).await;
            debug!("All prices within deviation and staleness bounds, nothing to push");
            return Ok(None);
        }
        debug!(triggers = %decision.describe(), "Push required");

        self.transition(CycleState::Formatting).await;
        let payload = format_update(&batch, self.mode)?;

        self.transition(CycleState::Submitting).await;
        let result = self.queue.submit(&self.feed.name, payload).await?;

        self.ctx.cache.record(&batch, Utc::now());
        self.transition(CycleState::Idle).await;
        info!(
            tx_hash = %result.tx_hash,
            block_number = ?result.block_number,
            nonce = result.nonce,
            symbols = ?batch.symbols(),
            "Price update pushed"
        );
        Ok(Some(result))
    }

    async fn halt(&self, err: &CycleError) {
        self.halted.store(true, Ordering::SeqCst);
        self.transition(CycleState::Halted).await;
        self.ctx.metrics.inc_feeds_halted();
        self.ctx.health.record_failure(&self.feed.name, &err.to_string());
        error!(
            feed = %self.feed.name,
            error = %err,
            "Feed halted, operator action required"
        );
    }

    /// Returns false when shutdown cut the sleep short
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut token = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.wait_for_shutdown() => false,
        }
    }
}

fn joined_cleanly(feed: &str, joined: Result<CycleOutcome, JoinError>) -> bool {
    match joined {
        Ok(_) => true,
        Err(e) => {
            error!(feed, error = %e, "Cycle task did not complete");
            false
        }
    }
}

/// Tick loop for one feed; returns whether every cycle ended normally
async fn drive_feed(runner: Arc<FeedRunner>, mut token: ShutdownToken) -> bool {
    let mut ticker = tokio::time::interval(runner.feed().update_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = JoinSet::new();
    let mut clean = true;

    info!(
        interval_secs = runner.feed().update_interval_secs,
        symbols = ?runner.feed().symbols,
        "Feed started"
    );

    loop {
        tokio::select! {
            biased;
            _ = token.wait_for_shutdown() => break,
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                clean &= joined_cleanly(runner.name(), joined);
                if runner.is_halted() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if runner.tick(&mut cycles).await == TickOutcome::Halted {
                    break;
                }
            }
        }
    }

    while let Some(joined) = cycles.join_next().await {
        clean &= joined_cleanly(runner.name(), joined);
    }
    info!(halted = runner.is_halted(), "Feed stopped");
    clean
}

/// Owns the feed runners and the submission workers behind them
pub struct Scheduler {
    runners: Vec<Arc<FeedRunner>>,
    workers: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
    shutdown: Arc<GracefulShutdown>,
    /// `None` disables the periodic counters summary
    metrics_log_interval: Option<Duration>,
}

impl Scheduler {
    pub fn new(
        runners: Vec<Arc<FeedRunner>>,
        workers: Vec<JoinHandle<()>>,
        metrics: Arc<Metrics>,
        shutdown: Arc<GracefulShutdown>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            runners,
            workers,
            metrics,
            shutdown,
            metrics_log_interval: (config.metrics_log_interval_secs > 0)
                .then(|| Duration::from_secs(config.metrics_log_interval_secs)),
        }
    }

    pub fn runners(&self) -> &[Arc<FeedRunner>] {
        &self.runners
    }

    /// One cycle per feed, concurrently, then close the queues
    pub async fn run_once(self) -> Vec<(String, CycleOutcome)> {
        let outcomes = join_all(self.runners.iter().map(|runner| async move {
            let outcome = runner.run_once().await;
            (runner.name().to_string(), outcome)
        }))
        .await;

        close_queues(self.runners, self.workers).await;
        outcomes
    }

    /// Tick every feed until shutdown (or until every feed halted), then drain
    pub async fn run(self) -> Result<(), ShutdownError> {
        let Scheduler {
            runners,
            workers,
            metrics,
            shutdown,
            metrics_log_interval,
        } = self;

        let mut drivers = JoinSet::new();
        for runner in &runners {
            let span = info_span!("feed", feed = %runner.name());
            drivers.spawn(drive_feed(Arc::clone(runner), shutdown.token()).instrument(span));
        }
        info!(feeds = runners.len(), "Scheduler started");

        let mut token = shutdown.token();
        let log_status = metrics_log_interval.is_some();
        let mut status =
            tokio::time::interval(metrics_log_interval.unwrap_or(Duration::from_secs(60)));
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status.tick().await;

        let mut clean = true;
        loop {
            tokio::select! {
                signal = token.wait_for_shutdown() => {
                    info!(%signal, "Scheduler stopping");
                    break;
                }
                joined = drivers.join_next() => match joined {
                    Some(Ok(driver_clean)) => clean &= driver_clean,
                    Some(Err(e)) => {
                        error!(error = %e, "Feed driver task failed");
                        clean = false;
                    }
                    None => {
                        warn!("No feed is running any more");
                        break;
                    }
                },
                _ = status.tick(), if log_status => metrics.log_status(),
            }
        }

        let result = shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        let mut clean = clean;
                        while let Some(joined) = drivers.join_next().await {
                            clean &= matches!(joined, Ok(true));
                        }
                        clean
                    })
                },
                move || Box::pin(close_queues(runners, workers)),
            )
            .await;

        metrics.log_status();
        result
    }
}

/// Drop every queue handle and wait for the workers to finish queued jobs
async fn close_queues(runners: Vec<Arc<FeedRunner>>, workers: Vec<JoinHandle<()>>) {
    drop(runners);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Submission worker ended abnormally");
        }
    }
}
