//! Graceful Shutdown Handler
//!
//! Stops new cycles, lets in-flight cycles finish within the drain timeout,
//! then closes the submission queues so their workers exit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - skip draining
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight cycles to finish (default: 60s)
    pub drain_timeout_secs: u64,
    /// Time to wait for submission workers to exit (default: 10s)
    pub queue_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 60,
            queue_close_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Tickers stopped, no new cycles start
    StoppingTicks,
    /// Waiting for in-flight cycles
    DrainingCycles,
    /// Submission queues closing
    ClosingQueues,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingTicks => write!(f, "stopping_ticks"),
            ShutdownPhase::DrainingCycles => write!(f, "draining_cycles"),
            ShutdownPhase::ClosingQueues => write!(f, "closing_queues"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    signal: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            signal,
            phase,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal.borrow().is_some()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let first = self.signal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });

        if first {
            info!(%signal, "Shutdown requested");
        } else {
            warn!(%signal, "Shutdown already requested, ignoring duplicate signal");
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!(%phase, "Shutdown phase");
    }

    /// Run the shutdown sequence
    ///
    /// 1. Stop tickers (they watch the shutdown token)
    /// 2. Drain in-flight cycles (skipped on an urgent signal)
    /// 3. Close submission queues
    pub async fn execute<F1, F2>(
        &self,
        drain_cycles: F1,
        close_queues: F2,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> BoxFuture<bool>,
        F2: FnOnce() -> BoxFuture<()>,
    {
        let start = tokio::time::Instant::now();
        let urgent = *self.signal.borrow() == Some(ShutdownSignal::Urgent);
        let mut result = Ok(());

        self.set_phase(ShutdownPhase::StoppingTicks);

        self.set_phase(ShutdownPhase::DrainingCycles);
        if urgent {
            warn!("Urgent shutdown, not waiting for in-flight cycles");
        } else {
            let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs);
            match tokio::time::timeout(drain_timeout, drain_cycles()).await {
                Ok(true) => info!("All in-flight cycles drained"),
                Ok(false) => warn!("Some cycles ended abnormally during drain"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.config.drain_timeout_secs,
                        "Cycle drain timed out, proceeding anyway"
                    );
                    result = Err(ShutdownError::Timeout);
                }
            }
        }

        self.set_phase(ShutdownPhase::ClosingQueues);
        let close_timeout = Duration::from_secs(self.config.queue_close_timeout_secs);
        if tokio::time::timeout(close_timeout, close_queues())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.queue_close_timeout_secs,
                "Submission queues did not close in time"
            );
        } else {
            debug!("Submission queues closed");
        }

        self.set_phase(ShutdownPhase::Complete);
        info!(elapsed = ?start.elapsed(), "Graceful shutdown completed");
        result
    }

    /// Token for checking shutdown status in async tasks
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal.subscribe(),
        }
    }
}

/// Cloneable handle observing the shutdown request
///
/// Backed by a watch channel, so a token created or polled after the request
/// still sees it.
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Wait for a shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator dropped, nobody can request shutdown any more
                return std::future::pending().await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// In-flight cycles did not finish within the drain timeout
    Timeout,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, sig) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(signal = name, error = %e, "Failed to install signal handler");
                        return;
                    }
                };
                stream.recv().await;
                info!(signal = name, "Received signal");
                shutdown.request_shutdown(sig);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                return;
            }
            info!("Received Ctrl+C");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::DrainingCycles.to_string(), "draining_cycles");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let shutdown = GracefulShutdown::with_defaults();
        assert!(!shutdown.is_shutdown_requested());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());

        // Duplicate request keeps the first signal
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        let mut token = shutdown.token();
        assert_eq!(token.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_token_sees_request_made_before_wait() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut token = shutdown.token();
        let clone = token.clone();

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(clone.is_shutdown_requested());
        assert_eq!(token.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        let drained = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let (d, c) = (drained.clone(), closed.clone());

        let result = shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        d.store(true, Ordering::SeqCst);
                        true
                    })
                },
                move || {
                    Box::pin(async move {
                        c.store(true, Ordering::SeqCst);
                    })
                },
            )
            .await;

        tokio_test::assert_ok!(result);
        assert!(drained.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_urgent_skips_drain() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Urgent);

        let result = shutdown
            .execute(
                || Box::pin(std::future::pending::<bool>()),
                || Box::pin(async {}),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_reported() {
        let shutdown = GracefulShutdown::new(ShutdownConfig {
            drain_timeout_secs: 1,
            queue_close_timeout_secs: 1,
        });

        let result = shutdown
            .execute(
                || Box::pin(std::future::pending::<bool>()),
                || Box::pin(async {}),
            )
            .await;

        assert_eq!(result, Err(ShutdownError::Timeout));
    }
}
