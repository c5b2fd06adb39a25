use crate::error::CycleError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Metrics collector for observability
#[derive(Debug, Default)]
pub struct Metrics {
    /// Scheduler ticks across all feeds
    pub ticks: AtomicU64,
    /// Cycles started
    pub cycles_started: AtomicU64,
    /// Ticks skipped because the previous cycle was still running
    pub ticks_skipped_in_flight: AtomicU64,
    /// Ticks skipped because the feed's circuit was open
    pub ticks_skipped_circuit_open: AtomicU64,
    /// Cycles where the push gate found nothing worth pushing
    pub no_update_needed: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub encode_failures: AtomicU64,
    pub submission_failures: AtomicU64,
    /// Transactions broadcast
    pub transactions_sent: AtomicU64,
    /// Transactions confirmed with success status
    pub transactions_confirmed: AtomicU64,
    pub retries: AtomicU64,
    pub feeds_halted: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub cycles_started: u64,
    pub ticks_skipped_in_flight: u64,
    pub ticks_skipped_circuit_open: u64,
    pub no_update_needed: u64,
    pub fetch_failures: u64,
    pub encode_failures: u64,
    pub submission_failures: u64,
    pub transactions_sent: u64,
    pub transactions_confirmed: u64,
    pub retries: u64,
    pub feeds_halted: u64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ticks(&self) {
        inc(&self.ticks);
    }

    pub fn inc_cycles_started(&self) {
        inc(&self.cycles_started);
    }

    pub fn inc_skipped_in_flight(&self) {
        inc(&self.ticks_skipped_in_flight);
    }

    pub fn inc_skipped_circuit_open(&self) {
        inc(&self.ticks_skipped_circuit_open);
    }

    pub fn inc_no_update_needed(&self) {
        inc(&self.no_update_needed);
    }

    pub fn inc_transactions_sent(&self) {
        inc(&self.transactions_sent);
    }

    pub fn inc_transactions_confirmed(&self) {
        inc(&self.transactions_confirmed);
    }

    pub fn inc_retries(&self) {
        inc(&self.retries);
    }

    pub fn inc_feeds_halted(&self) {
        inc(&self.feeds_halted);
    }

    /// Count a failed cycle under the stage it failed in
    pub fn record_cycle_error(&self, err: &CycleError) {
        match err {
            CycleError::Fetch(_) => inc(&self.fetch_failures),
            CycleError::Encoding(_) => inc(&self.encode_failures),
            CycleError::Submission(_) => inc(&self.submission_failures),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks: load(&self.ticks),
            cycles_started: load(&self.cycles_started),
            ticks_skipped_in_flight: load(&self.ticks_skipped_in_flight),
            ticks_skipped_circuit_open: load(&self.ticks_skipped_circuit_open),
            no_update_needed: load(&self.no_update_needed),
            fetch_failures: load(&self.fetch_failures),
            encode_failures: load(&self.encode_failures),
            submission_failures: load(&self.submission_failures),
            transactions_sent: load(&self.transactions_sent),
            transactions_confirmed: load(&self.transactions_confirmed),
            retries: load(&self.retries),
            feeds_halted: load(&self.feeds_halted),
        }
    }

    /// Current metrics as a formatted string
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        let confirm_rate = if s.transactions_sent > 0 {
            (s.transactions_confirmed as f64 / s.transactions_sent as f64) * 100.0
        } else {
            0.0
        };

        format!(
            r#"
=== PYTHORA PRICE PUSHER STATUS ===
Ticks: {} | Cycles: {} | Skipped: {} in-flight, {} circuit-open
Pushes: {}/{} confirmed ({:.1}%) | No update needed: {}
Failures: fetch {} | encode {} | submit {} | Retries: {}
Halted feeds: {}
===================================
"#,
            s.ticks,
            s.cycles_started,
            s.ticks_skipped_in_flight,
            s.ticks_skipped_circuit_open,
            s.transactions_confirmed,
            s.transactions_sent,
            confirm_rate,
            s.no_update_needed,
            s.fetch_failures,
            s.encode_failures,
            s.submission_failures,
            s.retries,
            s.feeds_halted,
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, SubmissionError};

    #[test]
    fn test_cycle_errors_counted_by_stage() {
        let m = Metrics::new();
        m.record_cycle_error(&CycleError::Fetch(FetchError::Timeout { elapsed_ms: 5 }));
        m.record_cycle_error(&CycleError::Submission(SubmissionError::QueueClosed));
        m.record_cycle_error(&CycleError::Submission(SubmissionError::QueueClosed));

        let s = m.snapshot();
        assert_eq!(s.fetch_failures, 1);
        assert_eq!(s.encode_failures, 0);
        assert_eq!(s.submission_failures, 2);
    }

    #[test]
    fn test_summary() {
        let m = Metrics::new();
        m.inc_transactions_sent();
        m.inc_transactions_confirmed();
        m.inc_skipped_in_flight();

        let summary = m.summary();
        assert!(summary.contains("Pushes: 1/1 confirmed (100.0%)"));
        assert!(summary.contains("Skipped: 1 in-flight, 0 circuit-open"));
    }
}
