//! Coordination Layer
//!
//! - Per-feed circuit breaker
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod shutdown;

pub use circuit_breaker::{
    CircuitBreakerStats, CircuitState, FeedCircuitBreaker, FeedCircuitBreakerConfig, TripReason,
};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal, ShutdownToken,
};
