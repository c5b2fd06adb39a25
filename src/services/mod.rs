pub mod formatter;
pub mod health;
pub mod metrics;
pub mod price_cache;
pub mod scheduler;
pub mod submitter;

pub use formatter::{format_update, ACCUMULATOR_MAGIC};
pub use health::{FeedHealth, HealthResponse, HealthServer, HealthState, HealthStatus};
pub use metrics::{Metrics, MetricsSnapshot};
pub use price_cache::{PriceCache, PushDecision, PushReason, PushedPrice};
pub use scheduler::{
    CycleContext, CycleOutcome, FeedRunner, RetryPolicy, Scheduler, TickOutcome,
};
pub use submitter::{SubmissionQueue, SubmitterConfig};
