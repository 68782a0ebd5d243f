//! Concurrent batch engine for newsdigest.
//!
//! This crate provides:
//! - [`RateLimiter`]: blocking per-second and per-minute admission
//! - [`RetryPolicy`]: bounded attempts with backoff and content validation
//! - [`IdempotencyGuard`]: reuse of valid artifacts from earlier runs
//! - [`Orchestrator`]: sequential batches of parallel tasks
//! - [`aggregate`]: deterministic merge of per-item outcomes

pub mod aggregate;
pub mod events;
pub mod guard;
pub mod operation;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;

pub use aggregate::{Merge, SEPARATOR, failures, manifest, merge};
pub use events::{EngineEvent, EventSink, FanoutSink, SilentSink, TracingSink};
pub use guard::IdempotencyGuard;
pub use operation::{Operation, OperationError};
pub use orchestrator::Orchestrator;
pub use rate_limit::RateLimiter;
pub use retry::{ContentValidator, Rejection, RetryPolicy, trim_to_marker};
