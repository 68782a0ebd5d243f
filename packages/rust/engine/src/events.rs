//! Structured progress events emitted by the engine.
//!
//! Sinks observe; they never influence control flow or ordering.

use tracing::{error, info, warn};

/// Something the engine did.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent<'a> {
    RunStarted {
        total: usize,
        batches: usize,
        batch_size: usize,
    },
    BatchStarted {
        /// 1-based batch number.
        batch: usize,
        batches: usize,
        size: usize,
    },
    /// A valid artifact from an earlier run was reused.
    ItemSkipped { index: usize, payload: &'a str },
    AttemptFailed {
        index: usize,
        payload: &'a str,
        attempt: u32,
        max_attempts: u32,
        reason: &'a str,
    },
    ItemSucceeded {
        index: usize,
        payload: &'a str,
        attempts: u32,
    },
    ItemFailed {
        index: usize,
        payload: &'a str,
        attempts: u32,
        message: &'a str,
        exhausted: bool,
    },
    BatchFinished { batch: usize, batches: usize },
    RunFinished { succeeded: usize, total: usize },
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent<'_>);
}

/// Discards every event.
pub struct SilentSink;

impl EventSink for SilentSink {
    fn emit(&self, _event: &EngineEvent<'_>) {}
}

/// Turns events into human-readable status lines on the tracing subscriber.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent<'_>) {
        match *event {
            EngineEvent::RunStarted {
                total,
                batches,
                batch_size,
            } => info!(
                total,
                batches, batch_size, "processing {total} items in {batches} batches"
            ),
            EngineEvent::BatchStarted {
                batch,
                batches,
                size,
            } => info!(
                batch,
                size,
                remaining = batches - batch,
                "batch {batch}/{batches} started"
            ),
            EngineEvent::ItemSkipped { index, payload } => {
                info!(index, payload, "valid artifact exists, skipping")
            }
            EngineEvent::AttemptFailed {
                index,
                payload,
                attempt,
                max_attempts,
                reason,
            } => warn!(
                index,
                payload, reason, "attempt {attempt}/{max_attempts} failed"
            ),
            EngineEvent::ItemSucceeded {
                index,
                payload,
                attempts,
            } => info!(index, payload, attempts, "item succeeded"),
            EngineEvent::ItemFailed {
                index,
                payload,
                attempts,
                message,
                exhausted,
            } => error!(index, payload, attempts, exhausted, message, "item failed"),
            EngineEvent::BatchFinished { batch, batches } => {
                info!(batch, "batch {batch}/{batches} finished")
            }
            EngineEvent::RunFinished { succeeded, total } => {
                info!(succeeded, total, "finished: {succeeded}/{total} succeeded")
            }
        }
    }
}

/// Forwards every event to each inner sink in order.
pub struct FanoutSink(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for FanoutSink {
    fn emit(&self, event: &EngineEvent<'_>) {
        for sink in &self.0 {
            sink.emit(event);
        }
    }
}
