//! Batch orchestrator: bounded concurrency over an ordered work list.
//!
//! Items are cut into consecutive batches of `concurrency`. Batches run one
//! after another with an optional cooldown in between; items inside a batch
//! run as parallel tasks. Outcomes are collected as tasks finish and sorted
//! back into input order before returning.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use newsdigest_shared::{EngineConfig, ErrorInfo, Outcome, Result, WorkItem};

use crate::events::{EngineEvent, EventSink, TracingSink};
use crate::guard::IdempotencyGuard;
use crate::operation::Operation;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs an [`Operation`] over a work list under a retry policy and rate limiter.
pub struct Orchestrator<O: Operation> {
    operation: Arc<O>,
    policy: Arc<RetryPolicy>,
    limiter: Arc<RateLimiter>,
    guard: Option<Arc<IdempotencyGuard>>,
    concurrency: usize,
    cooldown: Duration,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl<O: Operation> Orchestrator<O> {
    /// Create an orchestrator for `operation` with a validated engine config.
    pub fn new(operation: O, config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            operation: Arc::new(operation),
            policy: Arc::new(RetryPolicy::from_config(config)),
            limiter: Arc::new(RateLimiter::from_config(config)),
            guard: Some(Arc::new(IdempotencyGuard::from_config(config))),
            concurrency: config.concurrency,
            cooldown: config.cooldown,
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
        })
    }

    /// Report progress to `sink` instead of the tracing subscriber.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Observe `token`: once cancelled, no new attempts start.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Share a limiter with other orchestrators calling the same service.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Always invoke the operation, even when a valid artifact exists.
    pub fn without_guard(mut self) -> Self {
        self.guard = None;
        self
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }

    /// Process every item; returns exactly one outcome per item, sorted by index.
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.concurrency))]
    pub async fn run(&self, items: &[WorkItem]) -> Vec<Outcome> {
        let total = items.len();
        let batch_size = self.concurrency.max(1);
        let batches = total.div_ceil(batch_size);

        self.sink.emit(&EngineEvent::RunStarted {
            total,
            batches,
            batch_size,
        });

        let ctx = TaskContext {
            operation: self.operation.clone(),
            policy: self.policy.clone(),
            limiter: self.limiter.clone(),
            guard: self.guard.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        };

        let mut outcomes: Vec<Outcome> = Vec::with_capacity(total);

        for (n, chunk) in items.chunks(batch_size).enumerate() {
            let batch = n + 1;

            if n > 0 && !self.cooldown.is_zero() {
                info!(cooldown_ms = self.cooldown.as_millis() as u64, "cooling down between batches");
                tokio::select! {
                    _ = tokio::time::sleep(self.cooldown) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }

            self.sink.emit(&EngineEvent::BatchStarted {
                batch,
                batches,
                size: chunk.len(),
            });

            let mut pending: FuturesUnordered<_> = chunk
                .iter()
                .cloned()
                .map(|item| {
                    let fallback = item.clone();
                    let handle = tokio::spawn(process_item(ctx.clone(), item));
                    async move { (fallback, handle.await) }
                })
                .collect();

            while let Some((item, joined)) = pending.next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let message = format!("task aborted: {e}");
                        error!(index = item.index, payload = %item.payload, %message, "worker task failed");
                        self.sink.emit(&EngineEvent::ItemFailed {
                            index: item.index,
                            payload: &item.payload,
                            attempts: 0,
                            message: &message,
                            exhausted: false,
                        });
                        Outcome::failure(&item, ErrorInfo::permanent(message), 0)
                    }
                };
                outcomes.push(outcome);
            }

            self.sink.emit(&EngineEvent::BatchFinished { batch, batches });
        }

        outcomes.sort_by_key(|o| o.index);

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        self.sink.emit(&EngineEvent::RunFinished { succeeded, total });

        outcomes
    }
}

// ---------------------------------------------------------------------------
// Per-item task
// ---------------------------------------------------------------------------

/// Everything a worker task needs, cheap to clone per item.
struct TaskContext<O: Operation> {
    operation: Arc<O>,
    policy: Arc<RetryPolicy>,
    limiter: Arc<RateLimiter>,
    guard: Option<Arc<IdempotencyGuard>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl<O: Operation> Clone for TaskContext<O> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            policy: self.policy.clone(),
            limiter: self.limiter.clone(),
            guard: self.guard.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Reuse a valid prior artifact, or run the retry loop.
async fn process_item<O: Operation>(ctx: TaskContext<O>, item: WorkItem) -> Outcome {
    let artifact: Option<PathBuf> = ctx.operation.artifact_path(&item);

    if let (Some(guard), Some(path)) = (&ctx.guard, &artifact) {
        if guard.should_skip(path).await {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    ctx.sink.emit(&EngineEvent::ItemSkipped {
                        index: item.index,
                        payload: &item.payload,
                    });
                    return Outcome::success(&item, content, 0)
                        .with_artifact(artifact)
                        .reused();
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "existing artifact unreadable, recomputing");
                }
            }
        }
    }

    let outcome = ctx
        .policy
        .execute(
            ctx.operation.as_ref(),
            &item,
            &ctx.limiter,
            &ctx.cancel,
            ctx.sink.as_ref(),
        )
        .await;

    if outcome.is_success() {
        outcome.with_artifact(artifact)
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use newsdigest_shared::{Backoff, Stage};

    use crate::aggregate::{self, Merge};
    use crate::events::SilentSink;
    use crate::operation::OperationError;

    fn config(concurrency: usize, max_attempts: u32, cooldown: Duration) -> EngineConfig {
        EngineConfig {
            concurrency,
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
            cooldown,
            ..EngineConfig::stage_defaults(Stage::Report)
        }
    }

    fn items(payloads: &[&str]) -> Vec<WorkItem> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| WorkItem::new(i, *p))
            .collect()
    }

    /// Fails each payload a scripted number of times before succeeding.
    struct Flaky {
        failures_before_success: HashMap<String, u32>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl Flaky {
        fn new(script: &[(&str, u32)]) -> Self {
            Self {
                failures_before_success: script.iter().map(|(p, n)| (p.to_string(), *n)).collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls_for(&self, payload: &str) -> u32 {
            self.calls.lock().unwrap().get(payload).copied().unwrap_or(0)
        }
    }

    impl Operation for Flaky {
        async fn process(&self, item: &WorkItem) -> std::result::Result<String, OperationError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(item.payload.clone()).or_insert(0);
                *n += 1;
                *n
            };
            // Later items finish first so completion order differs from dispatch order.
            tokio::time::sleep(Duration::from_millis(100 * (10 - item.index as u64))).await;

            let needed = self.failures_before_success.get(&item.payload).copied().unwrap_or(0);
            if call > needed {
                Ok(format!("out-{}", item.payload))
            } else {
                Err(OperationError::Transient(format!("HTTP 503 on call {call}")))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_items_two_flaky_one_exhausted() {
        let op = Flaky::new(&[("2", 2), ("4", 2), ("5", u32::MAX)]);
        let orchestrator = Orchestrator::new(op, &config(2, 3, Duration::from_secs(5)))
            .unwrap()
            .with_sink(Arc::new(SilentSink));

        let outcomes = orchestrator.run(&items(&["1", "2", "3", "4", "5"])).await;

        assert_eq!(outcomes.len(), 5);
        let indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);

        assert_eq!(
            aggregate::merge(&outcomes),
            Merge::Produced {
                text: "out-1\n\nout-2\n\nout-3\n\nout-4".into(),
                succeeded: 4,
                total: 5,
            }
        );

        let failed = aggregate::failures(&outcomes);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, "5");
        assert!(failed[0].error().unwrap().exhausted);

        let op = orchestrator.operation();
        assert_eq!(op.calls_for("2"), 3);
        assert_eq!(op.calls_for("4"), 3);
        assert_eq!(op.calls_for("5"), 3);
        assert_eq!(op.calls_for("1"), 1);
    }

    /// Tracks how many calls are in flight at once.
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        work: Duration,
    }

    impl Operation for Gauge {
        async fn process(&self, item: &WorkItem) -> std::result::Result<String, OperationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(item.payload.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_sequential_with_cooldown() {
        let op = Gauge {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            work: Duration::from_secs(1),
        };
        let orchestrator = Orchestrator::new(op, &config(2, 1, Duration::from_secs(5)))
            .unwrap()
            .with_sink(Arc::new(SilentSink));

        let start = tokio::time::Instant::now();
        let outcomes = orchestrator.run(&items(&["a", "b", "c", "d", "e"])).await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(orchestrator.operation().peak.load(Ordering::SeqCst), 2);
        // 3 batches of 1s work, 2 cooldowns of 5s, none after the last batch.
        assert_eq!(start.elapsed(), Duration::from_secs(13));
    }

    /// Panics on one payload.
    struct Explosive;

    impl Operation for Explosive {
        async fn process(&self, item: &WorkItem) -> std::result::Result<String, OperationError> {
            if item.payload == "boom" {
                panic!("operation blew up");
            }
            Ok(item.payload.to_uppercase())
        }
    }

    #[tokio::test]
    async fn panicking_item_does_not_take_down_siblings() {
        let orchestrator = Orchestrator::new(Explosive, &config(3, 2, Duration::ZERO))
            .unwrap()
            .with_sink(Arc::new(SilentSink));

        let outcomes = orchestrator.run(&items(&["a", "boom", "c", "d"])).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].output(), Some("A"));
        assert_eq!(outcomes[2].output(), Some("C"));
        assert_eq!(outcomes[3].output(), Some("D"));
        let error = outcomes[1].error().unwrap();
        assert!(!error.exhausted);
        assert!(error.message.contains("task aborted"));
    }

    /// Writes `<payload>.txt` under `dir` and counts calls.
    struct FileWriter {
        dir: PathBuf,
        calls: AtomicUsize,
    }

    impl Operation for FileWriter {
        async fn process(&self, item: &WorkItem) -> std::result::Result<String, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = format!("fresh {}", item.payload);
            let path = self.dir.join(format!("{}.txt", item.payload));
            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| OperationError::Transient(e.to_string()))?;
            Ok(content)
        }

        fn artifact_path(&self, item: &WorkItem) -> Option<PathBuf> {
            Some(self.dir.join(format!("{}.txt", item.payload)))
        }
    }

    #[tokio::test]
    async fn valid_artifacts_are_reused_without_calling_operation() {
        let dir = std::env::temp_dir().join(format!("nd-orch-guard-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("good.txt"), "cached good").unwrap();
        std::fs::write(dir.join("bad.txt"), "环境异常 placeholder").unwrap();

        let op = FileWriter {
            dir: dir.clone(),
            calls: AtomicUsize::new(0),
        };
        let mut cfg = config(4, 2, Duration::ZERO);
        cfg.rejection_markers = vec!["环境异常".into()];
        let orchestrator = Orchestrator::new(op, &cfg)
            .unwrap()
            .with_sink(Arc::new(SilentSink));

        let outcomes = orchestrator.run(&items(&["good", "bad", "new"])).await;

        assert_eq!(orchestrator.operation().calls.load(Ordering::SeqCst), 2);

        assert!(outcomes[0].reused);
        assert_eq!(outcomes[0].attempts, 0);
        assert_eq!(outcomes[0].output(), Some("cached good"));
        assert_eq!(outcomes[0].artifact, Some(dir.join("good.txt")));

        assert!(!outcomes[1].reused);
        assert_eq!(outcomes[1].output(), Some("fresh bad"));
        assert_eq!(
            std::fs::read_to_string(dir.join("bad.txt")).unwrap(),
            "fresh bad"
        );
        assert_eq!(outcomes[2].artifact, Some(dir.join("new.txt")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn without_guard_always_calls_operation() {
        let dir = std::env::temp_dir().join(format!("nd-orch-noguard-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("good.txt"), "cached good").unwrap();

        let op = FileWriter {
            dir: dir.clone(),
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(op, &config(1, 1, Duration::ZERO))
            .unwrap()
            .without_guard()
            .with_sink(Arc::new(SilentSink));

        let outcomes = orchestrator.run(&items(&["good"])).await;
        assert_eq!(orchestrator.operation().calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes[0].output(), Some("fresh good"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_still_reports_every_item() {
        let token = CancellationToken::new();
        token.cancel();

        let op = Gauge {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            work: Duration::from_secs(1),
        };
        let orchestrator = Orchestrator::new(op, &config(2, 3, Duration::from_secs(5)))
            .unwrap()
            .with_cancellation(token)
            .with_sink(Arc::new(SilentSink));

        let start = tokio::time::Instant::now();
        let outcomes = orchestrator.run(&items(&["a", "b", "c"])).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.error().map(|e| e.message.as_str()) == Some("cancelled")));
        assert_eq!(orchestrator.operation().peak.load(Ordering::SeqCst), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    /// Records event names in order.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &EngineEvent<'_>) {
            let name = match event {
                EngineEvent::RunStarted { batches, .. } => format!("run:{batches}"),
                EngineEvent::BatchStarted { batch, .. } => format!("batch:{batch}"),
                EngineEvent::ItemSkipped { index, .. } => format!("skip:{index}"),
                EngineEvent::AttemptFailed { index, .. } => format!("retry:{index}"),
                EngineEvent::ItemSucceeded { index, .. } => format!("ok:{index}"),
                EngineEvent::ItemFailed { index, .. } => format!("fail:{index}"),
                EngineEvent::BatchFinished { batch, .. } => format!("done:{batch}"),
                EngineEvent::RunFinished { succeeded, total } => format!("end:{succeeded}/{total}"),
            };
            self.0.lock().unwrap().push(name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_bracket_each_batch() {
        let recorder = Arc::new(Recorder::default());
        let op = Flaky::new(&[("b", 1)]);
        let orchestrator = Orchestrator::new(op, &config(2, 2, Duration::ZERO))
            .unwrap()
            .with_sink(recorder.clone());

        orchestrator.run(&items(&["a", "b", "c"])).await;

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("run:2"));
        assert_eq!(events.last().map(String::as_str), Some("end:3/3"));

        let pos = |name: &str| events.iter().position(|e| e == name).unwrap();
        assert!(pos("batch:1") < pos("ok:0"));
        assert!(pos("retry:1") < pos("ok:1"));
        assert!(pos("ok:1") < pos("done:1"));
        assert!(pos("done:1") < pos("batch:2"));
        assert!(pos("batch:2") < pos("ok:2"));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let result = Orchestrator::new(Explosive, &config(0, 3, Duration::ZERO));
        assert!(result.is_err());
    }
}
