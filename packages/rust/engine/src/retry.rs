//! Bounded retry around a single work-item operation.
//!
//! Every call to [`RetryPolicy::execute`] ends in an [`Outcome`]; failures of
//! the operation never escape this boundary.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use newsdigest_shared::{Backoff, EngineConfig, ErrorInfo, Outcome, WorkItem};

use crate::events::{EngineEvent, EventSink};
use crate::operation::{Operation, OperationError};
use crate::rate_limit::RateLimiter;

// ---------------------------------------------------------------------------
// Content validation
// ---------------------------------------------------------------------------

/// Why otherwise-successful output was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A challenge/placeholder marker was found.
    Marker(String),
    /// Output was shorter than the configured minimum.
    TooShort { chars: usize, min: usize },
}

impl Rejection {
    /// Exhaustion message when this was the last failure.
    fn persisted(&self) -> String {
        match self {
            Self::Marker(_) => format!("rejection marker persisted ({self})"),
            Self::TooShort { .. } => format!("content rejected ({self})"),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marker(marker) => write!(f, "rejection marker present: {marker:?}"),
            Self::TooShort { chars, min } => {
                write!(f, "output too short: {chars} chars, minimum {min}")
            }
        }
    }
}

/// Decides whether operation output is real content.
#[derive(Debug, Clone, Default)]
pub struct ContentValidator {
    markers: Vec<String>,
    min_chars: Option<usize>,
}

impl ContentValidator {
    pub fn new(markers: Vec<String>, min_chars: Option<usize>) -> Self {
        Self { markers, min_chars }
    }

    pub fn check(&self, content: &str) -> Result<(), Rejection> {
        if let Some(marker) = self.markers.iter().find(|m| content.contains(m.as_str())) {
            return Err(Rejection::Marker(marker.clone()));
        }
        if let Some(min) = self.min_chars {
            let chars = content.trim().chars().count();
            if chars < min {
                return Err(Rejection::TooShort { chars, min });
            }
        }
        Ok(())
    }
}

/// Drop everything before the first `marker`; unchanged if it never appears.
pub fn trim_to_marker(content: String, marker: Option<char>) -> String {
    let Some(marker) = marker else {
        return content;
    };
    match content.find(marker) {
        Some(0) | None => content,
        Some(pos) => content[pos..].to_string(),
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Attempt budget, backoff and content rules for one stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    rejection_backoff: Option<Backoff>,
    validator: ContentValidator,
    leading_marker: Option<char>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            rejection_backoff: None,
            validator: ContentValidator::default(),
            leading_marker: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_attempts, config.backoff)
            .with_rejection_backoff(config.rejection_backoff)
            .with_validator(ContentValidator::new(
                config.rejection_markers.clone(),
                config.min_content_chars,
            ))
            .with_leading_marker(config.leading_marker)
    }

    pub fn with_rejection_backoff(mut self, backoff: Option<Backoff>) -> Self {
        self.rejection_backoff = backoff;
        self
    }

    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_leading_marker(mut self, marker: Option<char>) -> Self {
        self.leading_marker = marker;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` on `item` until it yields acceptable content, fails
    /// permanently, is cancelled, or the attempt budget is spent.
    pub async fn execute<O: Operation>(
        &self,
        operation: &O,
        item: &WorkItem,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Outcome {
        let mut last_failure = String::new();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return self.fail(item, ErrorInfo::permanent("cancelled"), attempt - 1, sink);
            }

            tokio::select! {
                _ = limiter.acquire() => {}
                _ = cancel.cancelled() => {
                    return self.fail(item, ErrorInfo::permanent("cancelled"), attempt - 1, sink);
                }
            }

            debug!(index = item.index, attempt, "attempting");

            match operation.process(item).await {
                Ok(content) => match self.validator.check(&content) {
                    Ok(()) => {
                        sink.emit(&EngineEvent::ItemSucceeded {
                            index: item.index,
                            payload: &item.payload,
                            attempts: attempt,
                        });
                        let output = trim_to_marker(content, self.leading_marker);
                        return Outcome::success(item, output, attempt);
                    }
                    Err(rejection) => {
                        self.attempt_failed(item, attempt, &rejection.to_string(), sink);
                        last_failure = rejection.persisted();

                        if let Some(backoff) = self.rejection_backoff {
                            if attempt < self.max_attempts
                                && !self.pause(backoff.delay(attempt), cancel).await
                            {
                                return self.fail(item, ErrorInfo::permanent("cancelled"), attempt, sink);
                            }
                        }
                    }
                },
                Err(OperationError::Permanent(message)) => {
                    return self.fail(item, ErrorInfo::permanent(message), attempt, sink);
                }
                Err(OperationError::Transient(message)) => {
                    self.attempt_failed(item, attempt, &message, sink);
                    last_failure = message;

                    if attempt < self.max_attempts
                        && !self.pause(self.backoff.delay(attempt), cancel).await
                    {
                        return self.fail(item, ErrorInfo::permanent("cancelled"), attempt, sink);
                    }
                }
            }
        }

        self.fail(
            item,
            ErrorInfo::exhausted(last_failure),
            self.max_attempts,
            sink,
        )
    }

    /// Sleep for `delay`; `false` if cancelled first.
    async fn pause(&self, delay: std::time::Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn attempt_failed(&self, item: &WorkItem, attempt: u32, reason: &str, sink: &dyn EventSink) {
        sink.emit(&EngineEvent::AttemptFailed {
            index: item.index,
            payload: &item.payload,
            attempt,
            max_attempts: self.max_attempts,
            reason,
        });
    }

    fn fail(&self, item: &WorkItem, error: ErrorInfo, attempts: u32, sink: &dyn EventSink) -> Outcome {
        debug!(index = item.index, attempts, exhausted = error.exhausted, "giving up on item");
        sink.emit(&EngineEvent::ItemFailed {
            index: item.index,
            payload: &item.payload,
            attempts,
            message: &error.message,
            exhausted: error.exhausted,
        });
        Outcome::failure(item, error, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::events::SilentSink;

    /// Replays a script of results, then repeats the last one.
    struct Scripted {
        script: Mutex<Vec<Result<String, OperationError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, OperationError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Operation for Scripted {
        async fn process(&self, _item: &WorkItem) -> Result<String, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn transient(msg: &str) -> Result<String, OperationError> {
        Err(OperationError::Transient(msg.into()))
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Fixed(Duration::from_secs(1))).with_validator(
            ContentValidator::new(vec!["环境异常".into(), "verify you are human".into()], None),
        )
    }

    async fn run(policy: &RetryPolicy, op: &Scripted) -> Outcome {
        let item = WorkItem::new(7, "https://example.com/a");
        policy
            .execute(
                op,
                &item,
                &RateLimiter::unlimited(),
                &CancellationToken::new(),
                &SilentSink,
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rejection_exhausts_exact_budget() {
        let op = Scripted::new(vec![Ok("<p>环境异常</p>".into())]);
        let outcome = run(&policy(10), &op).await;

        assert_eq!(op.calls(), 10);
        assert_eq!(outcome.attempts, 10);
        let error = outcome.error().expect("should fail");
        assert!(error.exhausted);
        assert!(error.message.contains("rejection marker persisted"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_uses_third_output() {
        let op = Scripted::new(vec![
            transient("HTTP 502"),
            Ok("verify you are human".into()),
            Ok("# Third".into()),
        ]);
        let outcome = run(&policy(3), &op).await;

        assert_eq!(op.calls(), 3);
        assert_eq!(outcome.output(), Some("# Third"));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error_text() {
        let op = Scripted::new(vec![transient("HTTP 500"), transient("connection reset")]);
        let outcome = run(&policy(2), &op).await;

        let error = outcome.error().unwrap();
        assert!(error.exhausted);
        assert_eq!(error.message, "connection reset");
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let op = Scripted::new(vec![Err(OperationError::Permanent("no such file".into()))]);
        let outcome = run(&policy(5), &op).await;

        assert_eq!(op.calls(), 1);
        let error = outcome.error().unwrap();
        assert!(!error.exhausted);
        assert_eq!(error.message, "no such file");
    }

    #[tokio::test(start_paused = true)]
    async fn linear_backoff_grows_per_attempt() {
        let op = Scripted::new(vec![transient("a"), transient("b"), Ok("done".into())]);
        let policy = RetryPolicy::new(3, Backoff::Linear(Duration::from_secs(3)));
        let start = tokio::time::Instant::now();
        let outcome = run(&policy, &op).await;

        assert!(outcome.is_success());
        // 3s after the first failure, 6s after the second.
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_does_not_back_off() {
        let op = Scripted::new(vec![Ok("环境异常".into()), Ok("fine".into())]);
        let start = tokio::time::Instant::now();
        let outcome = run(&policy(3), &op).await;

        assert!(outcome.is_success());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_short_output_is_reported_as_rejected_content() {
        let op = Scripted::new(vec![Ok("tiny".into())]);
        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::ZERO))
            .with_validator(ContentValidator::new(vec![], Some(50)));
        let outcome = run(&policy, &op).await;

        let error = outcome.error().unwrap();
        assert!(error.exhausted);
        assert!(error.message.starts_with("content rejected (output too short"));
        assert!(!error.message.contains("marker"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_defaults_back_off_after_challenge_pages() {
        let config = EngineConfig::stage_defaults(newsdigest_shared::Stage::Fetch);
        let op = Scripted::new(vec![Ok("环境异常，完成验证后即可继续访问".into())]);
        let start = tokio::time::Instant::now();
        let outcome = run(&RetryPolicy::from_config(&config), &op).await;

        assert_eq!(op.calls(), 3);
        // Linear 3s: 3s after the first rejection, 6s after the second, none after the last.
        assert_eq!(start.elapsed(), Duration::from_secs(9));
        let error = outcome.error().unwrap();
        assert!(error.exhausted);
        assert!(error.message.contains("rejection marker persisted"));
    }

    #[tokio::test(start_paused = true)]
    async fn digest_defaults_retry_rejections_at_once() {
        let config = EngineConfig::stage_defaults(newsdigest_shared::Stage::Digest);
        let op = Scripted::new(vec![
            Ok("微信，是一个生活方式".into()),
            Ok("# Real abstract".into()),
        ]);
        let start = tokio::time::Instant::now();
        let outcome = run(&RetryPolicy::from_config(&config), &op).await;

        assert_eq!(outcome.output(), Some("# Real abstract"));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_rejection_backoff_stops_retrying() {
        let op = Scripted::new(vec![Ok("环境异常".into())]);
        let policy = policy(5).with_rejection_backoff(Some(Backoff::Fixed(Duration::from_secs(30))));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let item = WorkItem::new(0, "x");
        let outcome = policy
            .execute(&op, &item, &RateLimiter::unlimited(), &cancel, &SilentSink)
            .await;

        assert_eq!(op.calls(), 1);
        let error = outcome.error().unwrap();
        assert_eq!(error.message, "cancelled");
        assert!(!error.exhausted);
    }

    /// Counts failure events.
    #[derive(Default)]
    struct FailureCount {
        attempts: AtomicU32,
        items: AtomicU32,
    }

    impl EventSink for FailureCount {
        fn emit(&self, event: &EngineEvent<'_>) {
            match event {
                EngineEvent::AttemptFailed { .. } => {
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                }
                EngineEvent::ItemFailed { .. } => {
                    self.items.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_failed_attempt_is_reported_once() {
        let op = Scripted::new(vec![
            transient("HTTP 502"),
            Ok("环境异常".into()),
            transient("HTTP 503"),
        ]);
        let sink = FailureCount::default();
        let item = WorkItem::new(0, "x");
        let outcome = policy(3)
            .execute(&op, &item, &RateLimiter::unlimited(), &CancellationToken::new(), &sink)
            .await;

        assert!(!outcome.is_success());
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.items.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_before_first_attempt() {
        let op = Scripted::new(vec![Ok("fine".into())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let item = WorkItem::new(0, "x");
        let outcome = policy(3)
            .execute(&op, &item, &RateLimiter::unlimited(), &cancel, &SilentSink)
            .await;

        assert_eq!(op.calls(), 0);
        let error = outcome.error().unwrap();
        assert_eq!(error.message, "cancelled");
        assert!(!error.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_paces_attempts() {
        let op = Scripted::new(vec![Ok("环境异常".into())]);
        let limiter = RateLimiter::new([(1, Duration::from_secs(1))]);
        let item = WorkItem::new(0, "x");
        let start = tokio::time::Instant::now();

        let outcome = policy(4)
            .execute(&op, &item, &limiter, &CancellationToken::new(), &SilentSink)
            .await;

        assert!(!outcome.is_success());
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn trims_to_leading_marker() {
        assert_eq!(
            trim_to_marker("Sure! Here it is:\n# Title\nbody".into(), Some('#')),
            "# Title\nbody"
        );
        assert_eq!(trim_to_marker("# Already".into(), Some('#')), "# Already");
        assert_eq!(trim_to_marker("no heading".into(), Some('#')), "no heading");
        assert_eq!(trim_to_marker("keep # all".into(), None), "keep # all");
    }

    #[test]
    fn validator_min_length_is_optional() {
        let lenient = ContentValidator::new(vec![], None);
        assert!(lenient.check("ok").is_ok());

        let strict = ContentValidator::new(vec![], Some(10));
        assert_eq!(
            strict.check("  short  "),
            Err(Rejection::TooShort { chars: 5, min: 10 })
        );
        assert!(strict.check("long enough text").is_ok());
    }

    #[test]
    fn validator_reports_first_marker() {
        let validator = ContentValidator::new(vec!["captcha".into(), "blocked".into()], None);
        assert_eq!(
            validator.check("captcha page, you are blocked"),
            Err(Rejection::Marker("captcha".into()))
        );
        assert_eq!(
            validator.check("you are blocked"),
            Err(Rejection::Marker("blocked".into()))
        );
        assert_eq!(validator.check("real article"), Ok(()));
    }
}
