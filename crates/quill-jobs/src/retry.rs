//! Retry coordinator: bounded retries with exponential backoff and jitter.
//!
//! The inter-attempt sleep is the only suspension point of the whole job
//! layer. It is raced against a [`CancellationToken`], as is the operation
//! itself, so cancellation takes effect promptly and no terminal hook runs
//! after it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_core::defaults;
use quill_core::{ClassifiedError, ErrorContext, ErrorKind};

use crate::classifier::{Classifier, Failure};

/// Retry policy. All delays are integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Perturb delays by up to ±10% to avoid synchronized retry storms.
    pub jitter: bool,
    /// Minimum delay after a `quota-exceeded` failure, applied after jitter.
    pub quota_floor_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::RETRY_MAX_RETRIES,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            backoff_multiplier: defaults::RETRY_BACKOFF_MULTIPLIER,
            jitter: true,
            quota_floor_ms: defaults::RETRY_QUOTA_FLOOR_MS,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_quota_floor_ms(mut self, ms: u64) -> Self {
        self.quota_floor_ms = ms;
        self
    }

    /// Unjittered backoff for a 1-based attempt, clamped to `max_delay_ms`.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.max(0.0).powi(exponent);
        let cap = self.max_delay_ms as f64;
        if raw.is_nan() || raw > cap {
            self.max_delay_ms
        } else {
            raw.round() as u64
        }
    }

    /// Delay before the retry that follows a failed `attempt`.
    pub fn delay_for(&self, attempt: u32, kind: ErrorKind) -> u64 {
        self.delay_with_rng(attempt, kind, &mut rand::thread_rng())
    }

    /// [`delay_for`](Self::delay_for) with an explicit random source.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, kind: ErrorKind, rng: &mut R) -> u64 {
        let mut delay = self.backoff_delay_ms(attempt);

        if self.jitter {
            let spread = (delay as f64 * defaults::RETRY_JITTER_RATIO) as u64;
            if spread > 0 {
                let offset = rng.gen_range(0..=spread * 2);
                delay = (delay + offset).saturating_sub(spread);
            }
        }

        if kind == ErrorKind::QuotaExceeded {
            delay = delay.max(self.quota_floor_ms);
        }

        delay
    }
}

/// How a retried operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    Failed(ClassifiedError),
    Cancelled,
}

/// Result of [`RetryCoordinator::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult<T> {
    pub outcome: RetryOutcome<T>,
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// Sum of completed backoff sleeps.
    pub total_delay_ms: u64,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RetryOutcome::Succeeded(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, RetryOutcome::Cancelled)
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            RetryOutcome::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        match &self.outcome {
            RetryOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            RetryOutcome::Succeeded(v) => Some(v),
            _ => None,
        }
    }
}

/// Observation points of a retry run. Every method defaults to a no-op.
#[async_trait]
pub trait RetryHooks<T: Send + Sync>: Send {
    /// The operation succeeded. Not called after cancellation.
    async fn on_success(&mut self, _value: &T) {}

    /// The operation failed for good. Not called after cancellation.
    async fn on_failure(&mut self, _error: &ClassifiedError) {}

    /// A retry is scheduled after `delay_ms`.
    async fn on_retry(&mut self, _attempt: u32, _error: &ClassifiedError, _delay_ms: u64) {}

    /// The backoff elapsed and `attempt` is about to start. Cancelling the
    /// token from here aborts the run before the operation is invoked.
    async fn before_attempt(&mut self, _attempt: u32) {}
}

/// Hooks that observe nothing.
pub struct NoHooks;

#[async_trait]
impl<T: Send + Sync> RetryHooks<T> for NoHooks {}

/// Executes operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    classifier: Classifier,
    context: Option<ErrorContext>,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Classifier::default(),
            context: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Diagnostic context copied into every classified error.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// retry budget or `cancel` fires.
    pub async fn execute<T, E, F, Fut, H>(
        &self,
        mut operation: F,
        hooks: &mut H,
        cancel: &CancellationToken,
    ) -> RetryResult<T>
    where
        T: Send + Sync,
        E: Into<Failure>,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        H: RetryHooks<T> + ?Sized,
    {
        let mut attempt: u32 = 1;
        let mut total_delay_ms: u64 = 0;

        let finish = |outcome, attempts, total_delay_ms| RetryResult {
            outcome,
            attempts,
            total_delay_ms,
        };

        loop {
            if attempt > 1 {
                hooks.before_attempt(attempt).await;
            }
            if cancel.is_cancelled() {
                debug!(attempt, "Retry run cancelled before attempt");
                return finish(RetryOutcome::Cancelled, attempt - 1, total_delay_ms);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = operation() => Some(r),
            };

            let result = match result {
                Some(r) if !cancel.is_cancelled() => r,
                _ => {
                    debug!(attempt, "Retry run cancelled during attempt");
                    return finish(RetryOutcome::Cancelled, attempt, total_delay_ms);
                }
            };

            let failure: Failure = match result {
                Ok(value) => {
                    hooks.on_success(&value).await;
                    return finish(RetryOutcome::Succeeded(value), attempt, total_delay_ms);
                }
                Err(e) => e.into(),
            };

            let context = self
                .context
                .clone()
                .unwrap_or_else(ErrorContext::new)
                .with_field("attempt", attempt.to_string());
            let error = self.classifier.classify(&failure, context);

            if !error.retryable || attempt > self.policy.max_retries {
                warn!(
                    attempt,
                    error_kind = %error.kind,
                    retryable = error.retryable,
                    "Operation failed permanently"
                );
                hooks.on_failure(&error).await;
                return finish(RetryOutcome::Failed(error), attempt, total_delay_ms);
            }

            let delay_ms = self.policy.delay_for(attempt, error.kind);
            debug!(attempt, delay_ms, error_kind = %error.kind, "Retrying after failure");
            hooks.on_retry(attempt, &error, delay_ms).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Retry run cancelled during backoff");
                    return finish(RetryOutcome::Cancelled, attempt, total_delay_ms);
                }
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }

            total_delay_ms += delay_ms;
            attempt += 1;
        }
    }
}

/// Convenience wrapper building a one-off coordinator from `policy`.
pub async fn execute_with_retry<T, E, F, Fut, H>(
    operation: F,
    policy: &RetryPolicy,
    hooks: &mut H,
    cancel: &CancellationToken,
) -> RetryResult<T>
where
    T: Send + Sync,
    E: Into<Failure>,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    H: RetryHooks<T> + ?Sized,
{
    RetryCoordinator::new(policy.clone())
        .execute(operation, hooks, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingHooks {
        successes: u32,
        failures: u32,
        retries: Vec<(u32, ErrorKind, u64)>,
        before: Vec<u32>,
    }

    #[async_trait]
    impl RetryHooks<String> for RecordingHooks {
        async fn on_success(&mut self, _value: &String) {
            self.successes += 1;
        }

        async fn on_failure(&mut self, _error: &ClassifiedError) {
            self.failures += 1;
        }

        async fn on_retry(&mut self, attempt: u32, error: &ClassifiedError, delay_ms: u64) {
            self.retries.push((attempt, error.kind, delay_ms));
        }

        async fn before_attempt(&mut self, attempt: u32) {
            self.before.push(attempt);
        }
    }

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::default().with_jitter(false)
    }

    #[test]
    fn test_policy_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay_ms, 1000);
        assert_eq!(p.max_delay_ms, 30_000);
        assert_eq!(p.backoff_multiplier, 2.0);
        assert!(p.jitter);
        assert_eq!(p.quota_floor_ms, 60_000);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let p = no_jitter();
        let delays: Vec<u64> = (1..=7).map(|a| p.backoff_delay_ms(a)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(p.delay_for(3, ErrorKind::Timeout), 4000);
    }

    #[test]
    fn test_backoff_huge_attempt_saturates() {
        let p = no_jitter();
        assert_eq!(p.backoff_delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let p = no_jitter().with_base_delay_ms(50_000);
        assert_eq!(p.backoff_delay_ms(1), 30_000);
    }

    #[test]
    fn test_jitter_within_ten_percent() {
        let p = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=8 {
            let base = p.backoff_delay_ms(attempt);
            for _ in 0..200 {
                let d = p.delay_with_rng(attempt, ErrorKind::TransientNetwork, &mut rng);
                assert!(d >= base - base / 10, "{d} below band for {base}");
                assert!(d <= base + base / 10, "{d} above band for {base}");
            }
        }
    }

    #[test]
    fn test_jitter_on_zero_delay_stays_zero() {
        let p = RetryPolicy::default().with_base_delay_ms(0);
        assert_eq!(p.delay_for(1, ErrorKind::Timeout), 0);
    }

    #[test]
    fn test_quota_floor_every_attempt() {
        let p = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(11);
        for attempt in 1..=10 {
            for _ in 0..50 {
                assert!(p.delay_with_rng(attempt, ErrorKind::QuotaExceeded, &mut rng) >= 60_000);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let mut hooks = RecordingHooks::default();
        let result = execute_with_retry(
            || async { Ok::<_, Failure>("summary".to_string()) },
            &no_jitter(),
            &mut hooks,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.outcome, RetryOutcome::Succeeded("summary".to_string()));
        assert_eq!(result.attempts, 1);
        assert_eq!(result.total_delay_ms, 0);
        assert_eq!(hooks.successes, 1);
        assert!(hooks.before.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks = RecordingHooks::default();

        let c = calls.clone();
        let result = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Failure::from("connection reset by peer"))
                    } else {
                        Ok("tags".to_string())
                    }
                }
            },
            &no_jitter(),
            &mut hooks,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.total_delay_ms, 3000);
        assert_eq!(
            hooks.retries,
            vec![
                (1, ErrorKind::TransientNetwork, 1000),
                (2, ErrorKind::TransientNetwork, 2000)
            ]
        );
        assert_eq!(hooks.before, vec![2, 3]);
        assert_eq!(hooks.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks = RecordingHooks::default();

        let c = calls.clone();
        let result = execute_with_retry(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>("request timed out") }
            },
            &no_jitter().with_max_retries(2),
            &mut hooks,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error().map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(hooks.failures, 1);
        assert_eq!(hooks.retries.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_fails_without_retry() {
        let mut hooks = RecordingHooks::default();
        let result = execute_with_retry(
            || async { Err::<String, _>(Failure::validation("note content is empty")) },
            &no_jitter(),
            &mut hooks,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.attempts, 1);
        let err = result.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
        assert_eq!(err.context.extra.get("attempt").map(String::as_str), Some("1"));
        assert!(hooks.retries.is_empty());
        assert_eq!(hooks.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_uses_floor_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks = RecordingHooks::default();

        let c = calls.clone();
        let result = execute_with_retry(
            move || {
                let first = c.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(Failure::http(429, "Too Many Requests"))
                    } else {
                        Ok("ok".to_string())
                    }
                }
            },
            &RetryPolicy::default(),
            &mut hooks,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_success());
        assert!(result.total_delay_ms >= 60_000);
        assert_eq!(hooks.retries[0].1, ErrorKind::QuotaExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_suppresses_terminal_hooks() {
        let cancel = CancellationToken::new();
        let mut hooks = RecordingHooks::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result = execute_with_retry(
            || async { Err::<String, _>("network unreachable") },
            &no_jitter(),
            &mut hooks,
            &cancel,
        )
        .await;

        assert!(result.is_cancelled());
        assert_eq!(result.attempts, 1);
        assert_eq!(hooks.successes, 0);
        assert_eq!(hooks.failures, 0);
        assert_eq!(hooks.retries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_operation() {
        let cancel = CancellationToken::new();
        let mut hooks = RecordingHooks::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = execute_with_retry(
            || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, Failure>("late".to_string())
            },
            &no_jitter(),
            &mut hooks,
            &cancel,
        )
        .await;

        assert!(result.is_cancelled());
        assert_eq!(hooks.successes, 0);
        assert_eq!(hooks.failures, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_invokes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result = execute_with_retry(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Failure>(()) }
            },
            &RetryPolicy::default(),
            &mut NoHooks,
            &cancel,
        )
        .await;

        assert!(result.is_cancelled());
        assert_eq!(result.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_coordinator_context_is_attached() {
        let coordinator = RetryCoordinator::new(no_jitter().with_max_retries(0))
            .with_context(ErrorContext::new().with_subject("note-9").with_operation("tags"));

        let result = coordinator
            .execute(
                || async { Err::<(), _>("boom") },
                &mut NoHooks,
                &CancellationToken::new(),
            )
            .await;

        let err = result.error().unwrap();
        assert_eq!(err.context.subject_id.as_deref(), Some("note-9"));
        assert_eq!(err.context.operation.as_deref(), Some("tags"));
        assert_eq!(coordinator.policy().max_retries, 0);
    }
}
