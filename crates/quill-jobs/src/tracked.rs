//! Retried operations whose lifecycle is mirrored into the job registry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use quill_core::{ClassifiedError, Error, ErrorContext, JobId, Result};

use crate::classifier::Failure;
use crate::registry::{JobRegistry, JobSpec};
use crate::retry::{RetryCoordinator, RetryHooks, RetryResult};

/// Hooks translating retry events into registry transitions.
struct TrackingHooks {
    registry: JobRegistry,
    id: JobId,
    run_cancel: CancellationToken,
}

#[async_trait]
impl<T: Send + Sync> RetryHooks<T> for TrackingHooks {
    async fn on_success(&mut self, _value: &T) {
        self.registry.report_success(self.id.as_str()).await;
    }

    async fn on_failure(&mut self, error: &ClassifiedError) {
        self.registry
            .fail_with(self.id.as_str(), error.clone(), Duration::ZERO)
            .await;
    }

    async fn on_retry(&mut self, _attempt: u32, error: &ClassifiedError, delay_ms: u64) {
        // Keep the failed entry visible for the whole backoff.
        self.registry
            .fail_with(self.id.as_str(), error.clone(), Duration::from_millis(delay_ms))
            .await;
    }

    async fn before_attempt(&mut self, attempt: u32) {
        if !self.registry.retry_job(self.id.as_str()).await {
            debug!(job_id = %self.id, attempt, "Registry refused retry, stopping run");
            self.run_cancel.cancel();
        }
    }
}

impl JobRegistry {
    /// Start `spec` and drive `operation` to completion under the retry policy.
    ///
    /// Every attempt is mirrored into the registry: failures and retries
    /// move the job between `failed` and `running`, and the final outcome
    /// marks it `succeeded` or `failed`. The run stops as soon as the job is
    /// cancelled or times out.
    ///
    /// A retry refused by the concurrency ceiling also ends the run as
    /// [`RetryOutcome::Cancelled`](crate::retry::RetryOutcome::Cancelled),
    /// but the job is left `failed` with its last error and no `cancelled`
    /// update is emitted, so it can still be retried once a slot frees up.
    /// Check [`JobRegistry::get_job`] to tell the two apart.
    ///
    /// Returns [`Error::Rejected`] if the job could not be started.
    pub async fn run_tracked<T, E, F, Fut>(
        &self,
        spec: JobSpec,
        operation: F,
    ) -> Result<RetryResult<T>>
    where
        T: Send + Sync,
        E: Into<Failure>,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let id = spec.id.clone();
        let context = ErrorContext::new()
            .with_subject(spec.subject_id.clone())
            .with_operation(spec.kind.as_str())
            .with_field("job_id", id.as_str());
        let max_retries = spec
            .max_retries
            .unwrap_or(self.config().retry_policy.max_retries);

        if !self.start_job(spec).await {
            return Err(Error::Rejected(format!(
                "job {id} rejected: duplicate id or concurrency limit reached"
            )));
        }

        let job_cancel = self
            .cancellation_token(id.as_str())
            .await
            .ok_or_else(|| Error::Internal(format!("job {id} vanished after start")))?;
        let run_cancel = job_cancel.child_token();

        let coordinator = RetryCoordinator::new(
            self.config().retry_policy.clone().with_max_retries(max_retries),
        )
        .with_classifier(*self.classifier())
        .with_context(context);

        let mut hooks = TrackingHooks {
            registry: self.clone(),
            id: id.clone(),
            run_cancel: run_cancel.clone(),
        };

        let result = coordinator.execute(operation, &mut hooks, &run_cancel).await;
        info!(
            job_id = %id,
            attempts = result.attempts,
            total_delay_ms = result.total_delay_ms,
            success = result.is_success(),
            cancelled = result.is_cancelled(),
            "Tracked job finished"
        );
        Ok(result)
    }
}
