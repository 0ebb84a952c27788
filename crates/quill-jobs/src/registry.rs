//! In-memory registry of in-flight AI jobs.
//!
//! The registry owns every job record, enforces the global concurrency
//! ceiling, arms a timeout watchdog per running job and fans status updates
//! out to subscribers. All state sits behind one mutex; updates are sent
//! while it is held so each job's subscribers observe transitions in order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quill_core::defaults;
use quill_core::{
    ClassifiedError, ErrorContext, ErrorKind, EventBus, Job, JobId, JobKind, JobStatus,
    JobStatusUpdate,
};

use crate::classifier::{Classifier, Failure};
use crate::retry::RetryPolicy;
use crate::watchdog::TimerGuard;

/// Construction-time configuration of a [`JobRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of jobs in `running` at once.
    pub max_concurrent_jobs: usize,
    /// Timeout applied when a [`JobSpec`] does not set one.
    pub default_timeout: Duration,
    /// Visibility window after success or cancellation.
    pub success_grace: Duration,
    /// Visibility window after failure or timeout.
    pub failure_grace: Duration,
    /// Retry budget and backoff used by `retry_job` hints and `run_tracked`.
    pub retry_policy: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            default_timeout: Duration::from_millis(defaults::JOB_TIMEOUT_MS),
            success_grace: Duration::from_millis(defaults::JOB_SUCCESS_GRACE_MS),
            failure_grace: Duration::from_millis(defaults::JOB_FAILURE_GRACE_MS),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// Read once at construction; the registry never consults the
    /// environment afterwards.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUILL_MAX_CONCURRENT_JOBS` | `2` | Concurrency ceiling |
    /// | `QUILL_JOB_TIMEOUT_MS` | `10000` | Default per-job timeout |
    /// | `QUILL_MAX_RETRIES` | `3` | Retry budget per job |
    /// | `QUILL_RETRY_BASE_DELAY_MS` | `1000` | First backoff delay |
    /// | `QUILL_RETRY_MAX_DELAY_MS` | `30000` | Backoff cap |
    /// | `QUILL_RETRY_JITTER` | `true` | Enable ±10% jitter |
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
        }

        let defaults = Self::default();

        let max_concurrent_jobs = parsed::<usize>("QUILL_MAX_CONCURRENT_JOBS")
            .unwrap_or(defaults.max_concurrent_jobs)
            .max(1);

        let default_timeout = parsed::<u64>("QUILL_JOB_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.default_timeout);

        let mut retry_policy = defaults.retry_policy;
        if let Some(n) = parsed::<u32>("QUILL_MAX_RETRIES") {
            retry_policy.max_retries = n;
        }
        if let Some(ms) = parsed::<u64>("QUILL_RETRY_BASE_DELAY_MS") {
            retry_policy.base_delay_ms = ms;
        }
        if let Some(ms) = parsed::<u64>("QUILL_RETRY_MAX_DELAY_MS") {
            retry_policy.max_delay_ms = ms;
        }
        if let Ok(v) = std::env::var("QUILL_RETRY_JITTER") {
            retry_policy.jitter = v != "false" && v != "0";
        }

        Self {
            max_concurrent_jobs,
            default_timeout,
            retry_policy,
            ..defaults
        }
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_success_grace(mut self, grace: Duration) -> Self {
        self.success_grace = grace;
        self
    }

    pub fn with_failure_grace(mut self, grace: Duration) -> Self {
        self.failure_grace = grace;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Parameters for starting a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub kind: JobKind,
    pub subject_id: String,
    /// Overrides [`RegistryConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Overrides the retry policy's `max_retries`.
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(id: impl Into<JobId>, kind: JobKind, subject_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            subject_id: subject_id.into(),
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Ordered stream of status updates for one job id.
///
/// Ends when the job is removed from the registry.
pub struct JobSubscription {
    rx: mpsc::UnboundedReceiver<JobStatusUpdate>,
}

impl JobSubscription {
    pub async fn recv(&mut self) -> Option<JobStatusUpdate> {
        self.rx.recv().await
    }

    /// Next update if one is already queued.
    pub fn try_recv(&mut self) -> Option<JobStatusUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Stream for JobSubscription {
    type Item = JobStatusUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type Subscribers = HashMap<JobId, Vec<mpsc::UnboundedSender<JobStatusUpdate>>>;

struct JobEntry {
    job: Job,
    /// Bumped whenever a timer is armed; timers act only on their own generation.
    generation: u64,
    watchdog: Option<TimerGuard>,
    reaper: Option<TimerGuard>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobId, JobEntry>,
    subscribers: Subscribers,
}

impl RegistryState {
    fn active_count(&self) -> usize {
        self.jobs.values().filter(|e| e.job.is_running()).count()
    }
}

struct Inner {
    config: RegistryConfig,
    classifier: Classifier,
    events: EventBus,
    state: Mutex<RegistryState>,
}

/// Shared handle to a job registry. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl JobRegistry {
    /// Create a new registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_classifier(config, Classifier::default())
    }

    /// Create a registry that interprets failures with a custom classifier.
    pub fn with_classifier(config: RegistryConfig, classifier: Classifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                classifier,
                events: EventBus::default(),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    /// Start tracking a job in `running`.
    ///
    /// Returns `false` without side effects when the concurrency ceiling is
    /// reached or the id belongs to a job that is not terminal yet. A
    /// terminal job still inside its grace period is replaced.
    pub async fn start_job(&self, spec: JobSpec) -> bool {
        let mut state = self.inner.state.lock().await;

        if let Some(existing) = state.jobs.get(&spec.id) {
            if !existing.job.is_terminal() {
                debug!(job_id = %spec.id, status = %existing.job.status, "Rejected duplicate job id");
                return false;
            }
        }

        let active = state.active_count();
        if active >= self.inner.config.max_concurrent_jobs {
            debug!(job_id = %spec.id, active_count = active, "Rejected job at concurrency limit");
            return false;
        }

        let now = Utc::now();
        let timeout = spec.timeout.unwrap_or(self.inner.config.default_timeout);
        let job = Job {
            id: spec.id.clone(),
            kind: spec.kind,
            subject_id: spec.subject_id,
            status: JobStatus::Running,
            progress: 0,
            message: None,
            error: None,
            retry_count: 0,
            max_retries: spec
                .max_retries
                .unwrap_or(self.inner.config.retry_policy.max_retries),
            timeout_ms: duration_ms(timeout),
            created_at: now,
            started_at: Some(now),
            timeout_at: deadline(now, timeout),
            completed_at: None,
        };

        let mut entry = JobEntry {
            job,
            generation: 0,
            watchdog: None,
            reaper: None,
            cancel: CancellationToken::new(),
        };
        self.inner.arm_watchdog(&mut entry);
        let update = JobStatusUpdate::from_job(&entry.job);

        let RegistryState { jobs, subscribers } = &mut *state;
        jobs.insert(spec.id.clone(), entry);
        self.inner.emit(subscribers, update);

        info!(
            job_id = %spec.id,
            job_kind = %spec.kind,
            timeout_ms = duration_ms(timeout),
            active_count = active + 1,
            "Job started"
        );
        true
    }

    /// Subscribe to every status update of `id`.
    ///
    /// If the job already exists the subscription first yields a snapshot of
    /// its current state, so late subscribers still observe a final status
    /// during the grace period.
    pub async fn subscribe(&self, id: impl Into<JobId>) -> JobSubscription {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.jobs.get(&id) {
            let _ = tx.send(JobStatusUpdate::from_job(&entry.job));
        }
        // Drop subscriptions whose receivers are gone, including ones for
        // ids that never started.
        state.subscribers.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        state.subscribers.entry(id).or_default().push(tx);

        JobSubscription { rx }
    }

    /// Invoke `callback` for every update of `id`, in order, on a spawned task.
    pub async fn subscribe_with<F>(&self, id: impl Into<JobId>, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(JobStatusUpdate) + Send + 'static,
    {
        let mut subscription = self.subscribe(id).await;
        tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                callback(update);
            }
        })
    }

    /// Registry-wide feed of every update for every job.
    pub fn events(&self) -> broadcast::Receiver<JobStatusUpdate> {
        self.inner.events.subscribe()
    }

    /// Emit an intermediate update. No-op unless the job is `running`.
    pub async fn report_progress(&self, id: &str, percent: u8, message: Option<&str>) -> bool {
        let mut state = self.inner.state.lock().await;
        let RegistryState { jobs, subscribers } = &mut *state;

        let Some(entry) = jobs.get_mut(id).filter(|e| e.job.is_running()) else {
            return false;
        };
        entry.job.progress = percent.min(100);
        entry.job.message = message.map(String::from);

        let update = JobStatusUpdate::from_job(&entry.job);
        self.inner.emit(subscribers, update);
        true
    }

    /// Mark a running job `succeeded`.
    pub async fn report_success(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let RegistryState { jobs, subscribers } = &mut *state;

        let Some(entry) = jobs.get_mut(id).filter(|e| e.job.is_running()) else {
            debug!(job_id = id, "Ignored success report for job that is not running");
            return false;
        };
        entry.job.status = JobStatus::Succeeded;
        entry.job.progress = 100;
        entry.job.completed_at = Some(Utc::now());
        self.inner
            .schedule_removal(entry, self.inner.config.success_grace);

        let update = JobStatusUpdate::from_job(&entry.job);
        info!(job_id = id, retry_count = entry.job.retry_count, "Job succeeded");
        self.inner.emit(subscribers, update);
        true
    }

    /// Classify `failure` and mark a running job `failed`.
    pub async fn report_failure(&self, id: &str, failure: impl Into<Failure>) -> bool {
        let failure = failure.into();
        let mut state = self.inner.state.lock().await;

        let Some(entry) = state.jobs.get(id).filter(|e| e.job.is_running()) else {
            debug!(job_id = id, "Ignored failure report for job that is not running");
            return false;
        };
        let error = self
            .inner
            .classifier
            .classify(&failure, error_context(&entry.job));

        self.inner
            .record_failure(&mut state, id, error, Duration::ZERO)
    }

    /// Store an already classified failure on a running job.
    ///
    /// `extra_grace` extends the removal window, e.g. by a pending backoff.
    pub(crate) async fn fail_with(
        &self,
        id: &str,
        error: ClassifiedError,
        extra_grace: Duration,
    ) -> bool {
        let mut state = self.inner.state.lock().await;
        self.inner.record_failure(&mut state, id, error, extra_grace)
    }

    /// Move a retryable `failed` job back to `running`.
    ///
    /// Returns `false` if the job is absent, not `failed`, failed with a
    /// non-retryable error, out of retry budget, or if restarting it would
    /// exceed the concurrency ceiling.
    pub async fn retry_job(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let active = state.active_count();
        let RegistryState { jobs, subscribers } = &mut *state;

        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        if !entry.job.can_retry() {
            debug!(job_id = id, status = %entry.job.status, "Job not eligible for retry");
            return false;
        }
        if active >= self.inner.config.max_concurrent_jobs {
            debug!(job_id = id, active_count = active, "Retry rejected at concurrency limit");
            return false;
        }

        let now = Utc::now();
        entry.reaper = None;
        entry.job.status = JobStatus::Running;
        entry.job.retry_count += 1;
        entry.job.progress = 0;
        entry.job.message = Some("retrying".to_string());
        entry.job.error = None;
        entry.job.started_at = Some(now);
        entry.job.timeout_at = deadline(now, Duration::from_millis(entry.job.timeout_ms));
        entry.job.completed_at = None;
        self.inner.arm_watchdog(entry);

        let update = JobStatusUpdate::from_job(&entry.job);
        info!(job_id = id, retry_count = entry.job.retry_count, "Job retrying");
        self.inner.emit(subscribers, update);
        true
    }

    /// Cancel a job the caller no longer cares about.
    ///
    /// Valid while the job is `running` or `failed` awaiting a retry. Trips
    /// the job's cancellation token so in-flight work observes it.
    pub async fn cancel_job(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let RegistryState { jobs, subscribers } = &mut *state;

        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        let cancellable = matches!(entry.job.status, JobStatus::Running | JobStatus::Pending)
            || entry.job.can_retry();
        if !cancellable {
            return false;
        }

        entry.job.status = JobStatus::Cancelled;
        entry.job.message = Some("cancelled".to_string());
        entry.job.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        self.inner
            .schedule_removal(entry, self.inner.config.success_grace);

        let update = JobStatusUpdate::from_job(&entry.job);
        info!(job_id = id, "Job cancelled");
        self.inner.emit(subscribers, update);
        true
    }

    /// Cancel every job that can still be cancelled. Returns how many were.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<JobId> = {
            let state = self.inner.state.lock().await;
            state
                .jobs
                .values()
                .filter(|e| !e.job.is_terminal())
                .map(|e| e.job.id.clone())
                .collect()
        };

        let mut cancelled = 0;
        for id in ids {
            if self.cancel_job(id.as_str()).await {
                cancelled += 1;
            }
        }
        info!(cancelled, "Job registry shut down");
        cancelled
    }

    /// Snapshot of a job, if still tracked.
    pub async fn get_job(&self, id: &str) -> Option<Job> {
        let state = self.inner.state.lock().await;
        state.jobs.get(id).map(|e| e.job.clone())
    }

    /// All tracked jobs for a subject, oldest first.
    pub async fn jobs_for_subject(&self, subject_id: &str) -> Vec<Job> {
        let state = self.inner.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|e| e.job.subject_id == subject_id)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Number of jobs currently `running`.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active_count()
    }

    /// Token tripped when the job is cancelled or times out.
    pub async fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        let state = self.inner.state.lock().await;
        state.jobs.get(id).map(|e| e.cancel.clone())
    }

    /// Backoff the retry policy recommends before retrying a failed job.
    pub async fn suggested_retry_delay(&self, id: &str) -> Option<Duration> {
        let state = self.inner.state.lock().await;
        let job = &state.jobs.get(id)?.job;
        if !job.can_retry() {
            return None;
        }
        let kind = job.error.as_ref().map_or(ErrorKind::Unknown, |e| e.kind);
        let ms = self
            .inner
            .config
            .retry_policy
            .delay_for(job.retry_count + 1, kind);
        Some(Duration::from_millis(ms))
    }
}

impl Inner {
    /// Deliver an update to the job's subscribers, then to the event bus.
    fn emit(&self, subscribers: &mut Subscribers, update: JobStatusUpdate) {
        if let Some(senders) = subscribers.get_mut(&update.job_id) {
            senders.retain(|tx| tx.send(update.clone()).is_ok());
        }
        self.events.emit(update);
    }

    fn record_failure(
        self: &Arc<Self>,
        state: &mut RegistryState,
        id: &str,
        error: ClassifiedError,
        extra_grace: Duration,
    ) -> bool {
        let RegistryState { jobs, subscribers } = state;
        let Some(entry) = jobs.get_mut(id).filter(|e| e.job.is_running()) else {
            return false;
        };

        entry.job.status = JobStatus::Failed;
        entry.job.message = Some(error.message.clone());
        entry.job.completed_at = Some(Utc::now());
        entry.job.error = Some(error);
        self.schedule_removal(entry, self.config.failure_grace + extra_grace);

        let update = JobStatusUpdate::from_job(&entry.job);
        warn!(
            job_id = id,
            error_kind = ?update.error.as_ref().map(|e| e.kind),
            retry_count = entry.job.retry_count,
            can_retry = entry.job.can_retry(),
            "Job failed"
        );
        self.emit(subscribers, update);
        true
    }

    fn arm_watchdog(self: &Arc<Self>, entry: &mut JobEntry) {
        entry.generation += 1;
        let generation = entry.generation;
        let id = entry.job.id.clone();
        let weak = Arc::downgrade(self);
        let timeout = Duration::from_millis(entry.job.timeout_ms);

        entry.watchdog = Some(TimerGuard::arm(timeout, async move {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.fire_timeout(&id, generation).await;
            }
        }));
    }

    /// Disarm the watchdog and arm removal after `grace`.
    fn schedule_removal(self: &Arc<Self>, entry: &mut JobEntry, grace: Duration) {
        entry.watchdog = None;
        entry.generation += 1;
        let generation = entry.generation;
        let id = entry.job.id.clone();
        let weak = Arc::downgrade(self);

        entry.reaper = Some(TimerGuard::arm(grace, async move {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.remove_if_current(&id, generation).await;
            }
        }));
    }

    async fn fire_timeout(self: Arc<Self>, id: &JobId, generation: u64) {
        let mut state = self.state.lock().await;
        let RegistryState { jobs, subscribers } = &mut *state;

        let Some(entry) = jobs
            .get_mut(id)
            .filter(|e| e.generation == generation && e.job.is_running())
        else {
            return;
        };

        // This task is the watchdog; release it instead of aborting itself.
        if let Some(watchdog) = entry.watchdog.take() {
            watchdog.detach();
        }

        let failure = Failure::typed(
            ErrorKind::Timeout,
            format!("job exceeded timeout of {}ms", entry.job.timeout_ms),
        );
        let error = self.classifier.classify(&failure, error_context(&entry.job));

        entry.job.status = JobStatus::TimedOut;
        entry.job.message = Some(error.message.clone());
        entry.job.error = Some(error);
        entry.job.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        self.schedule_removal(entry, self.config.failure_grace);

        let update = JobStatusUpdate::from_job(&entry.job);
        warn!(job_id = %id, timeout_ms = entry.job.timeout_ms, "Job timed out");
        self.emit(subscribers, update);
    }

    async fn remove_if_current(self: Arc<Self>, id: &JobId, generation: u64) {
        let mut state = self.state.lock().await;

        let current = state
            .jobs
            .get(id)
            .is_some_and(|e| e.generation == generation);
        if !current {
            return;
        }

        if let Some(mut entry) = state.jobs.remove(id) {
            if let Some(reaper) = entry.reaper.take() {
                reaper.detach();
            }
            debug!(job_id = %id, status = %entry.job.status, "Job removed after grace period");
        }
        // Dropping the senders ends every subscription for this id.
        state.subscribers.remove(id);
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn deadline(start: chrono::DateTime<Utc>, timeout: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
}

fn error_context(job: &Job) -> ErrorContext {
    ErrorContext::new()
        .with_subject(job.subject_id.clone())
        .with_operation(job.kind.as_str())
        .with_field("job_id", job.id.as_str())
        .with_field("retry_count", job.retry_count.to_string())
}
