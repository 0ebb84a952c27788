//! # quill-jobs
//!
//! Coordination layer for AI-assisted note operations (summaries, tags).
//!
//! This crate provides:
//! - Failure classification into a typed taxonomy with severity and retryability
//! - Retry with exponential backoff, jitter and a quota floor
//! - An in-memory job registry with a concurrency ceiling, per-job timeouts
//!   and ordered status subscriptions
//!
//! ## Example
//!
//! ```ignore
//! use quill_jobs::{JobKind, JobRegistry, JobSpec, RegistryConfig};
//!
//! let registry = JobRegistry::new(RegistryConfig::from_env());
//!
//! // Watch the job
//! let mut updates = registry.subscribe("summary-42").await;
//! tokio::spawn(async move {
//!     while let Some(update) = updates.recv().await {
//!         println!("{} {}", update.job_id, update.status);
//!     }
//! });
//!
//! // Run the AI call with retries mirrored into the registry
//! let result = registry
//!     .run_tracked(JobSpec::new("summary-42", JobKind::Summary, "note-42"), || {
//!         generator.generate(&prompt)
//!     })
//!     .await?;
//! ```

pub mod classifier;
pub mod generator;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod tracked;
pub mod watchdog;

// Re-export core types
pub use quill_core::*;

pub use classifier::{classify, classify_message, Classifier, Failure, SeverityTable};
pub use generator::{Generator, GeneratorCall, ScriptedGenerator};
pub use registry::{JobRegistry, JobSpec, JobSubscription, RegistryConfig};
pub use retry::{
    execute_with_retry, NoHooks, RetryCoordinator, RetryHooks, RetryOutcome, RetryPolicy,
    RetryResult,
};
pub use sanitize::sanitize_message;
pub use watchdog::TimerGuard;
