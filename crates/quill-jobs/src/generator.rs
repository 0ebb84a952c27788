//! The opaque AI call wrapped by jobs, plus a scripted backend for tests.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use quill_jobs::{Failure, Generator, ScriptedGenerator};
//!
//! # async fn demo() {
//! let generator = ScriptedGenerator::new()
//!     .then_err(Failure::http(503, "upstream overloaded"))
//!     .then_ok("A short summary.");
//!
//! assert!(generator.generate("summarize").await.is_err());
//! assert_eq!(generator.generate("summarize").await.unwrap(), "A short summary.");
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::classifier::Failure;

/// A text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, Failure>;
}

/// One recorded call to a [`ScriptedGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorCall {
    pub prompt: String,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Result<String, Failure>>,
    calls: Vec<GeneratorCall>,
}

/// Generator that replays scripted outcomes in order.
///
/// Once the script is exhausted every call returns the default response.
#[derive(Clone)]
pub struct ScriptedGenerator {
    script: Arc<Mutex<Script>>,
    default_response: String,
    latency: Duration,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            default_response: "Mock response".to_string(),
            latency: Duration::ZERO,
        }
    }

    /// Response returned after the script runs out.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Simulated latency for every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a successful completion.
    pub fn then_ok(self, response: impl Into<String>) -> Self {
        self.push(Ok(response.into()));
        self
    }

    /// Queue a failure.
    pub fn then_err(self, failure: impl Into<Failure>) -> Self {
        self.push(Err(failure.into()));
        self
    }

    /// Queue the same failure `n` times.
    pub fn failing_times(self, n: usize, failure: Failure) -> Self {
        for _ in 0..n {
            self.push(Err(failure.clone()));
        }
        self
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn push(&self, outcome: Result<String, Failure>) {
        self.lock().outcomes.push_back(outcome);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String, Failure> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = {
            let mut script = self.lock();
            script.calls.push(GeneratorCall {
                prompt: prompt.to_string(),
                at: Instant::now(),
            });
            script.outcomes.pop_front()
        };

        next.unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}
