//! Owned deferred actions for job timeouts and post-completion removal.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A spawned delayed action that is aborted when the guard is dropped.
///
/// Job entries store their watchdog and removal timers in guards, so
/// replacing or clearing the field is enough to disarm the timer on every
/// retirement path.
#[derive(Debug)]
pub struct TimerGuard {
    handle: Option<JoinHandle<()>>,
}

impl TimerGuard {
    /// Run `action` after `delay` unless the guard is dropped first.
    pub fn arm<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Release the timer without aborting it.
    ///
    /// Used by a timer's own action when it retires itself, so the running
    /// task is not cancelled mid-action.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
