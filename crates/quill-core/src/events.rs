//! Registry-wide event bus for job status updates.
//!
//! Per-job subscribers receive updates through their own ordered mpsc
//! stream. The event bus is the fan-in view: every update for every job is
//! broadcast here so dashboards and telemetry can observe the whole registry
//! without subscribing to individual ids.

use tokio::sync::broadcast;

use crate::models::JobStatusUpdate;

/// Broadcast-based bus distributing [`JobStatusUpdate`]s to many consumers.
///
/// Slow receivers that fall behind receive a `Lagged` error and miss events;
/// per-job subscriptions are the lossless path.
pub struct EventBus {
    tx: broadcast::Sender<JobStatusUpdate>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an update to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, update: JobStatusUpdate) {
        tracing::trace!(
            job_id = %update.job_id,
            status = %update.status,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(update);
    }

    /// Subscribe to every update. Each subscriber gets an independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusUpdate> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
