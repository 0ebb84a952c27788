//! Centralized default constants for quill.
//!
//! **This module is the single source of truth** for job coordination
//! defaults. Configuration types in `quill-jobs` start from these values and
//! only diverge through explicit builder calls or `from_env` at construction.

// =============================================================================
// JOB REGISTRY
// =============================================================================

/// Maximum number of jobs allowed in `running` at the same time.
pub const JOB_MAX_CONCURRENT: usize = 2;

/// Default per-job timeout in milliseconds before the watchdog fires.
pub const JOB_TIMEOUT_MS: u64 = 10_000;

/// How long a succeeded or cancelled job stays visible after completion.
pub const JOB_SUCCESS_GRACE_MS: u64 = 2_000;

/// How long a failed or timed out job stays visible after completion.
pub const JOB_FAILURE_GRACE_MS: u64 = 5_000;

/// Broadcast capacity of the registry-wide status feed.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETRY
// =============================================================================

/// Default maximum retry count after the first attempt.
pub const RETRY_MAX_RETRIES: u32 = 3;

/// Delay before the first retry in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound for the exponential backoff curve in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Growth factor between consecutive retry delays.
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter perturbation as a fraction of the computed delay (±10%).
pub const RETRY_JITTER_RATIO: f64 = 0.1;

/// Minimum delay after a quota/rate-limit failure in milliseconds.
///
/// Matches the upstream rate-limit reset window.
pub const RETRY_QUOTA_FLOOR_MS: u64 = 60_000;

// =============================================================================
// ERROR MESSAGES
// =============================================================================

/// Maximum length of the sanitized detail carried in user-facing messages.
pub const ERROR_DETAIL_MAX_CHARS: usize = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_ordering() {
        assert!(JOB_FAILURE_GRACE_MS > JOB_SUCCESS_GRACE_MS);
    }

    #[test]
    fn test_retry_bounds_consistent() {
        assert!(RETRY_BASE_DELAY_MS <= RETRY_MAX_DELAY_MS);
        assert!(RETRY_QUOTA_FLOOR_MS > RETRY_MAX_DELAY_MS);
        assert!(RETRY_JITTER_RATIO > 0.0 && RETRY_JITTER_RATIO < 1.0);
    }
}
