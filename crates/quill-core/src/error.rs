//! Error types for quill.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using quill's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for quill operations.
///
/// Variants that name a failure mode (`Request`, `Timeout`, `RateLimited`,
/// `Upstream`, `InvalidInput`) are recognized by the job classifier as
/// already-typed failures. Free-text variants are classified by message.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job was not accepted by the registry
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Upstream service reported an internal fault
    #[error("Upstream fault: {0}")]
    Upstream(String),

    /// Upstream rate limit or quota exhausted
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("job j1".to_string());
        assert_eq!(err.to_string(), "Not found: job j1");
    }

    #[test]
    fn test_error_display_rejected() {
        let err = Error::Rejected("concurrency limit reached".to_string());
        assert_eq!(err.to_string(), "Job rejected: concurrency limit reached");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out after 1500ms");
    }

    #[test]
    fn test_error_display_rate_limited() {
        let err = Error::RateLimited("slow down".to_string());
        assert_eq!(err.to_string(), "Rate limited: slow down");
    }

    #[test]
    fn test_error_display_upstream() {
        let err = Error::Upstream("model crashed".to_string());
        assert_eq!(err.to_string(), "Upstream fault: model crashed");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("QUILL_MAX_CONCURRENT_JOBS must be >= 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: QUILL_MAX_CONCURRENT_JOBS must be >= 1"
        );
    }

    #[test]
    fn test_error_display_request() {
        let err = Error::Request("network unreachable".to_string());
        assert_eq!(err.to_string(), "Request error: network unreachable");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("read timed out"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
