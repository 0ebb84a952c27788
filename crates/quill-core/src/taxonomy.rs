//! Typed failure taxonomy shared by the classifier, retry coordinator and
//! job registry.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Connectivity problem between us and the AI service.
    TransientNetwork,
    /// The operation or its transport exceeded a deadline.
    Timeout,
    /// Upstream rate limit or quota exhausted.
    QuotaExceeded,
    /// The input was rejected; retrying the same input cannot help.
    Validation,
    /// The upstream service failed internally.
    UpstreamFault,
    /// Nothing recognizable in the failure.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in classification precedence order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::QuotaExceeded,
        ErrorKind::Timeout,
        ErrorKind::TransientNetwork,
        ErrorKind::Validation,
        ErrorKind::UpstreamFault,
        ErrorKind::Unknown,
    ];

    /// Wire name, e.g. `"quota-exceeded"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::Validation => "validation",
            ErrorKind::UpstreamFault => "upstream-fault",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a classified failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Diagnostic context attached to a classified error.
///
/// Never shown to end users; only [`ClassifiedError::message`] is display-safe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Free-form diagnostic fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Empty context stamped with the current time.
    pub fn new() -> Self {
        Self {
            subject_id: None,
            caller_id: None,
            operation: None,
            timestamp: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attach an arbitrary diagnostic field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A failure mapped into the typed taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    /// Human-readable text that is safe to display.
    pub message: String,
    pub context: ErrorContext,
}

impl ClassifiedError {
    /// Retryability rule: validation failures and critical failures are final.
    pub fn is_retryable(kind: ErrorKind, severity: Severity) -> bool {
        kind != ErrorKind::Validation && severity != Severity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        for kind in ErrorKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn test_retryability_rule() {
        assert!(ClassifiedError::is_retryable(ErrorKind::TransientNetwork, Severity::Medium));
        assert!(ClassifiedError::is_retryable(ErrorKind::QuotaExceeded, Severity::High));
        assert!(!ClassifiedError::is_retryable(ErrorKind::Validation, Severity::Low));
        assert!(!ClassifiedError::is_retryable(ErrorKind::Timeout, Severity::Critical));
    }

    #[test]
    fn test_context_builder_and_serialization() {
        let ctx = ErrorContext::new()
            .with_subject("note-1")
            .with_operation("summary")
            .with_field("attempt", "2");

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["subject_id"], "note-1");
        assert_eq!(json["operation"], "summary");
        assert_eq!(json["extra"]["attempt"], "2");
        assert!(json.get("caller_id").is_none());
    }

    #[test]
    fn test_classified_error_display_uses_message_only() {
        let err = ClassifiedError {
            kind: ErrorKind::Timeout,
            severity: Severity::Medium,
            retryable: true,
            message: "The AI service took too long to respond.".to_string(),
            context: ErrorContext::new().with_field("raw_error", "secret detail"),
        };
        assert_eq!(err.to_string(), "The AI service took too long to respond.");
    }
}
