//! Failure classification into the typed error taxonomy.
//!
//! The classifier is pure: it never fails, never logs and has no side
//! effects. Callers own logging and persistence of the returned value.
//!
//! ## Precedence
//!
//! Opaque messages are matched case-insensitively against keyword lists.
//! When a message carries several signals the first match in this order
//! wins, so a coincidental timeout-like phrase never masks a quota failure:
//!
//! | Order | Kind |
//! |-------|------|
//! | 1 | `quota-exceeded` |
//! | 2 | `timeout` |
//! | 3 | `transient-network` |
//! | 4 | `validation` |
//! | 5 | `unknown` |

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use quill_core::{ClassifiedError, ErrorContext, ErrorKind, Severity};

use crate::sanitize::{redact_secrets, sanitize_message};

/// Context key under which the redacted raw failure text is kept.
pub const RAW_ERROR_FIELD: &str = "raw_error";

/// Context key for the HTTP status of an HTTP failure.
pub const HTTP_STATUS_FIELD: &str = "http_status";

const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "resource exhausted",
    "resource_exhausted",
];

/// HTTP 429 mentioned as a standalone status token, not inside ids or counts.
static STATUS_429: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w.])429(?:$|[^\w.])").expect("valid regex"));

const TIMEOUT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "time out",
    "deadline",
    "took too long",
    "etimedout",
];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "econnrefused",
    "econnreset",
    "enotfound",
    "fetch failed",
    "unreachable",
    "dns",
    "socket",
    "offline",
    "broken pipe",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "invalid",
    "validation",
    "required",
    "must be",
    "must not",
    "malformed",
    "too long",
    "too short",
    "empty",
    "exceeds maximum",
    "not allowed",
];

/// A raw failure handed to the classifier.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Failure {
    /// Upstream error that already knows its kind.
    #[error("{message}")]
    Typed { kind: ErrorKind, message: String },

    /// HTTP error response from the AI service.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Input rejected before or by the AI service.
    #[error("{0}")]
    Validation(String),

    /// Anything else: a caught error or bare message.
    #[error("{0}")]
    Opaque(String),
}

impl Failure {
    pub fn typed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure::Typed {
            kind,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Failure::Http {
            status,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Failure::Validation(message.into())
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        Failure::Opaque(message.into())
    }

    /// The unprocessed message text. Diagnostic only; may contain secrets.
    pub fn raw_message(&self) -> &str {
        match self {
            Failure::Typed { message, .. }
            | Failure::Http { message, .. }
            | Failure::Validation(message)
            | Failure::Opaque(message) => message,
        }
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Failure::Opaque(message.to_string())
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Failure::Opaque(message)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        // Alternate formatting includes the whole cause chain.
        Failure::Opaque(format!("{e:#}"))
    }
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match e.kind() {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => ErrorKind::TransientNetwork,
            Io::InvalidInput | Io::InvalidData => ErrorKind::Validation,
            _ => return Failure::Opaque(e.to_string()),
        };
        Failure::typed(kind, e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Failure {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Failure::typed(ErrorKind::Timeout, e.to_string())
    }
}

impl From<quill_core::Error> for Failure {
    fn from(e: quill_core::Error) -> Self {
        use quill_core::Error;

        let kind = match &e {
            Error::Request(_) => ErrorKind::TransientNetwork,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RateLimited(_) => ErrorKind::QuotaExceeded,
            Error::Upstream(_) => ErrorKind::UpstreamFault,
            Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => return Failure::Opaque(e.to_string()),
        };
        Failure::typed(kind, e.to_string())
    }
}

impl From<ClassifiedError> for Failure {
    fn from(e: ClassifiedError) -> Self {
        Failure::typed(e.kind, e.message)
    }
}

/// Fixed severity per error kind.
///
/// Chosen once when a [`Classifier`] is constructed; never inferred per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityTable {
    pub transient_network: Severity,
    pub timeout: Severity,
    pub quota_exceeded: Severity,
    pub validation: Severity,
    pub upstream_fault: Severity,
    pub unknown: Severity,
}

impl Default for SeverityTable {
    fn default() -> Self {
        Self {
            transient_network: Severity::Medium,
            timeout: Severity::Medium,
            quota_exceeded: Severity::High,
            validation: Severity::Low,
            upstream_fault: Severity::Critical,
            unknown: Severity::Medium,
        }
    }
}

impl SeverityTable {
    /// Look up the severity for a kind.
    pub fn severity(&self, kind: ErrorKind) -> Severity {
        match kind {
            ErrorKind::TransientNetwork => self.transient_network,
            ErrorKind::Timeout => self.timeout,
            ErrorKind::QuotaExceeded => self.quota_exceeded,
            ErrorKind::Validation => self.validation,
            ErrorKind::UpstreamFault => self.upstream_fault,
            ErrorKind::Unknown => self.unknown,
        }
    }

    /// Override the severity of one kind.
    pub fn with(mut self, kind: ErrorKind, severity: Severity) -> Self {
        let slot = match kind {
            ErrorKind::TransientNetwork => &mut self.transient_network,
            ErrorKind::Timeout => &mut self.timeout,
            ErrorKind::QuotaExceeded => &mut self.quota_exceeded,
            ErrorKind::Validation => &mut self.validation,
            ErrorKind::UpstreamFault => &mut self.upstream_fault,
            ErrorKind::Unknown => &mut self.unknown,
        };
        *slot = severity;
        self
    }
}

/// Maps raw failures to [`ClassifiedError`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    table: SeverityTable,
}

impl Classifier {
    /// Create a classifier with a custom severity table.
    pub fn new(table: SeverityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &SeverityTable {
        &self.table
    }

    /// Determine the kind of a failure without building the full error.
    pub fn kind_of(&self, failure: &Failure) -> ErrorKind {
        match failure {
            Failure::Typed { kind, .. } => *kind,
            Failure::Validation(_) => ErrorKind::Validation,
            Failure::Http { status, message } => {
                kind_from_status(*status).unwrap_or_else(|| match classify_message(message) {
                    ErrorKind::Unknown if *status >= 500 => ErrorKind::UpstreamFault,
                    kind => kind,
                })
            }
            Failure::Opaque(message) => classify_message(message),
        }
    }

    /// Classify a failure. Never fails.
    pub fn classify(&self, failure: &Failure, context: ErrorContext) -> ClassifiedError {
        let kind = self.kind_of(failure);
        let severity = self.table.severity(kind);
        let raw = failure.raw_message();

        let mut context = context.with_field(RAW_ERROR_FIELD, redact_secrets(raw));
        if let Failure::Http { status, .. } = failure {
            context = context.with_field(HTTP_STATUS_FIELD, status.to_string());
        }

        ClassifiedError {
            kind,
            severity,
            retryable: ClassifiedError::is_retryable(kind, severity),
            message: user_message(kind, raw),
            context,
        }
    }
}

/// Classify with the default severity table.
pub fn classify(failure: &Failure, context: ErrorContext) -> ClassifiedError {
    Classifier::default().classify(failure, context)
}

/// Pattern-match a free-text message, honoring kind precedence.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(QUOTA_PATTERNS) || STATUS_429.is_match(&lower) {
        ErrorKind::QuotaExceeded
    } else if matches(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches(NETWORK_PATTERNS) {
        ErrorKind::TransientNetwork
    } else if matches(VALIDATION_PATTERNS) {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

fn kind_from_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::QuotaExceeded),
        408 | 504 => Some(ErrorKind::Timeout),
        502 | 503 => Some(ErrorKind::TransientNetwork),
        400 | 413 | 422 => Some(ErrorKind::Validation),
        500..=599 => Some(ErrorKind::UpstreamFault),
        _ => None,
    }
}

fn user_message(kind: ErrorKind, raw: &str) -> String {
    match kind {
        ErrorKind::TransientNetwork => {
            "Could not reach the AI service. Check your connection and try again.".to_string()
        }
        ErrorKind::Timeout => {
            "The AI service took too long to respond. Try again in a moment.".to_string()
        }
        ErrorKind::QuotaExceeded => {
            "The AI service is rate limited right now. Please wait a minute before trying again."
                .to_string()
        }
        ErrorKind::Validation => {
            let detail = sanitize_message(raw);
            if detail.is_empty() {
                "The request was rejected as invalid. Adjust the note and try again.".to_string()
            } else {
                format!("The request was rejected: {detail}. Adjust the note and try again.")
            }
        }
        ErrorKind::UpstreamFault => {
            "The AI service failed while processing this request.".to_string()
        }
        ErrorKind::Unknown => "Something went wrong while generating AI content.".to_string(),
    }
}
