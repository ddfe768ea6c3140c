//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Maps raw failures onto the error taxonomy through an ordered rule table."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::io;
use std::time::Duration;

use bulwark_common::{system_clock, ErrorCategory, Severity, SharedClock};

use crate::taxonomy::{codes, keys, ClassifiedError, ErrorContext};

/// Failure shapes that callers can raise to steer classification explicitly.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// A dependency answered with an HTTP-like status code.
    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },
    /// The caller already knows the code and category.
    #[error("{message}")]
    Tagged {
        code: String,
        category: ErrorCategory,
        severity: Option<Severity>,
        message: String,
    },
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl Failure {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Failure::Status {
            status,
            message: message.into(),
        }
    }

    pub fn tagged(
        code: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Failure::Tagged {
            code: code.into(),
            category,
            severity: None,
            message: message.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Failure::Timeout { elapsed }
    }
}

/// Facts extracted from a failure chain that the rules match against.
#[derive(Debug, Default)]
struct FailureShape {
    status: Option<u16>,
    io_kind: Option<io::ErrorKind>,
    timed_out: bool,
    connect_failed: bool,
    payload_invalid: bool,
    text: String,
}

impl FailureShape {
    fn inspect(failure: &anyhow::Error) -> Self {
        let mut shape = FailureShape::default();
        for cause in failure.chain() {
            if let Some(known) = cause.downcast_ref::<Failure>() {
                match known {
                    Failure::Status { status, .. } => {
                        shape.status.get_or_insert(*status);
                    }
                    Failure::Timeout { .. } => shape.timed_out = true,
                    Failure::Tagged { .. } => {}
                }
            } else if let Some(err) = cause.downcast_ref::<io::Error>() {
                shape.io_kind.get_or_insert(err.kind());
            } else if cause.is::<tokio::time::error::Elapsed>() {
                shape.timed_out = true;
            } else if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
                if let Some(status) = err.status() {
                    shape.status.get_or_insert(status.as_u16());
                }
                shape.timed_out |= err.is_timeout();
                shape.connect_failed |= err.is_connect();
                shape.payload_invalid |= err.is_decode();
            } else if cause.is::<serde_json::Error>() {
                shape.payload_invalid = true;
            }
        }
        shape.text = format!("{failure:#}").to_ascii_lowercase();
        shape
    }

    fn status_in(&self, range: std::ops::RangeInclusive<u16>) -> bool {
        self.status.is_some_and(|status| range.contains(&status))
    }

    fn mentions(&self, markers: &[&str]) -> bool {
        markers.iter().any(|marker| self.text.contains(marker))
    }
}

fn is_connection_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe
    )
}

struct Rule {
    name: &'static str,
    code: &'static str,
    category: ErrorCategory,
    severity: Option<Severity>,
    matches: fn(&FailureShape) -> bool,
}

const SECURITY_MARKERS: &[&str] = &[
    "csrf",
    "sql injection",
    "signature mismatch",
    "tampered",
    "replay detected",
];
const DATABASE_MARKERS: &[&str] = &[
    "database",
    "deadlock",
    "sqlstate",
    "constraint violation",
    "connection pool",
];
const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "connection reset",
    "econnreset",
    "host unreachable",
    "enotfound",
    "dns",
];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];

// First match wins.
static RULES: &[Rule] = &[
    Rule {
        name: "timeout",
        code: codes::TIMEOUT,
        category: ErrorCategory::Performance,
        severity: Some(Severity::Error),
        matches: |s| s.timed_out || s.io_kind == Some(io::ErrorKind::TimedOut),
    },
    Rule {
        name: "status-validation",
        code: codes::VALIDATION_ERROR,
        category: ErrorCategory::Validation,
        severity: None,
        matches: |s| matches!(s.status, Some(400 | 422)),
    },
    Rule {
        name: "status-unauthenticated",
        code: codes::AUTHENTICATION_REQUIRED,
        category: ErrorCategory::Authentication,
        severity: None,
        matches: |s| s.status == Some(401),
    },
    Rule {
        name: "status-forbidden",
        code: codes::ACCESS_DENIED,
        category: ErrorCategory::Authorization,
        severity: None,
        matches: |s| s.status == Some(403),
    },
    Rule {
        name: "status-not-found",
        code: codes::NOT_FOUND,
        category: ErrorCategory::BusinessLogic,
        severity: None,
        matches: |s| s.status == Some(404),
    },
    Rule {
        name: "status-conflict",
        code: codes::CONFLICT,
        category: ErrorCategory::BusinessLogic,
        severity: None,
        matches: |s| s.status == Some(409),
    },
    Rule {
        name: "status-rate-limited",
        code: codes::RATE_LIMITED,
        category: ErrorCategory::Performance,
        severity: None,
        matches: |s| s.status == Some(429),
    },
    Rule {
        name: "status-client",
        code: codes::CLIENT_ERROR,
        category: ErrorCategory::BusinessLogic,
        severity: Some(Severity::Warning),
        matches: |s| s.status_in(400..=499),
    },
    Rule {
        name: "status-unavailable",
        code: codes::SERVICE_UNAVAILABLE,
        category: ErrorCategory::ExternalDependency,
        severity: None,
        matches: |s| s.status == Some(503),
    },
    Rule {
        name: "status-gateway-timeout",
        code: codes::TIMEOUT,
        category: ErrorCategory::ExternalDependency,
        severity: None,
        matches: |s| s.status == Some(504),
    },
    Rule {
        name: "status-server",
        code: codes::EXTERNAL_SERVICE_ERROR,
        category: ErrorCategory::ExternalDependency,
        severity: None,
        matches: |s| s.status_in(500..=599),
    },
    Rule {
        name: "connection",
        code: codes::NETWORK_ERROR,
        category: ErrorCategory::Network,
        severity: None,
        matches: |s| s.connect_failed || s.io_kind.is_some_and(is_connection_kind),
    },
    Rule {
        name: "payload",
        code: codes::INVALID_PAYLOAD,
        category: ErrorCategory::Validation,
        severity: None,
        matches: |s| s.payload_invalid,
    },
    Rule {
        name: "security-markers",
        code: codes::SECURITY_VIOLATION,
        category: ErrorCategory::Security,
        severity: None,
        matches: |s| s.mentions(SECURITY_MARKERS),
    },
    Rule {
        name: "database-markers",
        code: codes::DATABASE_ERROR,
        category: ErrorCategory::Database,
        severity: None,
        matches: |s| s.mentions(DATABASE_MARKERS),
    },
    Rule {
        name: "network-markers",
        code: codes::NETWORK_ERROR,
        category: ErrorCategory::Network,
        severity: None,
        matches: |s| s.mentions(NETWORK_MARKERS),
    },
    Rule {
        name: "timeout-markers",
        code: codes::TIMEOUT,
        category: ErrorCategory::Performance,
        severity: Some(Severity::Error),
        matches: |s| s.mentions(TIMEOUT_MARKERS),
    },
    Rule {
        name: "auth-markers",
        code: codes::AUTHENTICATION_REQUIRED,
        category: ErrorCategory::Authentication,
        severity: None,
        matches: |s| s.mentions(&["unauthorized", "invalid token", "token expired"]),
    },
    Rule {
        name: "permission-markers",
        code: codes::ACCESS_DENIED,
        category: ErrorCategory::Authorization,
        severity: None,
        matches: |s| s.mentions(&["forbidden", "permission denied"]),
    },
    Rule {
        name: "validation-markers",
        code: codes::VALIDATION_ERROR,
        category: ErrorCategory::Validation,
        severity: None,
        matches: |s| s.mentions(&["validation failed", "invalid input", "required field"]),
    },
];

/// Pure mapping from raw failures to [`ClassifiedError`] records.
#[derive(Debug, Clone)]
pub struct Classifier {
    clock: SharedClock,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl Classifier {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Classify a failure. Never fails: unmatched failures become `UNKNOWN_ERROR`.
    ///
    /// Caller context is merged in without overwriting keys the classifier derived.
    pub fn classify(&self, failure: &anyhow::Error, context: ErrorContext) -> ClassifiedError {
        if let Some(existing) = failure
            .chain()
            .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
        {
            return existing.clone().with_context_defaults(&context);
        }

        let message = failure.to_string();
        let mut derived = ErrorContext::new();

        if let Some(Failure::Tagged {
            code,
            category,
            severity,
            ..
        }) = failure.chain().find_map(|cause| match cause.downcast_ref::<Failure>() {
            Some(tagged @ Failure::Tagged { .. }) => Some(tagged),
            _ => None,
        }) {
            derived.insert(keys::RULE, "tagged");
            derived.merge_missing(&context);
            return ClassifiedError::new(
                code.clone(),
                *category,
                *severity,
                message,
                derived,
                self.clock.wall(),
            );
        }

        let shape = FailureShape::inspect(failure);
        if let Some(status) = shape.status {
            derived.insert(keys::HTTP_STATUS, status);
        }
        if let Some(kind) = shape.io_kind {
            derived.insert(keys::IO_KIND, format!("{kind:?}"));
        }

        let (code, category, severity) = match RULES.iter().find(|rule| (rule.matches)(&shape)) {
            Some(rule) => {
                derived.insert(keys::RULE, rule.name);
                (rule.code, rule.category, rule.severity)
            }
            None => (codes::UNKNOWN_ERROR, ErrorCategory::System, None),
        };
        derived.merge_missing(&context);
        ClassifiedError::new(code, category, severity, message, derived, self.clock.wall())
    }

    /// Classify a synthetic engine rejection that was never raised by a dependency.
    pub(crate) fn build(
        &self,
        code: &str,
        category: ErrorCategory,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> ClassifiedError {
        ClassifiedError::new(code, category, None, message, context, self.clock.wall())
    }
}
