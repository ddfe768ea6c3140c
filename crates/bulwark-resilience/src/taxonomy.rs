//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Classified error records, diagnostic context and friendly messages."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use bulwark_common::{ErrorCategory, Severity};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};
use uuid::Uuid;

/// Stable error codes produced by the classifier and the engine itself.
pub mod codes {
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const AUTHENTICATION_REQUIRED: &str = "AUTHENTICATION_REQUIRED";
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CLIENT_ERROR: &str = "CLIENT_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const EXTERNAL_SERVICE_ERROR: &str = "EXTERNAL_SERVICE_ERROR";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const SECURITY_VIOLATION: &str = "SECURITY_VIOLATION";
}

/// Well-known context keys understood by the engine.
pub mod keys {
    /// Resource key identifying the circuit breaker guarding the dependency.
    pub const RESOURCE: &str = "resource";
    pub const OPERATION: &str = "operation";
    pub const ATTEMPT: &str = "attempt";
    pub const HTTP_STATUS: &str = "http_status";
    pub const IO_KIND: &str = "io_kind";
    pub const RULE: &str = "rule";
}

/// Friendly, caller-safe message for an error code.
pub fn friendly_message(code: &str) -> &'static str {
    match code {
        codes::CIRCUIT_OPEN | codes::SERVICE_UNAVAILABLE => {
            "This service is temporarily unavailable. Please try again shortly."
        }
        codes::TIMEOUT => "The request took too long to complete. Please try again.",
        codes::VALIDATION_ERROR | codes::INVALID_PAYLOAD => {
            "Some of the information provided is invalid. Please review it and try again."
        }
        codes::AUTHENTICATION_REQUIRED => "Please sign in to continue.",
        codes::ACCESS_DENIED => "You do not have permission to perform this action.",
        codes::NOT_FOUND => "The requested item could not be found.",
        codes::CONFLICT => "This item was changed by someone else. Please refresh and retry.",
        codes::RATE_LIMITED => "Too many requests. Please slow down and try again.",
        codes::NETWORK_ERROR | codes::EXTERNAL_SERVICE_ERROR => {
            "A partner service could not be reached. Please try again later."
        }
        codes::DATABASE_ERROR => "We could not save or load your data. Please try again later.",
        codes::SECURITY_VIOLATION => "The request was blocked for security reasons.",
        _ => "Something went wrong on our side. Please try again later.",
    }
}

/// Ordered key/value diagnostics attached to a classified error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorContext(IndexMap<String, Value>);

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Attach the resource key used for circuit breaker routing.
    pub fn with_resource(self, resource: impl Into<String>) -> Self {
        self.with(keys::RESOURCE, resource.into())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn resource(&self) -> Option<&str> {
        self.get_str(keys::RESOURCE)
    }

    /// Copy entries from `other` whose keys are not present yet.
    pub fn merge_missing(&mut self, other: &ErrorContext) {
        for (key, value) in &other.0 {
            if !self.0.contains_key(key) {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ErrorContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Immutable record describing one classified failure.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ClassifiedError {
    code: String,
    category: ErrorCategory,
    severity: Severity,
    message: String,
    context: ErrorContext,
    correlation_id: Uuid,
    timestamp: DateTime<Utc>,
    #[serde(rename = "retry_after_ms", default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    retry_after: Option<Duration>,
}

impl ClassifiedError {
    /// Assemble a record with a fresh correlation id. Severity defaults from the category.
    pub fn new(
        code: impl Into<String>,
        category: ErrorCategory,
        severity: Option<Severity>,
        message: impl Into<String>,
        context: ErrorContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.into(),
            category,
            severity: severity.unwrap_or_else(|| category.default_severity()),
            message: message.into(),
            context,
            correlation_id: Uuid::new_v4(),
            timestamp,
            retry_after: None,
        }
    }

    /// Copy of the record carrying a retry hint for the caller.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Copy of the record with extra context entries that do not overwrite existing keys.
    pub fn with_context_defaults(mut self, extra: &ErrorContext) -> Self {
        self.context.merge_missing(extra);
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn resource(&self) -> Option<&str> {
        self.context.resource()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == codes::CIRCUIT_OPEN
    }

    /// View that is safe to hand to an external caller: no internal message or context.
    pub fn public_view(&self) -> PublicError {
        PublicError {
            code: self.code.clone(),
            message: friendly_message(&self.code).to_owned(),
            correlation_id: self.correlation_id,
            retry_after_ms: self
                .retry_after
                .map(bulwark_common::time::duration_to_millis),
        }
    }
}

/// Caller-facing error body keyed by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicError {
    pub code: String,
    pub message: String,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ref {})", self.message, self.correlation_id)
    }
}
