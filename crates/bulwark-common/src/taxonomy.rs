//! ---
//! bw_section: "01-core-functionality"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Shared primitives and utilities for the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::Level;

/// Failure category assigned to every classified error.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    Network,
    Database,
    ExternalDependency,
    BusinessLogic,
    System,
    Security,
    Performance,
}

impl ErrorCategory {
    /// Severity applied when a classification rule does not override it.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCategory::Security => Severity::Critical,
            ErrorCategory::Network
            | ErrorCategory::Database
            | ErrorCategory::ExternalDependency
            | ErrorCategory::System => Severity::Error,
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::BusinessLogic
            | ErrorCategory::Performance => Severity::Warning,
        }
    }
}

/// Severity assigned to every classified error.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl Severity {
    /// Tracing level used when the severity is written to the log sink.
    pub fn level(&self) -> Level {
        match self {
            Severity::Critical | Severity::Error => Level::ERROR,
            Severity::Warning => Level::WARN,
            Severity::Info => Level::INFO,
            Severity::Debug => Level::DEBUG,
        }
    }
}
