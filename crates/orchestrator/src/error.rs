//! Error types for the orchestrator
//!
//! Every terminal outcome of a tenant's operation maps onto one
//! [`OrchestratorError`] variant. The variants render distinct text so a
//! caller reading only the message can still tell a circuit rejection from a
//! direct failure from an exhausted retry budget.
//!
//! | Outcome | Variant | Dead-lettered |
//! |---------|---------|---------------|
//! | Admission refused by the tenant's breaker | `CircuitOpen` | no |
//! | Failure classified as non-retryable | `NonRetryable` | no |
//! | Retry budget exhausted | `Exhausted` | yes |
//! | Cancellation or parent timeout | `Cancelled` | no |
//! | Operation panicked | `TaskPanicked` | no |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error returned by tenant operations.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for a single tenant's run.
pub type TenantResult = Result<(), OrchestratorError>;

/// Errors surfaced to callers of the orchestrator
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// The tenant's circuit breaker refused admission; the operation never ran.
    #[error("circuit open for tenant '{tenant}': call rejected before execution")]
    CircuitOpen {
        /// Rejected tenant
        tenant: String,
    },

    /// The operation failed with an error that must not be retried.
    #[error("non-retryable {category} error for tenant '{tenant}' ({error_type}): {message}")]
    NonRetryable {
        /// Failing tenant
        tenant: String,
        /// Classifier label, e.g. `authorization_error`
        error_type: String,
        /// Classifier category
        category: ErrorCategory,
        /// Classifier severity
        severity: ErrorSeverity,
        /// Original error text
        message: String,
    },

    /// Every permitted retry failed.
    #[error("exhausted after {retries} retries for tenant '{tenant}': {last_error}")]
    Exhausted {
        /// Failing tenant
        tenant: String,
        /// Retries made after the first attempt
        retries: u32,
        /// Text of the final attempt's error
        last_error: String,
    },

    /// The run was cancelled or hit the parent timeout.
    #[error("operation cancelled for tenant '{tenant}'")]
    Cancelled {
        /// Cancelled tenant
        tenant: String,
    },

    /// The operation panicked; the panic was contained to this tenant.
    #[error("task for tenant '{tenant}' panicked: {message}")]
    TaskPanicked {
        /// Tenant whose task panicked
        tenant: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// Invalid orchestrator configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong
        message: String,
    },
}

impl OrchestratorError {
    /// Build a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Tenant the error belongs to, if any.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { tenant }
            | Self::NonRetryable { tenant, .. }
            | Self::Exhausted { tenant, .. }
            | Self::Cancelled { tenant }
            | Self::TaskPanicked { tenant, .. } => Some(tenant),
            Self::Config { .. } => None,
        }
    }

    /// Whether a later run for the same tenant could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Exhausted { .. } | Self::Cancelled { .. })
    }

    /// Severity used for logging and reports.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NonRetryable { severity, .. } => *severity,
            Self::Exhausted { .. } | Self::TaskPanicked { .. } => ErrorSeverity::High,
            Self::CircuitOpen { .. } | Self::Config { .. } => ErrorSeverity::Medium,
            Self::Cancelled { .. } => ErrorSeverity::Low,
        }
    }

    /// Stable label suitable for metrics keys and log fields.
    pub fn error_label(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NonRetryable { .. } => "non_retryable",
            Self::Exhausted { .. } => "exhausted",
            Self::Cancelled { .. } => "cancelled",
            Self::TaskPanicked { .. } => "task_panicked",
            Self::Config { .. } => "config",
        }
    }
}

/// Error severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected noise such as cancellation
    Low,
    /// Worth a look if it persists
    Medium,
    /// Needs attention
    High,
    /// Needs attention now
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Failure taxonomy produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Authentication or authorization; never retried
    Security,
    /// Network, timeout, DNS
    Infrastructure,
    /// Rate limiting, throttling, quota
    Capacity,
    /// Internal server errors, service unavailable
    Service,
    /// Validation or malformed input; never retried
    Data,
    /// Nothing in the pattern table matched; never retried
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Capacity => write!(f, "capacity"),
            Self::Service => write!(f, "service"),
            Self::Data => write!(f, "data"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
