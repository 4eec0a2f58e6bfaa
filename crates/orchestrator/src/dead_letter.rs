//! Dead-letter sink for operations that exhausted their retry budget
//!
//! Only exhaustion produces an entry. Circuit rejections never reached the
//! operation and non-retryable failures would fail identically on replay, so
//! neither is captured here.
//!
//! Entries live in memory for the lifetime of the sink. `expires_at` is
//! recorded for consumers but nothing evicts on it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::classifier::ClassifiedError;
use crate::error::ErrorSeverity;

/// Replay priority of a dead-letter entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Replay first
    Critical = 0,
    /// From high-severity failures
    High = 1,
    /// From medium-severity failures
    Normal = 2,
    /// Replay last
    Low = 3,
}

impl From<ErrorSeverity> for Priority {
    fn from(severity: ErrorSeverity) -> Self {
        match severity {
            ErrorSeverity::Critical => Priority::Critical,
            ErrorSeverity::High => Priority::High,
            ErrorSeverity::Medium => Priority::Normal,
            ErrorSeverity::Low => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "Critical"),
            Priority::High => write!(f, "High"),
            Priority::Normal => write!(f, "Normal"),
            Priority::Low => write!(f, "Low"),
        }
    }
}

/// One failed attempt, as kept in an entry's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Zero-based attempt index
    pub attempt: u32,
    /// Rendered error text
    pub message: String,
    /// Classifier verdict for this attempt
    #[serde(flatten)]
    pub classification: ClassifiedError,
    /// When the attempt failed
    pub occurred_at: DateTime<Utc>,
}

/// Captured record of an operation that could not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Random v4 identifier
    pub id: Uuid,
    /// Tenant the operation ran for
    pub tenant: String,
    /// Operation name
    pub operation: String,
    /// Opaque operation payload for replay
    pub payload: serde_json::Value,
    /// Every failed attempt, oldest first
    pub error_history: Vec<ErrorRecord>,
    /// First failed attempt
    pub first_failed_at: DateTime<Utc>,
    /// Final failed attempt
    pub last_failed_at: DateTime<Utc>,
    /// Retries performed before giving up
    pub attempts_made: u32,
    /// Retries the policy allowed
    pub max_attempts: u32,
    /// Free-form labels; `final_error_type` and `category` are always set
    pub metadata: HashMap<String, String>,
    /// Replay priority, from the final error severity
    pub priority: Priority,
    /// Informational; nothing evicts expired entries
    pub expires_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// Build an entry from an attempt history.
    ///
    /// Priority follows the severity of the final error. `now` is used for
    /// the failure timestamps only when the history is empty.
    pub fn new(
        tenant: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
        error_history: Vec<ErrorRecord>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let first_failed_at = error_history.first().map_or(now, |r| r.occurred_at);
        let last_failed_at = error_history.last().map_or(now, |r| r.occurred_at);
        let priority = error_history
            .last()
            .map_or(Priority::Normal, |r| Priority::from(r.classification.severity));

        let mut metadata = HashMap::new();
        if let Some(last) = error_history.last() {
            metadata.insert("final_error_type".to_string(), last.classification.error_type.clone());
            metadata.insert("category".to_string(), last.classification.category.to_string());
        }

        Self {
            id: Uuid::new_v4(),
            tenant: tenant.into(),
            operation: operation.into(),
            payload,
            error_history,
            first_failed_at,
            last_failed_at,
            attempts_made: max_attempts,
            max_attempts,
            metadata,
            priority,
            expires_at: None,
        }
    }

    /// Add a metadata label.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set `expires_at`.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Classification of the final failed attempt.
    pub fn final_error(&self) -> Option<&ClassifiedError> {
        self.error_history.last().map(|r| &r.classification)
    }
}

/// Aggregate view over the sink's contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Entries in the sink
    pub total: usize,
    /// Earliest `first_failed_at` across entries
    pub oldest_failure: Option<DateTime<Utc>>,
    /// Latest `first_failed_at` across entries
    pub newest_failure: Option<DateTime<Utc>>,
    /// Entry count per tenant
    pub by_tenant: BTreeMap<String, usize>,
    /// Keyed by the final error type of each entry
    pub by_error_type: BTreeMap<String, usize>,
}

/// In-memory, thread-safe dead-letter store
#[derive(Debug, Default)]
pub struct DeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry.
    pub fn put(&self, entry: DeadLetterEntry) {
        warn!(
            tenant = %entry.tenant,
            operation = %entry.operation,
            id = %entry.id,
            attempts = entry.attempts_made,
            priority = %entry.priority,
            "Operation moved to dead letters"
        );
        self.entries.lock().push(entry);
    }

    /// Copy of every stored entry in insertion order. Nothing is removed.
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    /// Remove and return every stored entry.
    pub fn take_all(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Totals and breakdowns over the current entries.
    pub fn stats(&self) -> DeadLetterStats {
        let entries = self.entries.lock();
        let mut stats = DeadLetterStats { total: entries.len(), ..DeadLetterStats::default() };

        for entry in entries.iter() {
            *stats.by_tenant.entry(entry.tenant.clone()).or_default() += 1;
            if let Some(final_error) = entry.final_error() {
                *stats.by_error_type.entry(final_error.error_type.clone()).or_default() += 1;
            }
            stats.oldest_failure = Some(
                stats.oldest_failure.map_or(entry.first_failed_at, |t| t.min(entry.first_failed_at)),
            );
            stats.newest_failure = Some(
                stats.newest_failure.map_or(entry.first_failed_at, |t| t.max(entry.first_failed_at)),
            );
        }
        stats
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
