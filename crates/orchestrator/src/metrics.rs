//! Aggregated error metrics
//!
//! One [`ErrorMetrics`] is shared by every task of an orchestrator. All
//! counters sit behind a single mutex; updates are a handful of map
//! increments, so contention stays low even with many tenants.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::classifier::ClassifiedError;

/// Counters for a single tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCounters {
    /// Calls that succeeded
    pub successes: u64,
    /// Failed attempts
    pub errors: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Times a breaker opened
    pub circuit_trips: u64,
    /// Calls refused by an open breaker
    pub circuit_rejections: u64,
    /// Calls moved to dead letters
    pub dead_letters: u64,
    /// Calls cancelled or timed out
    pub cancellations: u64,
    /// Operations that panicked
    pub panics: u64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMetricsSnapshot {
    /// Classified failed attempts
    pub total_errors: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Retries scheduled
    pub total_retries: u64,
    /// Times a breaker opened
    pub circuit_trips: u64,
    /// Calls refused by an open breaker
    pub circuit_rejections: u64,
    /// Calls moved to dead letters
    pub dead_letters: u64,
    /// Calls cancelled or timed out
    pub cancellations: u64,
    /// Operations that panicked
    pub panics: u64,
    /// Failed attempts per classifier label
    pub by_error_type: BTreeMap<String, u64>,
    /// Failed attempts per category
    pub by_category: BTreeMap<String, u64>,
    /// Failed attempts per severity
    pub by_severity: BTreeMap<String, u64>,
    /// Per-tenant counters
    pub by_tenant: BTreeMap<String, TenantCounters>,
}

impl ErrorMetricsSnapshot {
    /// Counters for one tenant, zeroed if the tenant was never seen.
    pub fn tenant(&self, tenant: &str) -> TenantCounters {
        self.by_tenant.get(tenant).cloned().unwrap_or_default()
    }
}

/// Thread-safe error metrics tracker
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ErrorMetrics {
    inner: Arc<Mutex<ErrorMetricsSnapshot>>,
}

impl ErrorMetrics {
    /// Tracker with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ErrorMetricsSnapshot> {
        self.inner.lock()
    }

    /// Record one classified failed attempt.
    pub fn record_error(&self, tenant: &str, classified: &ClassifiedError) {
        let mut guard = self.lock();
        guard.total_errors += 1;
        *guard.by_error_type.entry(classified.error_type.clone()).or_default() += 1;
        *guard.by_category.entry(classified.category.to_string()).or_default() += 1;
        *guard.by_severity.entry(classified.severity.to_string()).or_default() += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().errors += 1;
    }

    /// Record a call that succeeded.
    pub fn record_success(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.total_successes += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().successes += 1;
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.total_retries += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().retries += 1;
    }

    /// Record a breaker opening.
    pub fn record_circuit_trip(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.circuit_trips += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().circuit_trips += 1;
    }

    /// Record a call refused at admission.
    pub fn record_circuit_rejection(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.circuit_rejections += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().circuit_rejections += 1;
    }

    /// Record a dead-lettered call.
    pub fn record_dead_letter(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.dead_letters += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().dead_letters += 1;
    }

    /// Record a cancelled call.
    pub fn record_cancellation(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.cancellations += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().cancellations += 1;
    }

    /// Record a panicking operation.
    pub fn record_panic(&self, tenant: &str) {
        let mut guard = self.lock();
        guard.panics += 1;
        guard.by_tenant.entry(tenant.to_string()).or_default().panics += 1;
    }

    /// Deep copy of the current counters.
    pub fn snapshot(&self) -> ErrorMetricsSnapshot {
        self.lock().clone()
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        *self.lock() = ErrorMetricsSnapshot::default();
    }
}
