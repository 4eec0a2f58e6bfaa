//! Concurrent per-tenant fan-out
//!
//! [`IsolationOrchestrator`] runs one operation for many tenants at once.
//! Every distinct tenant key gets its own tokio task, its own retry loop and
//! its own circuit breaker, so a tenant stuck in backoff or tripped open
//! never delays or fails another. The call returns after every task has
//! finished, with one result per tenant.
//!
//! ```no_run
//! use tenantry_orchestrator::{BoxedError, IsolationOrchestrator, TenantContext};
//!
//! # async fn example() -> Result<(), tenantry_orchestrator::OrchestratorError> {
//! let orchestrator = IsolationOrchestrator::builder().max_concurrency(8).build()?;
//! let results = orchestrator
//!     .run_for_tenants(["acme", "globex"], |ctx: TenantContext| async move {
//!         println!("syncing {}", ctx.tenant);
//!         Ok::<(), BoxedError>(())
//!     })
//!     .await;
//! assert!(results.all_succeeded());
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::classifier::{ErrorClassifier, PatternClassifier};
use crate::config::OrchestratorConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink, DeadLetterStats};
use crate::error::{OrchestratorError, TenantResult};
use crate::metrics::{ErrorMetrics, ErrorMetricsSnapshot};
use crate::operation::TenantOperation;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, RetryExecutor,
    RetryPolicies, RetryPolicy,
};
use crate::time::{Clock, SystemClock};

/// Optional bound on how many tenants run at once
///
/// Unbounded unless a limit is given.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    semaphore: Option<Arc<Semaphore>>,
}

impl AdmissionGate {
    /// Gate that never blocks.
    pub fn unbounded() -> Self {
        Self { semaphore: None }
    }

    /// Gate admitting at most `max_concurrency` tenants at a time.
    pub fn bounded(max_concurrency: usize) -> Result<Self, OrchestratorError> {
        if max_concurrency == 0 {
            return Err(OrchestratorError::config("max_concurrency must be greater than 0"));
        }
        Ok(Self { semaphore: Some(Arc::new(Semaphore::new(max_concurrency))) })
    }

    /// Wait for a slot. Unbounded gates return `None` immediately.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore.as_ref()?;
        Arc::clone(semaphore).acquire_owned().await.ok()
    }

    /// Free slots, or `None` when unbounded.
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// True when a limit is set.
    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }
}

/// Outcome of a fan-out, one entry per distinct tenant
#[derive(Debug, Default)]
pub struct TenantResults {
    results: HashMap<String, TenantResult>,
}

impl TenantResults {
    /// Result for one tenant.
    pub fn get(&self, tenant: &str) -> Option<&TenantResult> {
        self.results.get(tenant)
    }

    /// All results, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TenantResult)> {
        self.results.iter()
    }

    /// Tenants whose operation succeeded, sorted.
    pub fn succeeded(&self) -> Vec<&str> {
        let mut tenants: Vec<&str> =
            self.results.iter().filter(|(_, r)| r.is_ok()).map(|(t, _)| t.as_str()).collect();
        tenants.sort_unstable();
        tenants
    }

    /// Failed tenants with their errors, sorted by tenant.
    pub fn failed(&self) -> Vec<(&str, &OrchestratorError)> {
        let mut failures: Vec<(&str, &OrchestratorError)> = self
            .results
            .iter()
            .filter_map(|(t, r)| r.as_ref().err().map(|e| (t.as_str(), e)))
            .collect();
        failures.sort_unstable_by(|a, b| a.0.cmp(b.0));
        failures
    }

    /// True when no tenant failed. Vacuously true when empty.
    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    /// Number of tenants run.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True when no tenants were run.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Take the underlying map.
    pub fn into_inner(self) -> HashMap<String, TenantResult> {
        self.results
    }
}

/// Serializable view of everything the orchestrator has observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorReport {
    /// Report time, from the orchestrator clock
    pub generated_at: DateTime<Utc>,
    /// Counter snapshot
    pub metrics: ErrorMetricsSnapshot,
    /// Dead-letter totals
    pub dead_letter_stats: DeadLetterStats,
    /// Every dead-letter entry, oldest first
    pub dead_letters: Vec<DeadLetterEntry>,
    /// Breaker snapshots sorted by tenant
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
}

/// Runs an operation across tenants with per-tenant isolation
pub struct IsolationOrchestrator {
    executor: Arc<RetryExecutor>,
    gate: AdmissionGate,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IsolationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationOrchestrator")
            .field("executor", &self.executor)
            .field("gate", &self.gate)
            .field("timeout", &self.timeout)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl IsolationOrchestrator {
    /// Start configuring an orchestrator.
    pub fn builder() -> IsolationOrchestratorBuilder {
        IsolationOrchestratorBuilder::default()
    }

    /// Orchestrator with system clock, default classifier and fresh sinks,
    /// configured from `config`.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::builder().config(config).build()
    }

    /// Executor shared by every tenant task.
    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    /// Per-tenant breakers.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.executor.circuit_breakers()
    }

    /// Dead-letter sink.
    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        self.executor.dead_letters()
    }

    /// Metrics tracker.
    pub fn metrics(&self) -> &ErrorMetrics {
        self.executor.metrics()
    }

    /// Concurrency gate.
    pub fn admission_gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); every run observes it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel all in-flight and future runs on this orchestrator.
    pub fn shutdown(&self) {
        info!("Orchestrator shutdown requested");
        self.shutdown.cancel();
    }

    /// Run `operation` once per distinct tenant key and wait for all of them.
    ///
    /// Applies the configured timeout, if any.
    pub async fn run_for_tenants<I, S, O>(&self, tenants: I, operation: O) -> TenantResults
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        O: TenantOperation + 'static,
    {
        self.fan_out(dedupe(tenants), Arc::new(operation), self.timeout).await
    }

    /// Like [`run_for_tenants`](Self::run_for_tenants), but tenants still
    /// running after `timeout` are cancelled and report `Cancelled`.
    pub async fn run_for_tenants_with_timeout<I, S, O>(
        &self,
        tenants: I,
        operation: O,
        timeout: Duration,
    ) -> TenantResults
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        O: TenantOperation + 'static,
    {
        self.fan_out(dedupe(tenants), Arc::new(operation), Some(timeout)).await
    }

    #[instrument(skip_all, fields(tenants = tenants.len(), operation = %operation.name()))]
    async fn fan_out(
        &self,
        tenants: Vec<String>,
        operation: Arc<dyn TenantOperation>,
        timeout: Option<Duration>,
    ) -> TenantResults {
        let run_token = self.shutdown.child_token();
        let results: Arc<Mutex<HashMap<String, TenantResult>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(tenants.len())));

        info!(tenants = tenants.len(), "Starting tenant fan-out");

        let mut names = Vec::with_capacity(tenants.len());
        let mut handles = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let executor = Arc::clone(&self.executor);
            let gate = self.gate.clone();
            let operation = Arc::clone(&operation);
            let cancel = run_token.clone();
            let results = Arc::clone(&results);
            let key = tenant.clone();

            handles.push(tokio::spawn(async move {
                let outcome = run_tenant(&executor, &gate, &key, operation.as_ref(), &cancel).await;
                results.lock().insert(key, outcome);
            }));
            names.push(tenant);
        }

        let mut joined = pin!(join_all(handles));
        let joins = match timeout {
            Some(limit) => tokio::select! {
                joins = &mut joined => joins,
                () = tokio::time::sleep(limit) => {
                    warn!(timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX), "Fan-out timed out, cancelling remaining tenants");
                    run_token.cancel();
                    joined.await
                }
            },
            None => joined.await,
        };

        let mut results = std::mem::take(&mut *results.lock());
        for (tenant, join) in names.into_iter().zip(joins) {
            if let Err(join_error) = join {
                error!(tenant = %tenant, error = %join_error, "Tenant task failed to join");
                results.entry(tenant.clone()).or_insert_with(|| {
                    Err(OrchestratorError::TaskPanicked { tenant, message: join_error.to_string() })
                });
            }
        }

        let failed = results.values().filter(|r| r.is_err()).count();
        info!(total = results.len(), failed, "Tenant fan-out finished");
        TenantResults { results }
    }

    /// Snapshot of metrics, dead letters and breaker states.
    pub fn report(&self) -> OrchestratorReport {
        OrchestratorReport {
            generated_at: self.clock.utc_now(),
            metrics: self.metrics().snapshot(),
            dead_letter_stats: self.dead_letters().stats(),
            dead_letters: self.dead_letters().drain(),
            circuit_breakers: self.circuit_breakers().snapshots(),
        }
    }
}

impl Drop for IsolationOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_tenant(
    executor: &RetryExecutor,
    gate: &AdmissionGate,
    tenant: &str,
    operation: &dyn TenantOperation,
    cancel: &CancellationToken,
) -> TenantResult {
    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            executor.metrics().record_cancellation(tenant);
            return Err(OrchestratorError::Cancelled { tenant: tenant.to_string() });
        }
        permit = gate.acquire() => permit,
    };

    match AssertUnwindSafe(executor.execute_with_retry(tenant, operation, cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(tenant, message = %message, "Tenant operation panicked");
            executor.metrics().record_panic(tenant);
            if executor.circuit_breakers().record_failure(tenant) {
                executor.metrics().record_circuit_trip(tenant);
            }
            Err(OrchestratorError::TaskPanicked { tenant: tenant.to_string(), message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn dedupe<I, S>(tenants: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    tenants.into_iter().map(Into::into).filter(|t| seen.insert(t.clone())).collect()
}

/// Builder for [`IsolationOrchestrator`]
#[derive(Default)]
pub struct IsolationOrchestratorBuilder {
    policies: RetryPolicies,
    breaker_config: CircuitBreakerConfig,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    clock: Option<Arc<dyn Clock>>,
    dead_letters: Option<Arc<DeadLetterSink>>,
    metrics: Option<ErrorMetrics>,
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for IsolationOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationOrchestratorBuilder")
            .field("policies", &self.policies)
            .field("breaker_config", &self.breaker_config)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl IsolationOrchestratorBuilder {
    /// Take retry, breaker, concurrency and timeout settings from `config`.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.policies = config.retry_policies();
        self.breaker_config = config.circuit_breaker;
        self.max_concurrency = config.max_concurrency;
        self.timeout = config.timeout;
        self
    }

    /// Replace the default retry policy, keeping overrides.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        let overrides = self.policies.overrides().clone();
        self.policies = overrides
            .into_iter()
            .fold(RetryPolicies::new(policy), |p, (tenant, o)| p.with_override(tenant, o));
        self
    }

    /// Use `policy` for `tenant` instead of the default.
    #[must_use]
    pub fn tenant_override(mut self, tenant: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies = self.policies.with_override(tenant, policy);
        self
    }

    /// Replace the default policy and all overrides.
    #[must_use]
    pub fn retry_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Breaker thresholds for every tenant.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Use a custom classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Clock for breaker cooldowns and timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a dead-letter sink with other components.
    #[must_use]
    pub fn dead_letter_sink(mut self, sink: Arc<DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Share a metrics tracker with other components.
    #[must_use]
    pub fn metrics(mut self, metrics: ErrorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run at most `max_concurrency` tenants at once.
    #[must_use]
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Default wall-clock limit for `run_for_tenants`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate settings and assemble the orchestrator.
    pub fn build(self) -> Result<IsolationOrchestrator, OrchestratorError> {
        self.policies.validate()?;
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::config("timeout must be greater than 0"));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let breakers = CircuitBreakerRegistry::with_clock(self.breaker_config, Arc::clone(&clock))?;
        let gate = match self.max_concurrency {
            Some(limit) => AdmissionGate::bounded(limit)?,
            None => AdmissionGate::unbounded(),
        };

        let executor = RetryExecutor::new(
            Arc::new(self.policies),
            self.classifier.unwrap_or_else(|| Arc::new(PatternClassifier::new())),
            Arc::new(breakers),
            self.dead_letters.unwrap_or_default(),
            self.metrics.unwrap_or_default(),
            Arc::clone(&clock),
        );

        Ok(IsolationOrchestrator {
            executor: Arc::new(executor),
            gate,
            timeout: self.timeout,
            shutdown: CancellationToken::new(),
            clock,
        })
    }
}
