//! Retry policies and the per-tenant retry executor
//!
//! [`RetryExecutor::execute_with_retry`] drives one tenant's call from
//! admission to outcome:
//!
//! 1. Ask the tenant's circuit breaker for admission. A rejected call never
//!    reaches the operation.
//! 2. Resolve the tenant's [`RetryPolicy`] (override, else default).
//! 3. Run attempts `0..=max_attempts`. Each failure is classified; the policy
//!    lists and the classifier decide whether another attempt is worth it.
//! 4. Report the single call outcome to the breaker, and dead-letter the call
//!    if it ran out of retries.
//!
//! Both the operation and the backoff sleep race the cancellation token, so
//! a cancelled run stops at the next suspension point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{ClassifiedError, ErrorClassifier};
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink, ErrorRecord};
use crate::error::{OrchestratorError, TenantResult};
use crate::metrics::ErrorMetrics;
use crate::operation::{TenantContext, TenantOperation};
use crate::time::Clock;
use crate::utils::serde::duration_millis;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Jitter spread as a fraction of the computed delay (±10%).
pub const JITTER_FACTOR: f64 = 0.1;

/// Retry behaviour for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total tries is `max_attempts + 1`
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Backoff ceiling
    #[serde(with = "duration_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Growth factor per retry; must exceed 1.0
    pub multiplier: f64,
    /// Spread each delay by up to ±10%
    pub jitter: bool,
    /// Case-insensitive substrings that force a retry
    pub retryable_errors: Vec<String>,
    /// Case-insensitive substrings that stop retrying; checked first
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
            retryable_errors: vec![
                "ThrottlingException".to_string(),
                "RequestLimitExceeded".to_string(),
                "ServiceUnavailable".to_string(),
                "InternalError".to_string(),
            ],
            non_retryable_errors: vec![
                "AccessDenied".to_string(),
                "InvalidParameter".to_string(),
                "ValidationException".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(OrchestratorError::config(format!(
                "multiplier must be greater than 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(OrchestratorError::config(format!(
                "initial_delay ({:?}) must not exceed max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Backoff before retrying after `attempt` failed, without jitter:
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with ±10% jitter when
    /// enabled. Never negative.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        let secs = (base.as_secs_f64() * (1.0 + factor)).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(base)
    }

    /// Whether a failed attempt should be retried.
    ///
    /// Non-retryable substrings win, then retryable substrings, then the
    /// classifier's verdict.
    pub fn should_retry(&self, message: &str, classified: &ClassifiedError) -> bool {
        let lowered = message.to_lowercase();
        let matches = |needle: &String| lowered.contains(&needle.to_lowercase());

        if self.non_retryable_errors.iter().any(matches) {
            return false;
        }
        if self.retryable_errors.iter().any(matches) {
            return true;
        }
        classified.retryable
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Retries after the first attempt.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    /// Delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Backoff ceiling.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Backoff growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Replace the retryable substrings.
    pub fn retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the non-retryable substrings.
    pub fn non_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.non_retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> Result<RetryPolicy, OrchestratorError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Default policy plus per-tenant overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicies {
    default: RetryPolicy,
    overrides: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    /// Policies with no overrides.
    pub fn new(default: RetryPolicy) -> Self {
        Self { default, overrides: HashMap::new() }
    }

    /// Use `policy` for `tenant`.
    #[must_use]
    pub fn with_override(mut self, tenant: impl Into<String>, policy: RetryPolicy) -> Self {
        self.overrides.insert(tenant.into(), policy);
        self
    }

    /// Policy in effect for `tenant`.
    pub fn resolve(&self, tenant: &str) -> &RetryPolicy {
        self.overrides.get(tenant).unwrap_or(&self.default)
    }

    /// Policy for tenants without an override.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    /// Per-tenant overrides.
    pub fn overrides(&self) -> &HashMap<String, RetryPolicy> {
        &self.overrides
    }

    /// Validate the default and every override.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        self.default.validate()?;
        for (tenant, policy) in &self.overrides {
            policy.validate().map_err(|e| {
                OrchestratorError::config(format!("retry override for tenant '{tenant}': {e}"))
            })?;
        }
        Ok(())
    }
}

/// Runs tenant operations with retry, classification, circuit breaking and
/// dead-lettering
pub struct RetryExecutor {
    policies: Arc<RetryPolicies>,
    classifier: Arc<dyn ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterSink>,
    metrics: ErrorMetrics,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policies", &self.policies)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Executor over shared breakers, sinks and metrics.
    pub fn new(
        policies: Arc<RetryPolicies>,
        classifier: Arc<dyn ErrorClassifier>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: Arc<DeadLetterSink>,
        metrics: ErrorMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policies, classifier, breakers, dead_letters, metrics, clock }
    }

    /// Retry policies in effect.
    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Per-tenant breakers.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Where exhausted calls go.
    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    /// Metrics tracker.
    pub fn metrics(&self) -> &ErrorMetrics {
        &self.metrics
    }

    /// Run `operation` for `tenant` until it succeeds, fails permanently, runs
    /// out of retries or is cancelled.
    ///
    /// The breaker sees one outcome per call, not per attempt. Cancellation
    /// records no outcome and writes no dead letter; a half-open trial held
    /// by the cancelled call is released.
    #[instrument(skip_all, fields(tenant = %tenant, operation = %operation.name()))]
    pub async fn execute_with_retry(
        &self,
        tenant: &str,
        operation: &dyn TenantOperation,
        cancel: &CancellationToken,
    ) -> TenantResult {
        if cancel.is_cancelled() {
            return Err(self.cancelled(tenant, 0));
        }

        if !self.breakers.admit(tenant) {
            self.metrics.record_circuit_rejection(tenant);
            warn!(tenant, "Call rejected by open circuit breaker");
            return Err(OrchestratorError::CircuitOpen { tenant: tenant.to_string() });
        }

        let policy = self.policies.resolve(tenant).clone();
        let mut history: Vec<ErrorRecord> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            debug!(tenant, attempt, max_attempts = policy.max_attempts, "Executing operation");
            let ctx = TenantContext::new(tenant, attempt, cancel.child_token());

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.cancelled_in_flight(tenant, attempt)),
                result = operation.run(ctx) => result,
            };

            let error = match result {
                Ok(()) => {
                    self.breakers.record_success(tenant);
                    self.metrics.record_success(tenant);
                    if attempt > 0 {
                        info!(tenant, attempt, "Operation succeeded after retries");
                    }
                    return Ok(());
                }
                Err(error) => error,
            };

            let message = error.to_string();
            let classified = self.classifier.classify(&message);
            self.metrics.record_error(tenant, &classified);
            history.push(ErrorRecord {
                attempt,
                message: message.clone(),
                classification: classified.clone(),
                occurred_at: self.clock.utc_now(),
            });

            if !policy.should_retry(&message, &classified) {
                warn!(
                    tenant,
                    attempt,
                    error_type = %classified.error_type,
                    category = %classified.category,
                    severity = %classified.severity,
                    "Non-retryable failure"
                );
                self.record_call_failure(tenant);
                return Err(OrchestratorError::NonRetryable {
                    tenant: tenant.to_string(),
                    error_type: classified.error_type,
                    category: classified.category,
                    severity: classified.severity,
                    message,
                });
            }

            if attempt >= policy.max_attempts {
                warn!(
                    tenant,
                    attempts = attempt + 1,
                    error_type = %classified.error_type,
                    "Retries exhausted"
                );
                self.record_call_failure(tenant);
                let entry = DeadLetterEntry::new(
                    tenant,
                    operation.name(),
                    operation.payload(tenant),
                    history,
                    policy.max_attempts,
                    self.clock.utc_now(),
                );
                self.dead_letters.put(entry);
                self.metrics.record_dead_letter(tenant);
                return Err(OrchestratorError::Exhausted {
                    tenant: tenant.to_string(),
                    retries: policy.max_attempts,
                    last_error: message,
                });
            }

            let delay = policy.jittered_delay(attempt);
            self.metrics.record_retry(tenant);
            warn!(
                tenant,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error_type = %classified.error_type,
                category = %classified.category,
                "Attempt failed, retrying after backoff"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.cancelled_in_flight(tenant, attempt)),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn record_call_failure(&self, tenant: &str) {
        if self.breakers.record_failure(tenant) {
            self.metrics.record_circuit_trip(tenant);
        }
    }

    /// Cancellation after admission: the call records no outcome, so any
    /// half-open trial it held goes back to the breaker.
    fn cancelled_in_flight(&self, tenant: &str, attempt: u32) -> OrchestratorError {
        self.breakers.release_trial(tenant);
        self.cancelled(tenant, attempt)
    }

    fn cancelled(&self, tenant: &str, attempt: u32) -> OrchestratorError {
        self.metrics.record_cancellation(tenant);
        info!(tenant, attempt, "Operation cancelled");
        OrchestratorError::Cancelled { tenant: tenant.to_string() }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for retry policy math and the executor loop.
    //!
    //! Executor tests run on paused tokio time, so backoff sleeps complete
    //! instantly while `Instant` deltas still reflect the requested delays.

    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::classifier::PatternClassifier;
    use crate::error::{BoxedError, ErrorCategory};
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::time::{MockClock, SystemClock};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .multiplier(2.0)
            .jitter(false)
            .build()
            .unwrap()
    }

    fn executor(policies: RetryPolicies, threshold: u32) -> RetryExecutor {
        let config = CircuitBreakerConfig::builder().failure_threshold(threshold).build().unwrap();
        RetryExecutor::new(
            Arc::new(policies),
            Arc::new(PatternClassifier::new()),
            Arc::new(CircuitBreakerRegistry::new(config).unwrap()),
            Arc::new(DeadLetterSink::new()),
            ErrorMetrics::new(),
            Arc::new(SystemClock),
        )
    }

    fn failing(message: &'static str, calls: Arc<AtomicU32>) -> impl TenantOperation {
        move |_ctx: TenantContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), BoxedError>(message.into()) }
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert!(policy.jitter);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::builder().multiplier(1.0).build().is_err());
        assert!(RetryPolicy::builder().multiplier(f64::NAN).build().is_err());
        assert!(RetryPolicy::builder()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
    }

    /// Validates monotonic backoff growth with a ceiling.
    ///
    /// Assertions:
    /// - delay(n) <= delay(n + 1)
    /// - delay(n) <= max_delay for every n, including huge attempt indexes
    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));

        for attempt in 0..40 {
            let current = policy.delay_for_attempt(attempt);
            assert!(current <= policy.delay_for_attempt(attempt + 1));
            assert!(current <= policy.max_delay);
        }
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::builder().jitter(true).build().unwrap();
        for _ in 0..200 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_millis(1800), "{delay:?}");
            assert!(delay <= Duration::from_millis(2200), "{delay:?}");
        }
        let zero = RetryPolicy::builder().initial_delay(Duration::ZERO).build().unwrap();
        assert_eq!(zero.jittered_delay(3), Duration::ZERO);
    }

    /// Validates the retry decision order.
    ///
    /// Assertions:
    /// - Non-retryable substrings beat retryable ones
    /// - Retryable substrings override a non-retryable classification
    /// - Otherwise the classifier decides
    #[test]
    fn test_retry_decision_order() {
        let classifier = PatternClassifier::new();
        let policy = RetryPolicy::default();

        let both = "AccessDenied while ServiceUnavailable";
        assert!(!policy.should_retry(both, &classifier.classify(both)));

        let unknown = "internalerror: boom";
        assert!(policy.should_retry(unknown, &ClassifiedError::unknown()));

        assert!(policy.should_retry("connection timeout", &classifier.classify("connection timeout")));
        assert!(!policy.should_retry("weird", &classifier.classify("weird")));
    }

    #[test]
    fn test_policy_overrides() {
        let policies = RetryPolicies::new(policy(2)).with_override("vip", policy(5));
        assert_eq!(policies.resolve("vip").max_attempts, 5);
        assert_eq!(policies.resolve("other").max_attempts, 2);

        let mut bad = policy(1);
        bad.multiplier = 0.5;
        let policies = RetryPolicies::default().with_override("broken", bad);
        assert!(policies.validate().unwrap_err().to_string().contains("broken"));
    }

    #[test]
    fn test_policy_serde_uses_millis() {
        let value = serde_json::to_value(policy(2)).unwrap();
        assert_eq!(value["initial_delay_ms"], 1000);
        assert_eq!(value["max_delay_ms"], 10000);

        let parsed: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(parsed.max_attempts, 7);
        assert_eq!(parsed.initial_delay, DEFAULT_INITIAL_DELAY);
    }

    /// Validates the exhaustion scenario end to end.
    ///
    /// Assertions:
    /// - Three attempts separated by ~1s and ~2s
    /// - Error text reports two retries
    /// - One dead letter with attempts_made = 2 and three history records
    #[tokio::test(start_paused = true)]
    async fn test_exhausts_and_dead_letters() {
        let exec = executor(RetryPolicies::new(policy(2)), 5);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = exec
            .execute_with_retry("acme", &failing("connection timeout", calls.clone()), &CancellationToken::new())
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("exhausted after 2 retries"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));

        let entries = exec.dead_letters().drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts_made, 2);
        assert_eq!(entries[0].error_history.len(), 3);
        assert_eq!(entries[0].error_history[2].attempt, 2);

        let metrics = exec.metrics().snapshot();
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.total_errors, 3);
        assert_eq!(metrics.dead_letters, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast_without_dead_letter() {
        let exec = executor(RetryPolicies::new(policy(3)), 5);
        let calls = Arc::new(AtomicU32::new(0));

        let err = exec
            .execute_with_retry("acme", &failing("Access Denied", calls.clone()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::NonRetryable { category: ErrorCategory::Security, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(exec.dead_letters().is_empty());
        assert_eq!(exec.circuit_breakers().snapshot("acme").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let exec = executor(RetryPolicies::new(policy(3)), 5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move |ctx: TenantContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt < 2 {
                    Err::<(), BoxedError>("throttled".into())
                } else {
                    Ok(())
                }
            }
        };

        exec.execute_with_retry("acme", &op, &CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.metrics().snapshot().tenant("acme").successes, 1);
        assert_eq!(exec.circuit_breakers().state("acme"), CircuitState::Closed);
    }

    /// Validates that an open breaker rejects before invoking the operation.
    ///
    /// Assertions:
    /// - Five failed calls trip a threshold-5 breaker
    /// - The sixth call returns `CircuitOpen` and the operation is not invoked
    /// - The rejection is not dead-lettered
    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_before_invocation() {
        let exec = executor(RetryPolicies::new(policy(0)), 5);
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing("Access Denied", calls.clone());

        for _ in 0..5 {
            let _ = exec.execute_with_retry("acme", &op, &CancellationToken::new()).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let err = exec.execute_with_retry("acme", &op, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(exec.dead_letters().is_empty());

        let metrics = exec.metrics().snapshot();
        assert_eq!(metrics.circuit_trips, 1);
        assert_eq!(metrics.circuit_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let exec = Arc::new(executor(RetryPolicies::new(policy(5)), 5));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let exec = Arc::clone(&exec);
            let cancel = cancel.clone();
            let op = failing("connection timeout", calls.clone());
            tokio::spawn(async move { exec.execute_with_retry("acme", &op, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(exec.dead_letters().is_empty());
        assert_eq!(exec.circuit_breakers().snapshot("acme").unwrap().failure_count, 0);
        assert_eq!(exec.metrics().snapshot().cancellations, 1);
    }

    /// Validates that a half-open trial cancelled during backoff hands its
    /// slot back, so the tenant is admitted again.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_trial_is_released() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(30))
            .half_open_max_calls(1)
            .build()
            .unwrap();
        let breakers =
            Arc::new(CircuitBreakerRegistry::with_clock(config, Arc::new(clock.clone())).unwrap());
        let exec = Arc::new(RetryExecutor::new(
            Arc::new(RetryPolicies::new(policy(3))),
            Arc::new(PatternClassifier::new()),
            Arc::clone(&breakers),
            Arc::new(DeadLetterSink::new()),
            ErrorMetrics::new(),
            Arc::new(clock.clone()),
        ));
        breakers.record_failure("acme");
        clock.advance(Duration::from_secs(31));

        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let task = {
            let exec = Arc::clone(&exec);
            let cancel = cancel.clone();
            let op = failing("connection timeout", calls.clone());
            tokio::spawn(async move { exec.execute_with_retry("acme", &op, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(breakers.snapshot("acme").unwrap().half_open_calls, 1);
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));

        let snapshot = breakers.snapshot("acme").unwrap();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.half_open_calls, 0);
        assert!(breakers.admit("acme"));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_admission() {
        let exec = executor(RetryPolicies::new(policy(1)), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let err = exec.execute_with_retry("acme", &failing("x", calls.clone()), &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exec.circuit_breakers().is_empty());
    }
}
