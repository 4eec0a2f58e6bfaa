//! Per-tenant circuit breakers
//!
//! Each tenant key gets its own three-state breaker, created lazily the first
//! time the key is seen. State for one tenant lives behind its own mutex, so
//! tenants never contend with each other at the breaker level.
//!
//! Transitions:
//! - closed → open when consecutive failures reach `failure_threshold`
//! - open → half-open on the first admission check after `recovery_timeout`
//!   (there is no background timer; an idle tenant stays open until asked)
//! - half-open → closed once `half_open_max_calls` trials have succeeded
//! - half-open → open on any failure
//!
//! A half-open trial whose call is cancelled is released, so the slot can be
//! taken by a later call.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::time::{Clock, SystemClock};
use crate::utils::serde::duration_millis;

/// Default consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cooldown before an open breaker lets a probe through.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of trial calls admitted while half-open.
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A limited number of trial calls probe for recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Thresholds shared by every tenant's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    #[serde(with = "duration_millis", rename = "recovery_timeout_ms")]
    pub recovery_timeout: Duration,
    /// Trial calls admitted (and successes needed to close) while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.failure_threshold == 0 {
            return Err(OrchestratorError::config("failure_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(OrchestratorError::config("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Consecutive failures that open the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Cooldown before a probe is admitted.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Half-open trial budget.
    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<CircuitBreakerConfig, OrchestratorError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Read-only view of one tenant's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    /// Tenant key
    pub tenant: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Consecutive successes within the current half-open window
    pub success_count: u32,
    /// Trials admitted in the current half-open window
    pub half_open_calls: u32,
    /// Most recent recorded failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent recorded success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Times this breaker has opened
    pub trips: u64,
    /// Calls refused at admission
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    trips: u64,
    rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            trips: 0,
            rejections: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.trips += 1;
    }

    fn snapshot(&self, tenant: &str) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            tenant: tenant.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_calls: self.half_open_calls,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            trips: self.trips,
            rejections: self.rejections,
        }
    }
}

/// Lazily-populated map of tenant key → circuit breaker
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("tenants", &self.breakers.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Registry backed by the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, OrchestratorError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Registry backed by a custom clock (useful for testing).
    pub fn with_clock(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self { config, breakers: DashMap::new(), clock })
    }

    /// Thresholds shared by every breaker.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn breaker(&self, tenant: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.breakers.get(tenant) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new())));
        Arc::clone(entry.value())
    }

    /// Decide whether a call for `tenant` may proceed.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// here. Every call admitted while half-open consumes one trial.
    pub fn admit(&self, tenant: &str) -> bool {
        let breaker = self.breaker(tenant);
        let mut guard = breaker.lock();

        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let now = self.clock.now();
                let cooled_down = guard.last_failure.map_or(true, |failed_at| {
                    now.saturating_duration_since(failed_at) >= self.config.recovery_timeout
                });
                if cooled_down {
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_calls = 1;
                    guard.success_count = 0;
                    info!(tenant, "Circuit breaker half-open, admitting probe");
                    true
                } else {
                    guard.rejections += 1;
                    debug!(tenant, state = %guard.state, "Circuit breaker rejecting call");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.half_open_calls < self.config.half_open_max_calls {
                    guard.half_open_calls += 1;
                    true
                } else {
                    guard.rejections += 1;
                    debug!(tenant, state = %guard.state, "Half-open trial budget spent");
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, tenant: &str) {
        let breaker = self.breaker(tenant);
        let mut guard = breaker.lock();
        guard.last_success_at = Some(self.clock.utc_now());

        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.half_open_max_calls {
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.success_count = 0;
                    guard.half_open_calls = 0;
                    info!(tenant, "Circuit breaker closed after successful trials");
                }
            }
            CircuitState::Open => {
                warn!(tenant, "Received success while circuit is open");
            }
        }
    }

    /// Record a failed call. Returns `true` when this failure opened the
    /// circuit.
    pub fn record_failure(&self, tenant: &str) -> bool {
        let breaker = self.breaker(tenant);
        let mut guard = breaker.lock();
        guard.last_failure = Some(self.clock.now());
        guard.last_failure_at = Some(self.clock.utc_now());

        match guard.state {
            CircuitState::Closed => {
                guard.failure_count += 1;
                if guard.failure_count >= self.config.failure_threshold {
                    guard.open();
                    warn!(
                        tenant,
                        failures = guard.failure_count,
                        "Circuit breaker opened after consecutive failures"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                guard.open();
                warn!(tenant, "Circuit breaker re-opened by failure in half-open state");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Give back the half-open trial of an admitted call that ended without
    /// an outcome (cancelled). No-op unless the breaker is half-open.
    pub fn release_trial(&self, tenant: &str) {
        let Some(breaker) = self.breakers.get(tenant).map(|b| Arc::clone(b.value())) else {
            return;
        };
        let mut guard = breaker.lock();
        if guard.state == CircuitState::HalfOpen && guard.half_open_calls > 0 {
            guard.half_open_calls -= 1;
            debug!(tenant, half_open_calls = guard.half_open_calls, "Released half-open trial");
        }
    }

    /// Current state; tenants never seen report closed.
    pub fn state(&self, tenant: &str) -> CircuitState {
        self.breakers.get(tenant).map_or(CircuitState::Closed, |b| b.value().lock().state)
    }

    /// Snapshot of one tenant's breaker, if it exists.
    pub fn snapshot(&self, tenant: &str) -> Option<CircuitBreakerSnapshot> {
        let breaker = self.breakers.get(tenant).map(|b| Arc::clone(b.value()))?;
        let guard = breaker.lock();
        Some(guard.snapshot(tenant))
    }

    /// Snapshots of every known breaker, sorted by tenant key.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<(String, Arc<Mutex<BreakerState>>)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut snapshots: Vec<_> =
            breakers.iter().map(|(tenant, breaker)| breaker.lock().snapshot(tenant)).collect();
        snapshots.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        snapshots
    }

    /// Force a tenant's breaker back to closed.
    pub fn reset(&self, tenant: &str) {
        if let Some(breaker) = self.breakers.get(tenant).map(|b| Arc::clone(b.value())) {
            let mut guard = breaker.lock();
            let (trips, rejections) = (guard.trips, guard.rejections);
            *guard = BreakerState::new();
            guard.trips = trips;
            guard.rejections = rejections;
            info!(tenant, "Circuit breaker manually reset to closed state");
        }
    }

    /// Number of tenants with a breaker.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True before any tenant has been seen.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
