//! Orchestrator configuration
//!
//! All durations are written in milliseconds. Every section is optional in a
//! file; missing fields take their defaults.
//!
//! ```toml
//! max_concurrency = 16
//! timeout_ms = 120000
//!
//! [retry]
//! max_attempts = 2
//! initial_delay_ms = 1000
//! max_delay_ms = 10000
//! multiplier = 2.0
//! jitter = true
//!
//! [tenant_overrides.acme]
//! max_attempts = 5
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 30000
//! half_open_max_calls = 3
//! ```

pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::resilience::{CircuitBreakerConfig, RetryPolicies, RetryPolicy};
use crate::utils::serde::option_duration_millis;

pub use loader::{apply_env_overrides, load, load_from_file, parse_config};

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Policy for tenants without an override
    pub retry: RetryPolicy,
    /// Per-tenant policy overrides, keyed by tenant
    pub tenant_overrides: HashMap<String, RetryPolicy>,
    /// Breaker thresholds shared by every tenant
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upper bound on concurrently running tenants; unbounded when absent
    pub max_concurrency: Option<usize>,
    /// Wall-clock limit for a whole fan-out
    #[serde(
        with = "option_duration_millis",
        rename = "timeout_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl OrchestratorConfig {
    /// Check every section, naming the offending one on failure.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        self.retry_policies().validate()?;
        self.circuit_breaker.validate()?;
        if self.max_concurrency == Some(0) {
            return Err(OrchestratorError::config("max_concurrency must be greater than 0"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::config("timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Default policy plus overrides as a [`RetryPolicies`] set.
    pub fn retry_policies(&self) -> RetryPolicies {
        self.tenant_overrides.iter().fold(
            RetryPolicies::new(self.retry.clone()),
            |policies, (tenant, policy)| policies.with_override(tenant.clone(), policy.clone()),
        )
    }
}
