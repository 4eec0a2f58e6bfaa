//! # Tenantry Orchestrator
//!
//! Runs one operation across many tenants with per-tenant isolation.
//!
//! Each tenant's call passes through its own circuit breaker, retries with
//! exponential backoff while failures classify as transient, and lands in the
//! dead-letter sink if every permitted retry fails. One tenant's failures
//! never delay, fail or trip the breaker of another.
//!
//! ## Modules
//!
//! - [`classifier`] - Ordered pattern table turning error messages into retry
//!   verdicts
//! - [`resilience`] - Retry policies, the retry executor and per-tenant
//!   circuit breakers
//! - [`dead_letter`] - In-memory capture of exhausted operations
//! - [`metrics`] - Aggregated error counters
//! - [`orchestrator`] - Concurrent fan-out with timeout and cancellation
//! - [`config`] - Serde configuration with file and environment loading
//! - [`logging`] - Tracing subscriber setup
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tenantry_orchestrator::{
//!     BoxedError, IsolationOrchestrator, NamedOperation, RetryPolicy, TenantContext,
//! };
//!
//! # async fn example() -> Result<(), tenantry_orchestrator::OrchestratorError> {
//! let orchestrator = IsolationOrchestrator::builder()
//!     .retry_policy(RetryPolicy::builder().max_attempts(2).build()?)
//!     .build()?;
//!
//! let op = NamedOperation::new("assume_role", |ctx: TenantContext| async move {
//!     // call the tenant's endpoint here
//!     let _ = ctx.tenant;
//!     Ok::<(), BoxedError>(())
//! });
//!
//! let results = orchestrator
//!     .run_for_tenants_with_timeout(["acme", "globex"], op, Duration::from_secs(60))
//!     .await;
//! for (tenant, error) in results.failed() {
//!     eprintln!("{tenant}: {error}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod operation;
pub mod orchestrator;
pub mod resilience;
pub mod time;
pub mod utils;

pub use classifier::{
    ClassifiedError, ErrorClassifier, ErrorPattern, PatternClassifier, PatternClassifierBuilder,
};
pub use config::OrchestratorConfig;
pub use dead_letter::{DeadLetterEntry, DeadLetterSink, DeadLetterStats, ErrorRecord, Priority};
pub use error::{BoxedError, ErrorCategory, ErrorSeverity, OrchestratorError, TenantResult};
pub use metrics::{ErrorMetrics, ErrorMetricsSnapshot, TenantCounters};
pub use operation::{NamedOperation, TenantContext, TenantOperation};
pub use orchestrator::{
    AdmissionGate, IsolationOrchestrator, IsolationOrchestratorBuilder, OrchestratorReport,
    TenantResults,
};
pub use resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState,
    RetryExecutor, RetryPolicies, RetryPolicy,
};
pub use time::{Clock, MockClock, SystemClock};
