//! Resilience primitives: retry with backoff and per-tenant circuit breaking

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitState,
};
pub use retry::{RetryExecutor, RetryPolicies, RetryPolicy, RetryPolicyBuilder};
