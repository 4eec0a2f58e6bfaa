//! The caller-supplied unit of work
//!
//! Anything that can run once for a tenant implements [`TenantOperation`].
//! Plain async closures qualify through a blanket impl; wrap one in
//! [`NamedOperation`] to give it a name and replay payload for dead-letter
//! entries.
//!
//! ```
//! use tenantry_orchestrator::{BoxedError, NamedOperation, TenantContext, TenantOperation};
//!
//! let op = NamedOperation::new("refresh_roles", |ctx: TenantContext| async move {
//!     if ctx.attempt == 0 {
//!         return Err::<(), BoxedError>("connection timeout".into());
//!     }
//!     Ok(())
//! });
//! assert_eq!(op.name(), "refresh_roles");
//! ```

use std::future::Future;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::BoxedError;

/// Per-attempt context handed to an operation
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// Tenant this attempt runs for
    pub tenant: String,
    /// Zero-based attempt index
    pub attempt: u32,
    /// Cancelled when the run is cancelled or times out
    pub cancel: CancellationToken,
}

impl TenantContext {
    /// Context for one attempt.
    pub fn new(tenant: impl Into<String>, attempt: u32, cancel: CancellationToken) -> Self {
        Self { tenant: tenant.into(), attempt, cancel }
    }

    /// True once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An action executed once per tenant under retry and circuit protection
#[async_trait]
pub trait TenantOperation: Send + Sync {
    /// Run one attempt.
    async fn run(&self, ctx: TenantContext) -> Result<(), BoxedError>;

    /// Name recorded on dead-letter entries and log spans.
    fn name(&self) -> &str {
        "operation"
    }

    /// Opaque payload stored with a dead-letter entry for replay.
    fn payload(&self, tenant: &str) -> serde_json::Value {
        json!({ "tenant": tenant })
    }
}

#[async_trait]
impl<F, Fut> TenantOperation for F
where
    F: Fn(TenantContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
{
    async fn run(&self, ctx: TenantContext) -> Result<(), BoxedError> {
        (self)(ctx).await
    }
}

/// Attaches a name and optional payload to another operation
#[derive(Debug, Clone)]
pub struct NamedOperation<O> {
    name: String,
    payload: Option<serde_json::Value>,
    inner: O,
}

impl<O: TenantOperation> NamedOperation<O> {
    /// Wrap `inner` under `name`.
    pub fn new(name: impl Into<String>, inner: O) -> Self {
        Self { name: name.into(), payload: None, inner }
    }

    /// Payload stored on dead-letter entries. The tenant key is added under
    /// `"tenant"` when the payload is a JSON object.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[async_trait]
impl<O: TenantOperation> TenantOperation for NamedOperation<O> {
    async fn run(&self, ctx: TenantContext) -> Result<(), BoxedError> {
        self.inner.run(ctx).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn payload(&self, tenant: &str) -> serde_json::Value {
        match &self.payload {
            Some(serde_json::Value::Object(map)) => {
                let mut map = map.clone();
                map.insert("tenant".to_string(), json!(tenant));
                serde_json::Value::Object(map)
            }
            Some(other) => other.clone(),
            None => self.inner.payload(tenant),
        }
    }
}
