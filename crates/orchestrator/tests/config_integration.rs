//! Integration tests for configuration loading
//!
//! Writes real TOML and JSON files to a temporary directory, loads them and
//! builds an orchestrator from the result.

use std::io::Write;
use std::time::Duration;

use tempfile::{Builder, TempDir};
use tenantry_orchestrator::config::{load, load_from_file};
use tenantry_orchestrator::{
    BoxedError, IsolationOrchestrator, OrchestratorConfig, OrchestratorError, TenantContext,
};

const TOML_CONFIG: &str = r#"
max_concurrency = 3
timeout_ms = 45000

[retry]
max_attempts = 2
initial_delay_ms = 1000
max_delay_ms = 10000
multiplier = 2.0
jitter = false
non_retryable_errors = ["QuotaExhausted"]

[tenant_overrides.acme]
max_attempts = 0
initial_delay_ms = 10
max_delay_ms = 10

[circuit_breaker]
failure_threshold = 4
recovery_timeout_ms = 60000
half_open_max_calls = 2
"#;

fn write_config(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create config file");
    file.write_all(contents.as_bytes()).expect("write config file");
    path
}

/// Validates a full TOML file round-trip into an orchestrator.
///
/// # Test Steps
/// 1. Load the file and check each section
/// 2. Build an orchestrator with `from_config`
/// 3. Confirm the tenant override and policy list are in effect
#[tokio::test]
async fn test_toml_file_builds_orchestrator() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "tenantry.toml", TOML_CONFIG);

    let config = load_from_file(&path).expect("load toml");
    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.retry.non_retryable_errors, vec!["QuotaExhausted".to_string()]);
    assert_eq!(config.tenant_overrides["acme"].max_attempts, 0);
    assert_eq!(config.circuit_breaker.failure_threshold, 4);
    assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(60));
    assert_eq!(config.max_concurrency, Some(3));
    assert_eq!(config.timeout, Some(Duration::from_secs(45)));
    config.validate().expect("valid");

    let orchestrator = IsolationOrchestrator::from_config(config).expect("build");
    assert_eq!(orchestrator.admission_gate().available_permits(), Some(3));
    assert_eq!(orchestrator.circuit_breakers().config().half_open_max_calls, 2);

    let results = orchestrator
        .run_for_tenants(["acme", "globex"], |ctx: TenantContext| async move {
            match ctx.tenant.as_str() {
                // Retryable by classification, but the override allows no retries.
                "acme" => Err::<(), BoxedError>("connection refused".into()),
                // Retryable by classification, stopped by the policy list.
                _ => Err("QuotaExhausted: throttled".into()),
            }
        })
        .await;

    assert!(matches!(
        results.get("acme"),
        Some(Err(OrchestratorError::Exhausted { retries: 0, .. }))
    ));
    assert!(matches!(results.get("globex"), Some(Err(OrchestratorError::NonRetryable { .. }))));
    assert_eq!(orchestrator.dead_letters().len(), 1);
}

#[test]
fn test_json_file_matches_serialized_config() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut config = OrchestratorConfig { max_concurrency: Some(8), ..Default::default() };
    config.retry.max_attempts = 4;

    let json = serde_json::to_string_pretty(&config)?;
    let path = write_config(&dir, "tenantry.json", &json);

    let loaded = load_from_file(&path)?;
    assert_eq!(loaded, config);
    Ok(())
}

#[test]
fn test_load_validates_file_contents() {
    let file = Builder::new().suffix(".toml").tempfile().expect("temp file");
    std::fs::write(file.path(), "[retry]\nmultiplier = 0.5\n").expect("write");

    let err = load(Some(file.path().to_path_buf())).expect_err("invalid multiplier");
    assert!(err.to_string().contains("multiplier"));
}

#[test]
fn test_unknown_extension_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "tenantry.yaml", "retry: {}");
    let err = load_from_file(&path).expect_err("yaml unsupported");
    assert!(err.to_string().contains("Unsupported config format"));
}
