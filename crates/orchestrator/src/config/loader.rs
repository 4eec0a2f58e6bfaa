//! Configuration loader
//!
//! Reads [`OrchestratorConfig`] from a TOML or JSON file, then applies
//! environment overrides and validates the result.
//!
//! ## Environment Variables
//! - `TENANTRY_MAX_ATTEMPTS`: default policy retry count
//! - `TENANTRY_INITIAL_DELAY_MS`: default policy initial backoff
//! - `TENANTRY_MAX_DELAY_MS`: default policy backoff ceiling
//! - `TENANTRY_FAILURE_THRESHOLD`: breaker failure threshold
//! - `TENANTRY_RECOVERY_TIMEOUT_MS`: breaker recovery timeout
//! - `TENANTRY_MAX_CONCURRENCY`: concurrent tenant limit
//! - `TENANTRY_TIMEOUT_MS`: fan-out wall-clock limit
//!
//! ## File Locations
//! When no path is given, the loader probes `./tenantry.toml` then
//! `./tenantry.json` in the working directory. If neither exists the
//! defaults are used.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::OrchestratorConfig;
use crate::error::OrchestratorError;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Load configuration from `path` (or the probed default locations), apply
/// environment overrides and validate.
///
/// # Errors
/// Returns `OrchestratorError::Config` if the file cannot be read or parsed,
/// an environment variable holds an unparsable value, or validation fails.
pub fn load(path: Option<PathBuf>) -> Result<OrchestratorConfig> {
    let config = match path.or_else(probe_config_paths) {
        Some(path) => load_from_file(&path)?,
        None => {
            tracing::debug!("No config file found, using defaults");
            OrchestratorConfig::default()
        }
    };

    let config = apply_env_overrides(config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file without env overrides or validation.
///
/// # Errors
/// Returns `OrchestratorError::Config` if the file is missing, unreadable or
/// malformed.
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Err(OrchestratorError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|e| OrchestratorError::config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, path)
}

/// Parse configuration content; format is chosen by the extension of `path`
/// (`.toml` or `.json`).
///
/// # Errors
/// Returns `OrchestratorError::Config` for unsupported extensions or parse
/// failures.
pub fn parse_config(contents: &str, path: &Path) -> Result<OrchestratorConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| OrchestratorError::config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| OrchestratorError::config(format!("Invalid JSON format: {e}"))),
        _ => Err(OrchestratorError::config(format!("Unsupported config format: {extension}"))),
    }
}

/// Apply `TENANTRY_*` overrides from the process environment.
///
/// # Errors
/// Returns `OrchestratorError::Config` if a set variable does not parse.
pub fn apply_env_overrides(config: OrchestratorConfig) -> Result<OrchestratorConfig> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply overrides using `lookup` in place of the process environment.
pub(crate) fn apply_overrides_from<F>(
    mut config: OrchestratorConfig,
    lookup: F,
) -> Result<OrchestratorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var::<u32, _>(&lookup, "TENANTRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = value;
    }
    if let Some(value) = parse_var::<u64, _>(&lookup, "TENANTRY_INITIAL_DELAY_MS")? {
        config.retry.initial_delay = Duration::from_millis(value);
    }
    if let Some(value) = parse_var::<u64, _>(&lookup, "TENANTRY_MAX_DELAY_MS")? {
        config.retry.max_delay = Duration::from_millis(value);
    }
    if let Some(value) = parse_var::<u32, _>(&lookup, "TENANTRY_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = value;
    }
    if let Some(value) = parse_var::<u64, _>(&lookup, "TENANTRY_RECOVERY_TIMEOUT_MS")? {
        config.circuit_breaker.recovery_timeout = Duration::from_millis(value);
    }
    if let Some(value) = parse_var::<usize, _>(&lookup, "TENANTRY_MAX_CONCURRENCY")? {
        config.max_concurrency = Some(value);
    }
    if let Some(value) = parse_var::<u64, _>(&lookup, "TENANTRY_TIMEOUT_MS")? {
        config.timeout = Some(Duration::from_millis(value));
    }
    Ok(config)
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|e| OrchestratorError::config(format!("Invalid {key}={raw:?}: {e}")))?;
            tracing::debug!(key, "Applied environment override");
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// First existing `tenantry.{toml,json}` in the working directory.
pub fn probe_config_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    [cwd.join("tenantry.toml"), cwd.join("tenantry.json")].into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_toml() {
        let contents = r#"
            max_concurrency = 4

            [retry]
            max_attempts = 2
            initial_delay_ms = 1000
            max_delay_ms = 10000
            jitter = false

            [tenant_overrides.acme]
            max_attempts = 6

            [circuit_breaker]
            failure_threshold = 3
        "#;

        let config = parse_config(contents, Path::new("tenantry.toml")).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert!(!config.retry.jitter);
        assert_eq!(config.tenant_overrides["acme"].max_attempts, 6);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn test_parse_json() {
        let contents = r#"{"timeout_ms": 5000, "retry": {"multiplier": 3.0}}"#;
        let config = parse_config(contents, Path::new("tenantry.json")).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert!((config.retry.multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unsupported_and_malformed() {
        assert!(parse_config("", Path::new("tenantry.yaml")).is_err());
        let err = parse_config("retry = [", Path::new("tenantry.toml")).unwrap_err();
        assert!(err.to_string().contains("Invalid TOML format"));
    }

    /// Validates environment overrides.
    ///
    /// Assertions:
    /// - Every recognised variable lands in its field
    /// - Unset variables leave the file value alone
    #[test]
    fn test_env_overrides() {
        let vars = lookup(&[
            ("TENANTRY_MAX_ATTEMPTS", "7"),
            ("TENANTRY_INITIAL_DELAY_MS", "250"),
            ("TENANTRY_MAX_DELAY_MS", "8000"),
            ("TENANTRY_FAILURE_THRESHOLD", "2"),
            ("TENANTRY_RECOVERY_TIMEOUT_MS", "1500"),
            ("TENANTRY_MAX_CONCURRENCY", " 12 "),
            ("TENANTRY_TIMEOUT_MS", "60000"),
        ]);
        let config = apply_overrides_from(OrchestratorConfig::default(), vars).unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(8));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_concurrency, Some(12));
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = apply_overrides_from(
            OrchestratorConfig::default(),
            lookup(&[("TENANTRY_MAX_ATTEMPTS", "many")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("TENANTRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_from_file(Path::new("/nonexistent/tenantry.toml")).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
