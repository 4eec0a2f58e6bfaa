//! Error classification
//!
//! Failures reach the orchestrator as opaque errors from caller-supplied
//! operations, so classification works on the rendered message. A
//! [`PatternClassifier`] walks an ordered table of [`ErrorPattern`]s and the
//! first pattern with a matching keyword wins; table order is priority. An
//! unmatched message becomes `unknown_error`, which is never retried.
//!
//! The retry path only depends on the [`ErrorClassifier`] trait, so a
//! classifier keyed on structured error codes can replace the string table
//! without touching retry or breaker logic.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, ErrorSeverity};

/// Error type tag used when nothing in the table matches.
pub const UNKNOWN_ERROR: &str = "unknown_error";

/// Verdict for a single failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Name of the matching pattern, or [`UNKNOWN_ERROR`]
    pub error_type: String,
    /// How urgent the failure is
    pub severity: ErrorSeverity,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// Failure taxonomy bucket
    pub category: ErrorCategory,
    /// Suggested mitigation for operators
    pub mitigation: String,
}

impl ClassifiedError {
    /// Fail-safe verdict for unrecognised errors.
    pub fn unknown() -> Self {
        Self {
            error_type: UNKNOWN_ERROR.to_string(),
            severity: ErrorSeverity::Medium,
            retryable: false,
            category: ErrorCategory::Unknown,
            mitigation: "Inspect the error details; unclassified errors are not retried"
                .to_string(),
        }
    }
}

/// Classifies a failure into a retry verdict
pub trait ErrorClassifier: Send + Sync {
    /// Classify an error by its rendered message.
    fn classify(&self, message: &str) -> ClassifiedError;

    /// Classify an error value.
    fn classify_error(&self, error: &(dyn std::error::Error + 'static)) -> ClassifiedError {
        self.classify(&error.to_string())
    }
}

/// One row of the classification table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    /// Becomes `error_type` on a match
    pub name: String,
    /// Lower-case substrings; any match selects this pattern
    pub keywords: Vec<String>,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// How urgent the failure is
    pub severity: ErrorSeverity,
    /// Failure taxonomy bucket
    pub category: ErrorCategory,
    /// Operator hint copied onto the verdict
    pub mitigation: String,
}

impl ErrorPattern {
    /// Table row; keywords are lower-cased.
    pub fn new<S: Into<String>>(
        name: S,
        keywords: &[&str],
        retryable: bool,
        severity: ErrorSeverity,
        category: ErrorCategory,
        mitigation: S,
    ) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            retryable,
            severity,
            category,
            mitigation: mitigation.into(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|keyword| lowered.contains(keyword.as_str()))
    }

    fn verdict(&self) -> ClassifiedError {
        ClassifiedError {
            error_type: self.name.clone(),
            severity: self.severity,
            retryable: self.retryable,
            category: self.category,
            mitigation: self.mitigation.clone(),
        }
    }
}

/// Ordered substring-matching classifier
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: Vec<ErrorPattern>,
}

impl PatternClassifier {
    /// Classifier using the built-in table.
    pub fn new() -> Self {
        Self { patterns: default_patterns() }
    }

    /// Classifier using a caller-supplied table, in priority order.
    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|mut pattern| {
                pattern.keywords = pattern.keywords.iter().map(|k| k.to_lowercase()).collect();
                pattern
            })
            .collect();
        Self { patterns }
    }

    /// Start an empty table.
    pub fn builder() -> PatternClassifierBuilder {
        PatternClassifierBuilder::default()
    }

    /// The table in priority order.
    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }
}

/// Builder for [`PatternClassifier`]; patterns keep the order they are added
#[derive(Debug, Default)]
pub struct PatternClassifierBuilder {
    patterns: Vec<ErrorPattern>,
}

impl PatternClassifierBuilder {
    /// Append one pattern (lowest priority so far).
    #[must_use]
    pub fn pattern(mut self, pattern: ErrorPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Append the built-in table after anything already added.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.patterns.extend(default_patterns());
        self
    }

    /// Finish the table.
    pub fn build(self) -> PatternClassifier {
        PatternClassifier::with_patterns(self.patterns)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> ClassifiedError {
        let lowered = message.to_lowercase();
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(&lowered))
            .map_or_else(ClassifiedError::unknown, ErrorPattern::verdict)
    }
}

/// Built-in table. Security and data patterns come before the transient ones
/// so a message mentioning both "access denied" and "timeout" is treated as
/// a permission problem.
pub fn default_patterns() -> Vec<ErrorPattern> {
    use ErrorCategory::{Capacity, Data, Infrastructure, Security, Service};
    use ErrorSeverity::{Critical, High, Medium};

    vec![
        ErrorPattern::new(
            "authentication_error",
            &[
                "authentication",
                "unauthenticated",
                "invalid credentials",
                "invalidclienttokenid",
                "expiredtoken",
                "expired token",
                "invalid token",
                "signaturedoesnotmatch",
            ],
            false,
            Critical,
            Security,
            "Refresh or rotate the tenant's credentials before retrying",
        ),
        ErrorPattern::new(
            "authorization_error",
            &[
                "access denied",
                "accessdenied",
                "unauthorized",
                "forbidden",
                "permission denied",
                "not authorized",
            ],
            false,
            High,
            Security,
            "Check the tenant role's trust and permission policies",
        ),
        ErrorPattern::new(
            "validation_error",
            &[
                "validation",
                "invalid parameter",
                "invalidparameter",
                "invalid input",
                "malformed",
                "bad request",
            ],
            false,
            Medium,
            Data,
            "Correct the request payload; the same input will fail again",
        ),
        ErrorPattern::new(
            "rate_limit_error",
            &[
                "rate limit",
                "rate exceeded",
                "throttl",
                "too many requests",
                "quota",
                "slow down",
                "requestlimitexceeded",
            ],
            true,
            Medium,
            Capacity,
            "Back off and reduce request rate for this tenant",
        ),
        ErrorPattern::new(
            "timeout_error",
            &["timeout", "timed out", "deadline exceeded"],
            true,
            Medium,
            Infrastructure,
            "Retry with backoff; check upstream latency if persistent",
        ),
        ErrorPattern::new(
            "network_error",
            &[
                "connection",
                "network",
                "dns",
                "no such host",
                "unreachable",
                "reset by peer",
                "broken pipe",
            ],
            true,
            High,
            Infrastructure,
            "Verify network reachability of the tenant endpoint",
        ),
        ErrorPattern::new(
            "service_error",
            &[
                "internal error",
                "internalerror",
                "internal server error",
                "service unavailable",
                "serviceunavailable",
                "bad gateway",
                "server error",
            ],
            true,
            High,
            Service,
            "Upstream service is degraded; retry later",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_timeout_is_retryable_infrastructure() {
        let verdict = PatternClassifier::new().classify("dial tcp: connection timeout");
        assert_eq!(verdict.error_type, "timeout_error");
        assert_eq!(verdict.category, ErrorCategory::Infrastructure);
        assert!(verdict.retryable);
    }

    /// Validates that table order decides between competing keywords.
    ///
    /// Assertions:
    /// - Confirms a message with "timeout" and "access denied" resolves to the
    ///   authorization pattern.
    #[test]
    fn test_table_order_breaks_ties() {
        let classifier = PatternClassifier::new();
        let verdict = classifier.classify("request timeout after Access Denied response");
        assert_eq!(verdict.error_type, "authorization_error");
        assert_eq!(verdict.category, ErrorCategory::Security);
        assert!(!verdict.retryable);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let classifier = PatternClassifier::new();
        assert_eq!(
            classifier.classify("ThrottlingException: Rate exceeded").category,
            ErrorCategory::Capacity
        );
        assert_eq!(
            classifier.classify("ServiceUnavailable: try again").category,
            ErrorCategory::Service
        );
        assert_eq!(
            classifier.classify("ExpiredToken: the security token expired").severity,
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_unmatched_message_falls_back_to_unknown() {
        let verdict = PatternClassifier::new().classify("something odd happened");
        assert_eq!(verdict, ClassifiedError::unknown());
        assert!(!verdict.retryable);
        assert_eq!(verdict.severity, ErrorSeverity::Medium);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = PatternClassifier::new();
        let messages = ["malformed JSON body", "network unreachable", "quota exceeded", "???"];
        for message in messages {
            assert_eq!(classifier.classify(message), classifier.classify(message));
        }
    }

    #[test]
    fn test_custom_table_lowercases_keywords() {
        let classifier = PatternClassifier::with_patterns(vec![ErrorPattern {
            name: "lock_error".to_string(),
            keywords: vec!["Deadlock".to_string()],
            retryable: true,
            severity: ErrorSeverity::Low,
            category: ErrorCategory::Service,
            mitigation: "retry".to_string(),
        }]);

        assert_eq!(classifier.classify("DEADLOCK detected").error_type, "lock_error");
        assert_eq!(classifier.classify("connection refused").error_type, UNKNOWN_ERROR);
    }

    #[test]
    fn test_builder_puts_custom_patterns_first() {
        let classifier = PatternClassifier::builder()
            .pattern(ErrorPattern::new(
                "quota_exhausted",
                &["QuotaExhausted"],
                false,
                ErrorSeverity::High,
                ErrorCategory::Capacity,
                "Raise the tenant's quota",
            ))
            .with_defaults()
            .build();

        assert_eq!(classifier.patterns().len(), default_patterns().len() + 1);
        let verdict = classifier.classify("QuotaExhausted: throttled");
        assert_eq!(verdict.error_type, "quota_exhausted");
        assert!(!verdict.retryable);
        assert_eq!(classifier.classify("throttled").error_type, "rate_limit_error");
    }

    #[test]
    fn test_classify_error_uses_display() {
        let err = std::io::Error::other("connection reset by peer");
        let verdict = PatternClassifier::new().classify_error(&err);
        assert_eq!(verdict.error_type, "network_error");
    }
}
