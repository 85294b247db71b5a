//! Named policy configuration
//!
//! A [`PolicySet`] is loaded once at startup and maps protected names to the
//! stages of their chain. Names that are not listed get `defaults`.
//!
//! ```json
//! {
//!   "defaults": { "circuitBreaker": {}, "bulkhead": {}, "rateLimiter": {}, "retry": {} },
//!   "policies": {
//!     "backendB": {
//!       "circuitBreaker": { "failureRateThreshold": 0.5, "waitDurationInOpenState": "10s" },
//!       "retry": { "maxAttempts": 3, "backoff": { "type": "fixed", "delay": "500ms" } }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ConfigError, ConfigResult, ResilienceConfig};
use crate::patterns::bulkhead::BulkheadConfig;
use crate::patterns::circuit_breaker::CircuitBreakerConfig;
use crate::patterns::rate_limiter::RateLimiterConfig;
use crate::patterns::retry::{Backoff, RetryConfig};

/// Stages of one chain; a missing stage is skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Concurrency gate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    /// Permit budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Failure isolation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Re-attempts of the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Time limit for each attempt
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde::option"
    )]
    pub timeout: Option<Duration>,
}

impl PolicyConfig {
    /// Every stage with its default settings
    #[must_use]
    pub fn full() -> Self {
        Self {
            bulkhead: Some(BulkheadConfig::default()),
            rate_limiter: Some(RateLimiterConfig::default()),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            retry: Some(RetryConfig::default()),
            timeout: None,
        }
    }

    /// Add a bulkhead
    #[must_use]
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Add a rate limiter
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    /// Add a circuit breaker
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Add retry
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Add a per-attempt time limit
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ResilienceConfig for PolicyConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(config) = &self.bulkhead {
            config.validate()?;
        }
        if let Some(config) = &self.rate_limiter {
            config.validate()?;
        }
        if let Some(config) = &self.circuit_breaker {
            config.validate()?;
        }
        if let Some(config) = &self.retry {
            config.validate()?;
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::validation("timeout must be greater than 0"));
        }
        Ok(())
    }

    fn default_config() -> Self {
        Self::full()
    }
}

/// Policies by protected name plus the fallback for unknown names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySet {
    /// Used for names not listed in `policies`
    #[serde(default = "PolicyConfig::full")]
    pub defaults: PolicyConfig,
    /// Per-name policies
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            defaults: PolicyConfig::full(),
            policies: BTreeMap::new(),
        }
    }
}

impl PolicySet {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let set: Self = serde_json::from_str(json)?;
        set.validate()?;
        Ok(set)
    }

    /// Read, parse and validate a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Add or replace a named policy
    #[must_use]
    pub fn with_policy(mut self, name: impl Into<String>, config: PolicyConfig) -> Self {
        self.policies.insert(name.into(), config);
        self
    }

    /// Configuration for `name`
    pub fn resolve(&self, name: &str) -> &PolicyConfig {
        self.policies.get(name).unwrap_or(&self.defaults)
    }

    /// Policies of the demo backend service
    ///
    /// - `backendB`: breaker and retry
    /// - `rateLimiterB`: 10 calls per second
    /// - `timeoutBreaker`: breaker with slow-call detection behind a 2s
    ///   time limit
    /// - `timelimiterB`: 2s time limit
    /// - `bhX`, `bhY`: independently sized bulkheads
    #[must_use]
    pub fn demo() -> Self {
        let backend_breaker = CircuitBreakerConfig::default()
            .with_failure_rate_threshold(0.5)
            .with_window(10, 5)
            .with_wait_duration(Duration::from_secs(10));

        Self::default()
            .with_policy(
                "backendB",
                PolicyConfig::default()
                    .with_circuit_breaker(backend_breaker)
                    .with_retry(RetryConfig {
                        max_attempts: 3,
                        backoff: Backoff::Fixed {
                            delay: Duration::from_millis(500),
                        },
                        ..RetryConfig::default()
                    }),
            )
            .with_policy(
                "timeoutBreaker",
                PolicyConfig::default()
                    .with_circuit_breaker(
                        CircuitBreakerConfig::default()
                            .with_window(10, 5)
                            .with_wait_duration(Duration::from_secs(10))
                            .with_slow_calls(Duration::from_secs(1), 0.5),
                    )
                    .with_timeout(Duration::from_secs(2)),
            )
            .with_policy(
                "rateLimiterB",
                PolicyConfig::default()
                    .with_rate_limiter(RateLimiterConfig::new(10, Duration::from_secs(1))),
            )
            .with_policy(
                "timelimiterB",
                PolicyConfig::default().with_timeout(Duration::from_secs(2)),
            )
            .with_policy(
                "bhX",
                PolicyConfig::default()
                    .with_bulkhead(BulkheadConfig::new(2, Duration::from_millis(500))),
            )
            .with_policy(
                "bhY",
                PolicyConfig::default().with_bulkhead(BulkheadConfig::new(5, Duration::ZERO)),
            )
    }

    /// Validate defaults and every named policy
    pub fn validate(&self) -> ConfigResult<()> {
        self.defaults.validate().map_err(|e| e.in_policy("defaults"))?;
        for (name, config) in &self.policies {
            if name.is_empty() {
                return Err(ConfigError::validation("policy name cannot be empty"));
            }
            config.validate().map_err(|e| e.in_policy(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn unknown_names_get_defaults() {
        let set = PolicySet::demo();
        assert_eq!(set.resolve("nobody"), &PolicyConfig::full());
        assert!(set.resolve("bhX").circuit_breaker.is_none());
        assert_eq!(set.resolve("timelimiterB").timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn demo_is_valid() {
        PolicySet::demo().validate().unwrap();
    }

    #[test]
    fn parses_json_document() {
        let set = PolicySet::from_json_str(
            r#"{
                "policies": {
                    "limited": { "rateLimiter": { "limitForPeriod": 5, "refreshPeriod": "1s" } },
                    "slow": { "circuitBreaker": { "slowCallDurationThreshold": "1s" }, "timeout": "2s" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(set.defaults, PolicyConfig::full());
        let limited = set.resolve("limited");
        assert_eq!(
            limited.rate_limiter,
            Some(RateLimiterConfig::new(5, Duration::from_secs(1)))
        );
        assert!(limited.retry.is_none());
        assert_eq!(set.resolve("slow").timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn invalid_policy_is_named_in_error() {
        let err = PolicySet::from_json_str(
            r#"{ "policies": { "bhX": { "bulkhead": { "maxConcurrentCalls": 0 } } } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("policy 'bhX'"), "{err}");
    }

    #[test]
    fn short_key_names_are_accepted() {
        let set = PolicySet::from_json_str(
            r#"{
                "policies": {
                    "flaky": {
                        "circuitBreaker": { "failureThreshold": 0.2, "minSamples": 4 },
                        "bulkhead": { "maxConcurrent": 2 }
                    }
                }
            }"#,
        )
        .unwrap();
        let flaky = set.resolve("flaky");
        let breaker = flaky.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_rate_threshold, 0.2);
        assert_eq!(breaker.minimum_number_of_calls, 4);
        assert_eq!(flaky.bulkhead.as_ref().unwrap().max_concurrent_calls, 2);
    }

    #[test]
    fn misspelt_keys_are_rejected() {
        for json in [
            r#"{ "policies": { "flaky": { "circuitBreaker": { "failureTreshold": 0.2 } } } }"#,
            r#"{ "policies": { "flaky": { "bulkhead": { "maxConcurent": 2 } } } }"#,
            r#"{ "policies": { "flaky": { "rateLimiter": { "limit": 5 } } } }"#,
            r#"{ "policies": { "flaky": { "retry": { "attempts": 5 } } } }"#,
            r#"{ "policies": { "flaky": { "circuitbreaker": {} } } }"#,
            r#"{ "policy": { "flaky": {} } }"#,
        ] {
            let err = PolicySet::from_json_str(json).unwrap_err();
            assert!(matches!(err, ConfigError::Parse(_)), "{json}: {err}");
        }
    }

    #[test]
    fn demo_keeps_flaky_backend_unthrottled() {
        let set = PolicySet::demo();
        let backend = set.resolve("backendB");
        assert!(backend.rate_limiter.is_none());
        assert!(backend.circuit_breaker.is_some());
        assert!(backend.retry.is_some());
        assert_eq!(
            set.resolve("rateLimiterB"),
            &PolicyConfig::default()
                .with_rate_limiter(RateLimiterConfig::new(10, Duration::from_secs(1)))
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = PolicySet::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn round_trips_through_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string_pretty(&PolicySet::demo()).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        assert_eq!(PolicySet::from_path(file.path()).unwrap(), PolicySet::demo());

        let missing = PolicySet::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
