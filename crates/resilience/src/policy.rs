// crates/resilience/src/policy.rs
//! Resilience policy: the guard configuration for one dependency
//!
//! Every section is optional. Sections take the policy's name, so guards
//! built from a policy are all registered under the dependency they protect.

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use crate::validation::{PolicyConfig, Validator};
use serde::{Deserialize, Serialize};

fn default_version() -> u32 {
    1
}

/// Guard configuration for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimiterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
}

impl ResiliencePolicy {
    /// An empty policy at version 1
    pub fn new(name: impl Into<String>) -> ResilienceResult<Self> {
        let policy = Self {
            name: name.into(),
            version: default_version(),
            circuit_breaker: None,
            retry: None,
            timeout: None,
            rate_limit: None,
            bulkhead: None,
        };
        Validator::not_empty(&policy.name, "policy", "name")?;
        Ok(policy)
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_circuit_breaker(mut self, mut config: CircuitBreakerConfig) -> ResilienceResult<Self> {
        config.name = self.name.clone();
        config.validate()?;
        self.circuit_breaker = Some(config);
        Ok(self)
    }

    pub fn with_retry(mut self, mut config: RetryConfig) -> ResilienceResult<Self> {
        config.name = self.name.clone();
        config.validate()?;
        self.retry = Some(config);
        Ok(self)
    }

    pub fn with_timeout(mut self, mut config: TimeoutConfig) -> ResilienceResult<Self> {
        config.name = self.name.clone();
        config.validate()?;
        self.timeout = Some(config);
        Ok(self)
    }

    pub fn with_rate_limit(mut self, mut config: RateLimiterConfig) -> ResilienceResult<Self> {
        config.name = self.name.clone();
        config.validate()?;
        self.rate_limit = Some(config);
        Ok(self)
    }

    pub fn with_bulkhead(mut self, mut config: BulkheadConfig) -> ResilienceResult<Self> {
        config.name = self.name.clone();
        config.validate()?;
        self.bulkhead = Some(config);
        Ok(self)
    }

    /// Checks the name, the version and every configured section
    pub fn validate(&self) -> ResilienceResult<()> {
        Validator::not_empty(&self.name, "policy", "name")?;
        Validator::positive(self.version, "policy", "version")?;
        if let Some(config) = &self.circuit_breaker {
            config.validate()?;
        }
        if let Some(config) = &self.retry {
            config.validate()?;
        }
        if let Some(config) = &self.timeout {
            config.validate()?;
        }
        if let Some(config) = &self.rate_limit {
            config.validate()?;
        }
        if let Some(config) = &self.bulkhead {
            config.validate()?;
        }
        Ok(())
    }

    /// True if no section is configured
    pub fn is_empty(&self) -> bool {
        self.circuit_breaker.is_none()
            && self.retry.is_none()
            && self.timeout.is_none()
            && self.rate_limit.is_none()
            && self.bulkhead.is_none()
    }

    /// Parses a TOML document, names every section after the policy and
    /// validates the result
    pub fn from_toml_str(input: &str) -> ResilienceResult<Self> {
        let mut policy: Self = toml::from_str(input)
            .map_err(|e| ResilienceError::invalid_policy("policy", "toml", e.to_string()))?;
        policy.adopt_name();
        policy.validate()?;
        log::debug!(
            "Loaded resilience policy '{}' (version {})",
            policy.name,
            policy.version
        );
        Ok(policy)
    }

    pub fn to_toml_string(&self) -> ResilienceResult<String> {
        toml::to_string(self)
            .map_err(|e| ResilienceError::invalid_policy(self.name.clone(), "toml", e.to_string()))
    }

    fn adopt_name(&mut self) {
        let name = &self.name;
        if let Some(config) = &mut self.circuit_breaker {
            config.name = name.clone();
        }
        if let Some(config) = &mut self.retry {
            config.name = name.clone();
        }
        if let Some(config) = &mut self.timeout {
            config.name = name.clone();
        }
        if let Some(config) = &mut self.rate_limit {
            config.name = name.clone();
        }
        if let Some(config) = &mut self.bulkhead {
            config.name = name.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const POLICY: &str = r#"
name = "policy-store"
version = 2

[circuit_breaker]
failure_threshold = 3
timeout = 100

[retry]
max_attempts = 4
base_delay = 50
max_delay = 2000

[timeout]
default = 250
max = 1000

[timeout.per_operation]
evaluate = 500

[bulkhead]
max_concurrent = 4
queue_size = 0
"#;

    #[test]
    fn test_parse_toml_policy() {
        let policy = ResiliencePolicy::from_toml_str(POLICY).expect("policy parses");

        assert_eq!(policy.name, "policy-store");
        assert_eq!(policy.version, 2);

        let breaker = policy.circuit_breaker.as_ref().expect("breaker section");
        assert_eq!(breaker.name, "policy-store");
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.timeout, Duration::from_millis(100));
        assert_eq!(breaker.success_threshold, 2);

        let timeout = policy.timeout.as_ref().expect("timeout section");
        assert_eq!(timeout.per_operation["evaluate"], Duration::from_millis(500));

        assert_eq!(policy.bulkhead.as_ref().map(|b| b.queue_size), Some(0));
        assert!(policy.rate_limit.is_none());
    }

    #[test]
    fn test_invalid_section_rejected() {
        let input = r#"
name = "cache"

[retry]
base_delay = 500
max_delay = 100
"#;
        match ResiliencePolicy::from_toml_str(input) {
            Err(ResilienceError::InvalidPolicy { field, .. }) => assert_eq!(field, "max_delay"),
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_toml_rejected() {
        match ResiliencePolicy::from_toml_str("name = ") {
            Err(ResilienceError::InvalidPolicy { field, .. }) => assert_eq!(field, "toml"),
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
    }

    #[test]
    fn test_builder_names_sections() {
        let policy = ResiliencePolicy::new("mfa")
            .and_then(|p| p.with_rate_limit(RateLimiterConfig::default()))
            .and_then(|p| p.with_circuit_breaker(CircuitBreakerConfig::default()))
            .expect("valid policy");

        assert_eq!(policy.version, 1);
        assert_eq!(policy.rate_limit.as_ref().map(|c| c.name.as_str()), Some("mfa"));
        assert!(!policy.is_empty());
        assert!(ResiliencePolicy::new("").is_err());
    }

    #[test]
    fn test_toml_output_parses_back() {
        let policy = ResiliencePolicy::from_toml_str(POLICY).expect("policy parses");
        let rendered = policy.to_toml_string().expect("policy renders");
        assert_eq!(
            ResiliencePolicy::from_toml_str(&rendered).expect("rendered policy parses"),
            policy
        );
    }
}
