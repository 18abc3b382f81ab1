// crates/resilience/src/validation.rs
//! Validation helpers shared by the guard configurations
//!
//! Each check names the policy and field it inspects, so a failing config
//! reports exactly which field is wrong and why.

use crate::error::{ResilienceError, ResilienceResult};
use std::time::Duration;

/// Implemented by every guard configuration
pub trait PolicyConfig: Default {
    /// Name reported in `InvalidPolicy` errors
    fn policy_name(&self) -> &str;

    fn validate(&self) -> ResilienceResult<()>;
}

/// Common validators for config values
pub struct Validator;

impl Validator {
    /// Fails unless the count is greater than zero
    pub fn positive<T>(value: T, policy: &str, field: &str) -> ResilienceResult<()>
    where
        T: PartialOrd + Default + std::fmt::Display,
    {
        if value > T::default() {
            Ok(())
        } else {
            Err(ResilienceError::invalid_policy(
                policy,
                field,
                format!("must be positive (got: {})", value),
            ))
        }
    }

    /// Fails on a zero duration
    pub fn positive_duration(value: Duration, policy: &str, field: &str) -> ResilienceResult<()> {
        if value.is_zero() {
            Err(ResilienceError::invalid_policy(
                policy,
                field,
                "must be a positive duration",
            ))
        } else {
            Ok(())
        }
    }

    /// Fails if `value` is below `min`
    pub fn at_least<T>(value: T, min: T, policy: &str, field: &str) -> ResilienceResult<()>
    where
        T: PartialOrd + std::fmt::Debug,
    {
        if value < min {
            Err(ResilienceError::invalid_policy(
                policy,
                field,
                format!("must be at least {:?} (got: {:?})", min, value),
            ))
        } else {
            Ok(())
        }
    }

    /// Fails if `value` is above `max`
    pub fn at_most<T>(value: T, max: T, policy: &str, field: &str) -> ResilienceResult<()>
    where
        T: PartialOrd + std::fmt::Debug,
    {
        if value > max {
            Err(ResilienceError::invalid_policy(
                policy,
                field,
                format!("must be at most {:?} (got: {:?})", max, value),
            ))
        } else {
            Ok(())
        }
    }

    /// Fails unless `min <= value <= max`; NaN always fails
    pub fn in_range(value: f64, min: f64, max: f64, policy: &str, field: &str) -> ResilienceResult<()> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(ResilienceError::invalid_policy(
                policy,
                field,
                format!("must be between {} and {} (got: {})", min, max, value),
            ))
        }
    }

    /// Fails on an empty or whitespace-only string
    pub fn not_empty(value: &str, policy: &str, field: &str) -> ResilienceResult<()> {
        if value.trim().is_empty() {
            Err(ResilienceError::invalid_policy(policy, field, "must not be empty"))
        } else {
            Ok(())
        }
    }
}
