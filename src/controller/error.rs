//! Error types for the DatabaseCluster and OpsRequest controllers

use std::time::Duration;

use thiserror::Error;

use crate::delegate::DelegateError;

/// Error variants are named with the `Error` suffix (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    DelegateError(#[from] DelegateError),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::DelegateError(e) => e.is_retryable(),
            Error::ValidationError(_) | Error::SerializationError(_) => false,
        }
    }

    /// Whether the error only says that an object disappeared
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::DelegateError(DelegateError::ChildNotFound(_)) => true,
            Error::DelegateError(DelegateError::Kube(kube::Error::Api(api_err))) => {
                api_err.code == 404
            }
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based), jittered and capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delayed = (base + jitter).max(0.0);

        Duration::from_secs_f64(delayed.min(self.max_delay.as_secs_f64()))
    }

    /// Non-retryable errors wait the full `max_delay` so a fix can land first
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
