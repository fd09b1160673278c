//! Shared contract for external capabilities (vision, stylization).
//!
//! Every capability call is synchronous from the engine's point of view and
//! bounded by a declared timeout. Callers distinguish a known outage
//! (`Unavailable`, which selects a degraded path) from a transient failure of
//! a reachable service (`Transient`, which is retried).

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} is unavailable: {reason}")]
    Unavailable { capability: String, reason: String },

    #[error("{capability} failed: {reason}")]
    Transient { capability: String, reason: String },

    #[error("{capability} timed out after {timeout:?}")]
    TimedOut {
        capability: String,
        timeout: Duration,
    },
}

impl CapabilityError {
    pub fn unavailable(capability: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            capability: capability.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transient(capability: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            capability: capability.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CapabilityError::Unavailable { .. })
    }

    /// Classify an HTTP client failure.
    pub fn from_http(capability: &str, err: &reqwest::Error) -> Self {
        let unreachable = err.is_connect()
            || err
                .status()
                .map(|s| s == reqwest::StatusCode::SERVICE_UNAVAILABLE)
                .unwrap_or(false);
        if unreachable {
            Self::unavailable(capability, err.to_string())
        } else {
            Self::transient(capability, err.to_string())
        }
    }
}

/// Run a capability call under its declared timeout.
pub async fn call_with_timeout<T, F>(
    capability: &str,
    timeout: Duration,
    call: F,
) -> Result<T, CapabilityError>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::TimedOut {
            capability: capability.to_string(),
            timeout,
        }),
    }
}
