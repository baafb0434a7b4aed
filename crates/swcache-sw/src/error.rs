//! Error types for the worker and its cache store.

use swcache_net::NetError;
use thiserror::Error;

/// Errors raised by a [`CacheStore`](crate::CacheStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Storage(#[from] StoreError),

    #[error("Install failed on {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not intercepted: {0} requests go straight to the network")]
    NotIntercepted(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ServiceWorkerError {
    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::Storage(_) => "storage",
            ServiceWorkerError::InstallFailed { .. } => "install",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::NotIntercepted(_) => "not_intercepted",
            ServiceWorkerError::InvalidMessage(_) => "invalid_message",
            ServiceWorkerError::InvalidUrl(_) => "invalid_url",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: ServiceWorkerError = StoreError::QuotaExceeded {
            needed: 10,
            quota: 5,
        }
        .into();
        assert_eq!(err.category(), "storage");
        assert_eq!(
            err.to_string(),
            "Cache error: Quota exceeded: 10 bytes needed, 5 allowed"
        );
    }

    #[test]
    fn test_network_error_converts() {
        let err: ServiceWorkerError = NetError::Offline("no route".into()).into();
        assert_eq!(err.category(), "network");
    }
}
