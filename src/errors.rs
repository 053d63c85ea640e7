//! Crate-wide error types for the durable-storage and proxy-allocation layers.
//!
//! `BrowserError` (browser/errors.rs) is deliberately kept separate: it never
//! crosses the Worker/Instance boundary, while these do.

use thiserror::Error;

/// Failures from the Vote Log or Session Store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("storage unavailable after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

/// Failures from the Proxy Allocator.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy allocator not configured")]
    NotConfigured,

    #[error("external allocation request failed: {0}")]
    AllocationFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
