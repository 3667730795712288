#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Errors reported by a store. Payloads are plain strings so the error can be
/// cloned into statuses and carried across threads or an RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency collision; the caller may re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Validation or transport failure. Never retried.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}
