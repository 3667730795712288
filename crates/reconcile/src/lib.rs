//! Keel reconcile engine.
//!
//! - `Operator` converges one homogeneous list of resources against a `Store`
//! - `Manager` composes operators into a parent → children ownership forest,
//!   propagates owner references and rolls back on error
//! - `callback` runs pre/post hooks with panic containment
//! - `gc` builds the "delete by absence" predicates for kinds that support it
//!
//! Everything is call-and-return: items are processed strictly in order and
//! the only suspension points are store calls and the optional ready wait.

#![forbid(unsafe_code)]

use keel_core::StoreError;

pub mod callback;
pub mod config;
pub mod gc;
pub mod manager;
pub mod operator;

pub use callback::{Callback, Callbacks, Hook};
pub use config::{EngineConfig, RetryPolicy};
pub use gc::{OwnerIdentity, Predicate};
pub use manager::{ErrorPolicy, Manager, ManagerOptions};
pub use operator::{ApplyOptions, Collector, DeleteOptions, GcPhase, Operator};
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A pre/post hook rejected the operation (recovered panics included).
    #[error("callback: {0}")]
    Callback(String),
    #[error("wait timeout: {0}")]
    WaitTimeout(String),
    #[error("wait unexpected state: {0}")]
    WaitUnexpectedState(String),
    #[error("predicate: {0}")]
    Predicate(String),
    #[error("invalid resource: {0}")]
    InvalidResource(String),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::Store(e) if e.is_not_found()) }
    pub fn is_conflict(&self) -> bool { matches!(self, ReconcileError::Store(e) if e.is_conflict()) }
    pub fn is_cancelled(&self) -> bool { matches!(self, ReconcileError::Store(StoreError::Cancelled)) }
}
