//! Keel store contract: the one collaborator the reconcile engine talks to.
//!
//! A store persists resources of many kinds inside a single namespace and
//! reports on them. It owns serialization, transport and authentication; the
//! engine only sees `Resource` documents and `StoreError`s.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use keel_core::{Resource, Selector, StoreError, TypeMeta};
use serde::{Deserialize, Serialize};

mod memory;

pub use memory::{Call, MemoryStore, Op};

/// Change notification from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
}

impl WatchEvent {
    pub fn resource(&self) -> &Resource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Options for create/update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteParams {
    /// Validate without persisting.
    pub dry_run: bool,
}

impl WriteParams {
    pub fn dry_run(dry_run: bool) -> Self { Self { dry_run } }
}

/// What happens to dependents of a deleted resource.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CascadePolicy {
    /// Dependents are deleted before the owner disappears.
    Foreground,
    /// Owner goes first, dependents are collected afterwards.
    #[default]
    Background,
    /// Dependents stay; their owner references are dropped.
    Orphan,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteParams {
    pub dry_run: bool,
    pub cascade: CascadePolicy,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Namespace this store is scoped to.
    fn namespace(&self) -> &str;

    async fn get(&self, kind: &TypeMeta, name: &str) -> Result<Resource, StoreError>;

    async fn create(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError>;

    /// Replace an existing resource. A stale `resourceVersion` yields `StoreError::Conflict`.
    async fn update(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError>;

    async fn delete(&self, kind: &TypeMeta, name: &str, params: &DeleteParams) -> Result<(), StoreError>;

    async fn list(&self, kind: &TypeMeta, selector: &Selector) -> Result<Vec<Resource>, StoreError>;

    async fn watch(&self, kind: &TypeMeta, selector: &Selector) -> Result<WatchStream, StoreError>;
}
