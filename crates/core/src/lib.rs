//! Keel core types: resource documents, ownership references, outcomes and store errors.
//!
//! Everything here is plain data. The reconcile engine and the store
//! implementations agree on these shapes and nothing else.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod equality;
pub mod error;
pub mod resource;
pub mod status;

pub use equality::derivative_equal;
pub use error::StoreError;
pub use resource::{ObjectMeta, OwnerReference, Resource};
pub use status::{Outcome, Status};

pub mod prelude {
    pub use super::{
        derivative_equal, KnownKind, ObjectMeta, Outcome, OwnerReference, Resource, Selector,
        Status, StoreError, TypeMeta,
    };
}

/// Type descriptor of a resource (`apiVersion` + `kind`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

impl TypeMeta {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// API group; empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, v)) => v,
            None => &self.api_version,
        }
    }

    /// Stable key in the `v1/Kind` or `group/v1/Kind` form.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

impl fmt::Display for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Resource kinds the engine knows how to garbage-collect by absence.
/// Everything else is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownKind {
    Subscription,
    Trigger,
    RuleBinding,
    Other(TypeMeta),
}

impl From<&TypeMeta> for KnownKind {
    fn from(tm: &TypeMeta) -> Self {
        match (tm.group(), tm.kind.as_str()) {
            ("messaging.knative.dev", "Subscription") => KnownKind::Subscription,
            ("eventing.knative.dev", "Trigger") => KnownKind::Trigger,
            (_, "RuleBinding") => KnownKind::RuleBinding,
            _ => KnownKind::Other(tm.clone()),
        }
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    pub fn matches(&self, res: &Resource) -> bool {
        let have = &res.metadata.labels;
        self.labels.iter().all(|(k, v)| have.get(k) == Some(v))
    }

    /// Render as a Kubernetes label selector query (`k=v,k2=v2`).
    pub fn to_query(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_meta_splits_group_and_version() {
        let core = TypeMeta::new("v1", "ConfigMap");
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
        assert_eq!(core.key(), "v1/ConfigMap");

        let trig = TypeMeta::new("eventing.knative.dev/v1", "Trigger");
        assert_eq!(trig.group(), "eventing.knative.dev");
        assert_eq!(trig.version(), "v1");
        assert_eq!(KnownKind::from(&trig), KnownKind::Trigger);
        assert_eq!(KnownKind::from(&core), KnownKind::Other(core.clone()));
    }

    #[test]
    fn selector_matches_and_renders() {
        let sel = Selector::everything().with_label("app", "web").with_label("tier", "edge");
        assert_eq!(sel.to_query(), "app=web,tier=edge");

        let mut r = Resource::new(&TypeMeta::new("v1", "ConfigMap"), "a");
        assert!(!sel.matches(&r));
        r.metadata.labels.insert("app".into(), "web".into());
        r.metadata.labels.insert("tier".into(), "edge".into());
        r.metadata.labels.insert("extra".into(), "x".into());
        assert!(sel.matches(&r));
        assert!(Selector::everything().matches(&r));
    }
}
