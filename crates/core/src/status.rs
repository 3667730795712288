//! Per-resource outcome reporting.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{OwnerReference, Resource};

/// What happened to one resource during one apply/delete call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    /// The observed payload already satisfied the desired one.
    Skipped,
    Failed,
    Deleted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
            Outcome::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Outcome plus the resource it applies to. For `Failed` the resource is the
/// one that was attempted, not what exists remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub outcome: Outcome,
    pub resource: Resource,
}

impl Status {
    pub fn new(outcome: Outcome, resource: Resource) -> Self { Self { outcome, resource } }

    pub fn is_failed(&self) -> bool { self.outcome == Outcome::Failed }

    /// Ownership identifier for children of this resource. Only resources that
    /// exist in the store after an apply (`Created`, `Updated`, `Skipped`) and
    /// carry a uid qualify; deletions and failures never own anything.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        match self.outcome {
            Outcome::Created | Outcome::Updated | Outcome::Skipped => OwnerReference::from_resource(&self.resource),
            Outcome::Failed | Outcome::Deleted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypeMeta;

    #[test]
    fn only_applied_statuses_yield_an_owner_reference() {
        let mut r = Resource::new(&TypeMeta::new("serving.knative.dev/v1", "Service"), "svc");
        r.metadata.uid = Some("abc".into());

        let ok = Status::new(Outcome::Skipped, r.clone());
        let owner = ok.owner_reference().unwrap();
        assert_eq!(owner.uid, "abc");
        assert_eq!(owner.kind, "Service");
        assert_eq!(owner.api_version, "serving.knative.dev/v1");
        assert_eq!(owner.name, "svc");

        assert!(Status::new(Outcome::Updated, r.clone()).owner_reference().is_some());
        assert!(Status::new(Outcome::Failed, r.clone()).owner_reference().is_none());
        assert!(Status::new(Outcome::Deleted, r.clone()).owner_reference().is_none());

        r.metadata.uid = None;
        assert!(Status::new(Outcome::Created, r).owner_reference().is_none());
    }

    #[test]
    fn outcome_displays_lowercase() {
        assert_eq!(Outcome::Created.to_string(), "created");
        assert_eq!(serde_json::to_string(&Outcome::Deleted).unwrap(), "\"deleted\"");
    }
}
