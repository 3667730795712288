//! Garbage-collection predicates for kinds that are deleted by absence.
//!
//! A remote candidate is deleted only when all three hold:
//! 1. it references the owning entity (kind-specific check)
//! 2. it has no owner references, or the owner is among them
//! 3. its name is not among the currently declared items
//!
//! (3) is what makes a rename delete the old name and create the new one in
//! the same apply.

use std::collections::BTreeSet;
use std::sync::Arc;

use keel_core::{KnownKind, Resource, Selector, TypeMeta};

use crate::operator::{Collector, GcPhase};
use crate::ReconcileError;

/// Decides whether an orphaned remote resource should be deleted.
pub type Predicate = Arc<dyn Fn(&Resource) -> Result<bool, ReconcileError> + Send + Sync>;

/// Kind-specific "does this candidate point at the owner" check.
pub type References = Arc<dyn Fn(&Resource, &OwnerIdentity) -> Result<bool, ReconcileError> + Send + Sync>;

/// The entity whose sub-resources are being collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub types: TypeMeta,
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

impl OwnerIdentity {
    pub fn from_resource(owner: &Resource, default_namespace: &str) -> Self {
        Self {
            types: owner.types.clone(),
            name: owner.name().to_string(),
            namespace: owner.namespace().unwrap_or(default_namespace).to_string(),
            uid: owner.uid().map(|s| s.to_string()),
        }
    }
}

/// Combine the three checks into one predicate over `declared`.
pub fn build(owner: OwnerIdentity, declared: &[Resource], references: References) -> Predicate {
    let declared: BTreeSet<String> = declared.iter().map(|r| r.name().to_string()).collect();
    Arc::new(move |candidate: &Resource| -> Result<bool, ReconcileError> {
        if declared.contains(candidate.name()) {
            return Ok(false);
        }
        if !references(candidate, &owner)? {
            return Ok(false);
        }
        let owned = candidate.owner_references().is_empty()
            || candidate.is_owned_by(&owner.types, &owner.name, owner.uid.as_deref());
        Ok(owned)
    })
}

/// `spec.<field>.ref` names the owner. Missing kind / namespace on the ref
/// are treated as matching.
pub fn references_ref(field: &'static str) -> References {
    Arc::new(move |candidate: &Resource, owner: &OwnerIdentity| -> Result<bool, ReconcileError> {
        Ok(ref_matches(candidate, field, owner))
    })
}

fn ref_matches(candidate: &Resource, field: &str, owner: &OwnerIdentity) -> bool {
    let Some(r) = candidate.get_path(&["spec", field, "ref"]) else { return false };
    let name_ok = r.get("name").and_then(|v| v.as_str()) == Some(owner.name.as_str());
    let kind_ok = r.get("kind").and_then(|v| v.as_str()).map_or(true, |k| k == owner.types.kind);
    let ns_ok = r.get("namespace").and_then(|v| v.as_str()).map_or(true, |ns| ns == owner.namespace);
    name_ok && kind_ok && ns_ok
}

/// Subscriptions point at their owner either by `spec.subscriber.ref` or by a
/// computed sink URI following the cluster-local service convention
/// (`http://{name}.{namespace}.svc.cluster.local`).
pub fn references_sink() -> References {
    Arc::new(|candidate: &Resource, owner: &OwnerIdentity| -> Result<bool, ReconcileError> {
        if ref_matches(candidate, "subscriber", owner) {
            return Ok(true);
        }
        match candidate.get_str(&["spec", "subscriber", "uri"]) {
            Some(uri) => {
                let host = sink_host(uri)?;
                Ok(host == expected_sink_host(owner) || host == short_sink_host(owner))
            }
            None => Ok(false),
        }
    })
}

fn expected_sink_host(owner: &OwnerIdentity) -> String {
    format!("{}.{}.svc.cluster.local", owner.name, owner.namespace)
}

fn short_sink_host(owner: &OwnerIdentity) -> String {
    format!("{}.{}.svc", owner.name, owner.namespace)
}

/// Host part of an http(s) URI; port, path and query are dropped.
fn sink_host(uri: &str) -> Result<&str, ReconcileError> {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
        .ok_or_else(|| ReconcileError::Predicate(format!("malformed subscriber uri: {}", uri)))?;
    let end = rest.find(|c: char| c == '/' || c == ':' || c == '?').unwrap_or(rest.len());
    let host = &rest[..end];
    if host.is_empty() {
        return Err(ReconcileError::Predicate(format!("subscriber uri without host: {}", uri)));
    }
    Ok(host)
}

/// Kind-specific predicate, or `None` for kinds that are never collected.
pub fn predicate_for(kind: &KnownKind, owner: OwnerIdentity, declared: &[Resource]) -> Option<Predicate> {
    let references = match kind {
        KnownKind::Subscription => references_sink(),
        KnownKind::Trigger => references_ref("subscriber"),
        KnownKind::RuleBinding => references_ref("target"),
        KnownKind::Other(_) => return None,
    };
    Some(build(owner, declared, references))
}

/// Collector for `kind`, if it supports deletion by absence.
pub fn collector_for(kind: &TypeMeta, owner: OwnerIdentity, declared: &[Resource], selector: Selector) -> Option<Collector> {
    let predicate = predicate_for(&KnownKind::from(kind), owner, declared)?;
    Some(Collector { kind: kind.clone(), selector, predicate, phase: GcPhase::BeforeApply })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::OwnerReference;
    use serde_json::json;

    fn owner() -> OwnerIdentity {
        OwnerIdentity {
            types: TypeMeta::new("serving.knative.dev/v1", "Service"),
            name: "svc".into(),
            namespace: "ns".into(),
            uid: Some("owner-uid".into()),
        }
    }

    fn trigger(name: &str, target: &str) -> Resource {
        Resource::new(&TypeMeta::new("eventing.knative.dev/v1", "Trigger"), name)
            .with("spec", json!({ "broker": "default", "subscriber": { "ref": { "kind": "Service", "name": target } } }))
    }

    #[test]
    fn flags_only_undeclared_references() {
        let declared = vec![trigger("a", "svc"), trigger("b", "svc")];
        let pred = predicate_for(&KnownKind::Trigger, owner(), &declared).unwrap();
        let remote = [trigger("a", "svc"), trigger("b", "svc"), trigger("c", "svc")];
        let flagged: Vec<&str> = remote.iter().filter(|r| pred(*r).unwrap()).map(|r| r.name()).collect();
        assert_eq!(flagged, vec!["c"]);
    }

    #[test]
    fn foreign_references_and_owners_are_left_alone() {
        let pred = predicate_for(&KnownKind::Trigger, owner(), &[]).unwrap();
        assert!(!pred(&trigger("x", "other-svc")).unwrap());

        let mut owned_elsewhere = trigger("y", "svc");
        owned_elsewhere.stamp_owner_references(&[OwnerReference {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "cm".into(),
            uid: "someone-else".into(),
            ..Default::default()
        }]);
        assert!(!pred(&owned_elsewhere).unwrap());

        let mut owned_here = trigger("z", "svc");
        owned_here.stamp_owner_references(&[OwnerReference {
            api_version: "serving.knative.dev/v1".into(),
            kind: "Service".into(),
            name: "svc".into(),
            uid: "owner-uid".into(),
            ..Default::default()
        }]);
        assert!(pred(&owned_here).unwrap());
    }

    #[test]
    fn subscriptions_match_by_computed_sink() {
        let kind = TypeMeta::new("messaging.knative.dev/v1", "Subscription");
        let sub = |name: &str, uri: &str| {
            Resource::new(&kind, name).with("spec", json!({ "channel": { "name": "ch" }, "subscriber": { "uri": uri } }))
        };
        let pred = predicate_for(&KnownKind::Subscription, owner(), &[]).unwrap();
        assert!(pred(&sub("s1", "http://svc.ns.svc.cluster.local")).unwrap());
        assert!(pred(&sub("s2", "http://svc.ns.svc.cluster.local:8080/events")).unwrap());
        assert!(pred(&sub("s3", "https://svc.ns.svc/")).unwrap());
        assert!(!pred(&sub("s4", "http://svc.other.svc.cluster.local")).unwrap());

        let err = pred(&sub("s5", "svc.ns")).unwrap_err();
        assert!(matches!(err, ReconcileError::Predicate(_)));
    }

    #[test]
    fn rule_bindings_follow_target_and_other_kinds_have_no_predicate() {
        let rb = Resource::new(&TypeMeta::new("flow.example.dev/v1", "RuleBinding"), "rb")
            .with("spec", json!({ "target": { "ref": { "name": "svc" } } }));
        let pred = predicate_for(&KnownKind::RuleBinding, owner(), &[]).unwrap();
        assert!(pred(&rb).unwrap());

        let cm = TypeMeta::new("v1", "ConfigMap");
        assert!(predicate_for(&KnownKind::from(&cm), owner(), &[]).is_none());
        assert!(collector_for(&cm, owner(), &[], Selector::everything()).is_none());
    }
}
