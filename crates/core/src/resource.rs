//! Generic resource document.
//!
//! A `Resource` has three zones:
//! - identity: type descriptor, name, namespace, store-assigned uid
//! - relationships: labels and owner references
//! - payload: every other top-level field (`spec`, `data`, ...) plus the
//!   observed `status`, which the engine never writes

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{derivative_equal, StoreError, TypeMeta};

/// Back-reference from a child resource to the resource that owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Copy the identity of `owner`. Returns `None` until the store has assigned a uid.
    pub fn from_resource(owner: &Resource) -> Option<Self> {
        let uid = owner.metadata.uid.clone()?;
        Some(Self {
            api_version: owner.types.api_version.clone(),
            kind: owner.types.kind.clone(),
            name: owner.metadata.name.clone(),
            uid,
            controller: None,
            block_owner_deletion: None,
        })
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta::new(self.api_version.clone(), self.kind.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Server-populated metadata we carry but never interpret
    /// (generation, creationTimestamp, managedFields, ...).
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    #[serde(flatten)]
    pub types: TypeMeta,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
    #[serde(flatten)]
    pub payload: Map<String, Json>,
}

impl Resource {
    pub fn new(types: &TypeMeta, name: impl Into<String>) -> Self {
        Self {
            types: types.clone(),
            metadata: ObjectMeta { name: name.into(), ..Default::default() },
            status: None,
            payload: Map::new(),
        }
    }

    /// Builder helper: set one top-level payload field.
    pub fn with(mut self, field: &str, value: Json) -> Self {
        self.payload.insert(field.to_string(), value);
        self
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Parse a raw JSON document, rejecting anything without identity.
    pub fn from_value(raw: Json) -> Result<Self, StoreError> {
        let res: Resource = serde_json::from_value(raw)
            .map_err(|e| StoreError::Invalid(format!("decoding resource: {}", e)))?;
        if res.types.api_version.is_empty() {
            return Err(StoreError::Invalid("resource missing apiVersion".into()));
        }
        if res.types.kind.is_empty() {
            return Err(StoreError::Invalid("resource missing kind".into()));
        }
        if res.metadata.name.is_empty() {
            return Err(StoreError::Invalid("resource missing metadata.name".into()));
        }
        Ok(res)
    }

    pub fn to_value(&self) -> Result<Json, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Invalid(format!("encoding resource: {}", e)))
    }

    pub fn type_meta(&self) -> &TypeMeta { &self.types }
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }
    pub fn uid(&self) -> Option<&str> { self.metadata.uid.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }
    pub fn owner_references(&self) -> &[OwnerReference] { &self.metadata.owner_references }
    pub fn labels(&self) -> &BTreeMap<String, String> { &self.metadata.labels }

    /// Stamp owner references: an existing reference with the same uid is
    /// replaced in place, new ones are appended.
    pub fn stamp_owner_references(&mut self, refs: &[OwnerReference]) {
        for r in refs {
            match self.metadata.owner_references.iter_mut().find(|o| o.uid == r.uid) {
                Some(slot) => *slot = r.clone(),
                None => self.metadata.owner_references.push(r.clone()),
            }
        }
    }

    pub fn merge_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.metadata.labels.insert(k.clone(), v.clone());
        }
    }

    /// True when `owner` is among this resource's owner references.
    /// Matches by uid when both sides have one, by kind + name otherwise.
    pub fn is_owned_by(&self, kind: &TypeMeta, name: &str, uid: Option<&str>) -> bool {
        self.metadata.owner_references.iter().any(|o| match uid {
            Some(u) => o.uid == u,
            None => o.kind == kind.kind && o.api_version == kind.api_version && o.name == name,
        })
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Json> {
        let (first, rest) = path.split_first()?;
        let mut cur = if *first == "status" { self.status.as_ref()? } else { self.payload.get(*first)? };
        for seg in rest {
            cur = cur.get(*seg)?;
        }
        Some(cur)
    }

    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get_path(path).and_then(|v| v.as_str())
    }

    /// Set a nested payload field, creating intermediate objects. Writing under
    /// `status` is refused; observed state belongs to the store.
    pub fn set_path(&mut self, path: &[&str], value: Json) -> Result<(), StoreError> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| StoreError::Invalid("empty field path".into()))?;
        if path.first() == Some(&"status") {
            return Err(StoreError::Invalid("status is observed state and cannot be written".into()));
        }
        let mut cur = &mut self.payload;
        for seg in parents {
            let slot = cur.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
            if !slot.is_object() {
                *slot = Json::Object(Map::new());
            }
            cur = match slot {
                Json::Object(m) => m,
                _ => return Err(StoreError::Invalid(format!("field {} is not an object", seg))),
            };
        }
        cur.insert(last.to_string(), value);
        Ok(())
    }

    /// Copy the desired payload and relationships onto this (observed) copy.
    /// Identity and status stay as the store reported them.
    pub fn adopt_desired(&mut self, desired: &Resource) {
        for (k, v) in &desired.payload {
            self.payload.insert(k.clone(), v.clone());
        }
        self.merge_labels(&desired.metadata.labels);
        for (k, v) in &desired.metadata.annotations {
            self.metadata.annotations.insert(k.clone(), v.clone());
        }
        self.stamp_owner_references(&desired.metadata.owner_references);
    }

    /// One-directional convergence test: everything `self` (desired) declares
    /// is already present and equal in `observed`.
    pub fn is_satisfied_by(&self, observed: &Resource) -> bool {
        let labels_ok = self.metadata.labels.iter().all(|(k, v)| observed.metadata.labels.get(k) == Some(v));
        let annos_ok = self
            .metadata
            .annotations
            .iter()
            .all(|(k, v)| observed.metadata.annotations.get(k) == Some(v));
        let owners_ok = self
            .metadata
            .owner_references
            .iter()
            .all(|o| observed.metadata.owner_references.iter().any(|x| x.uid == o.uid));
        labels_ok
            && annos_ok
            && owners_ok
            && derivative_equal(&Json::Object(self.payload.clone()), &Json::Object(observed.payload.clone()))
    }

    /// Status of the `Ready` condition, if the store reports one.
    pub fn ready_condition(&self) -> Option<(bool, Option<String>)> {
        let conds = self.status.as_ref()?.get("conditions")?.as_array()?;
        let ready = conds.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))?;
        let status = ready.get("status").and_then(|s| s.as_str())?;
        let reason = ready
            .get("message")
            .or_else(|| ready.get("reason"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
        match status {
            "True" => Some((true, reason)),
            "False" => Some((false, reason)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> Resource {
        Resource::new(&TypeMeta::new("v1", "ConfigMap"), name)
    }

    #[test]
    fn decodes_zones_from_raw_json() {
        let raw = json!({
            "apiVersion": "eventing.knative.dev/v1",
            "kind": "Trigger",
            "metadata": {
                "name": "t1",
                "namespace": "ns",
                "uid": "u-1",
                "resourceVersion": "7",
                "generation": 2,
                "labels": { "app": "x" },
                "ownerReferences": [ { "apiVersion": "v1", "kind": "Service", "name": "svc", "uid": "u-0" } ]
            },
            "spec": { "broker": "default" },
            "status": { "observedGeneration": 2 }
        });
        let r = Resource::from_value(raw).unwrap();
        assert_eq!(r.type_meta().kind, "Trigger");
        assert_eq!(r.name(), "t1");
        assert_eq!(r.namespace(), Some("ns"));
        assert_eq!(r.uid(), Some("u-1"));
        assert_eq!(r.resource_version(), Some("7"));
        assert_eq!(r.owner_references().len(), 1);
        assert_eq!(r.metadata.extra.get("generation"), Some(&json!(2)));
        assert_eq!(r.payload.get("spec"), Some(&json!({ "broker": "default" })));
        assert!(!r.payload.contains_key("status"));
        assert!(!r.payload.contains_key("kind"));
        assert_eq!(r.get_path(&["status", "observedGeneration"]), Some(&json!(2)));

        let back = r.to_value().unwrap();
        assert_eq!(back["metadata"]["generation"], json!(2));
        assert_eq!(back["apiVersion"], json!("eventing.knative.dev/v1"));
    }

    #[test]
    fn from_value_requires_identity() {
        let e = Resource::from_value(json!({ "kind": "X", "metadata": { "name": "a" } })).unwrap_err();
        assert!(e.to_string().contains("apiVersion"), "{}", e);
        let e = Resource::from_value(json!({ "apiVersion": "v1", "kind": "X", "metadata": { "name": "" } })).unwrap_err();
        assert!(e.to_string().contains("metadata.name"), "{}", e);
    }

    #[test]
    fn set_path_creates_parents_and_refuses_status() {
        let mut r = cm("a");
        r.set_path(&["spec", "sink", "uri"], json!("http://x")).unwrap();
        assert_eq!(r.get_str(&["spec", "sink", "uri"]), Some("http://x"));
        assert!(r.set_path(&["status", "ready"], json!(true)).is_err());
        assert!(r.set_path(&[], json!(1)).is_err());
    }

    #[test]
    fn stamping_replaces_by_uid() {
        let mut r = cm("a");
        let o1 = OwnerReference { api_version: "v1".into(), kind: "Service".into(), name: "s".into(), uid: "1".into(), ..Default::default() };
        let mut o1b = o1.clone();
        o1b.name = "renamed".into();
        let o2 = OwnerReference { uid: "2".into(), ..o1.clone() };
        r.stamp_owner_references(&[o1, o2]);
        r.stamp_owner_references(&[o1b]);
        assert_eq!(r.owner_references().len(), 2);
        assert_eq!(r.owner_references()[0].name, "renamed");
    }

    #[test]
    fn adopt_keeps_identity_and_status() {
        let mut observed = cm("a").with("data", json!({ "k": "old", "gen": "server" }));
        observed.metadata.uid = Some("u".into());
        observed.metadata.resource_version = Some("3".into());
        observed.status = Some(json!({ "x": 1 }));
        let desired = cm("a").with("data", json!({ "k": "new" }));

        assert!(!desired.is_satisfied_by(&observed));
        observed.adopt_desired(&desired);
        assert_eq!(observed.uid(), Some("u"));
        assert_eq!(observed.resource_version(), Some("3"));
        assert_eq!(observed.status, Some(json!({ "x": 1 })));
        assert_eq!(observed.payload["data"], json!({ "k": "new" }));
        assert!(desired.is_satisfied_by(&observed));
    }

    #[test]
    fn ready_condition_reads_status() {
        let mut r = cm("a");
        assert_eq!(r.ready_condition(), None);
        r.status = Some(json!({ "conditions": [ { "type": "Ready", "status": "False", "message": "no sink" } ] }));
        assert_eq!(r.ready_condition(), Some((false, Some("no sink".into()))));
        r.status = Some(json!({ "conditions": [ { "type": "Ready", "status": "True" } ] }));
        assert_eq!(r.ready_condition(), Some((true, None)));
    }
}
