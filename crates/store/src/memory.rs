//! In-RAM store with optimistic concurrency, watch fan-out and fault injection.
//! Used by tests, demos and local dry runs; behaves like a single-namespace API server.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use keel_core::{Resource, Selector, StoreError, TypeMeta};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{CascadePolicy, DeleteParams, Store, WatchEvent, WatchStream, WriteParams};

const WATCH_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
    Watch,
}

/// One journaled store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: TypeMeta,
    pub name: String,
    pub dry_run: bool,
}

type Key = (TypeMeta, String);

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Key, Resource>,
    next_rv: u64,
    pending_conflicts: u32,
    pending_watch_errors: u32,
    failures: FxHashMap<(Op, String), StoreError>,
    journal: Vec<Call>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn record(&mut self, op: Op, kind: &TypeMeta, name: &str, dry_run: bool) -> Result<(), StoreError> {
        self.journal.push(Call { op, kind: kind.clone(), name: name.to_string(), dry_run });
        match self.failures.get(&(op, name.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub struct MemoryStore {
    namespace: String,
    inner: Mutex<Inner>,
    events: broadcast::Sender<(TypeMeta, WatchEvent)>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAP);
        Self { namespace: namespace.into(), inner: Mutex::new(Inner::default()), events }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, ev: WatchEvent) {
        let kind = ev.resource().types.clone();
        let _ = self.events.send((kind, ev));
    }

    /// Seed a resource directly, bypassing validation and fault injection.
    pub fn insert(&self, mut res: Resource) -> Resource {
        let mut inner = self.lock();
        res.metadata.namespace = Some(self.namespace.clone());
        if res.metadata.uid.is_none() {
            res.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        res.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert((res.types.clone(), res.metadata.name.clone()), res.clone());
        drop(inner);
        self.emit(WatchEvent::Added(res.clone()));
        res
    }

    /// Overwrite observed state, as a controller would.
    pub fn set_status(&self, kind: &TypeMeta, name: &str, status: serde_json::Value) -> Result<Resource, StoreError> {
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let obj = inner
            .objects
            .get_mut(&(kind.clone(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, name)))?;
        obj.status = Some(status);
        obj.metadata.resource_version = Some(rv);
        let out = obj.clone();
        drop(inner);
        self.emit(WatchEvent::Modified(out.clone()));
        Ok(out)
    }

    /// Fail the next `n` updates with a conflict, regardless of resourceVersion.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().pending_conflicts = n;
    }

    /// The next watch opened yields `n` lag errors before any event.
    pub fn inject_watch_errors(&self, n: u32) {
        self.lock().pending_watch_errors = n;
    }

    /// Make every `op` on `name` fail with `err` until cleared.
    pub fn fail_on(&self, op: Op, name: &str, err: StoreError) {
        self.lock().failures.insert((op, name.to_string()), err);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.pending_conflicts = 0;
        inner.pending_watch_errors = 0;
    }

    pub fn journal(&self) -> Vec<Call> { self.lock().journal.clone() }

    /// Number of journaled (non dry-run and dry-run) calls of `op` on `name`.
    pub fn count(&self, op: Op, name: &str) -> usize {
        self.lock().journal.iter().filter(|c| c.op == op && c.name == name).count()
    }

    pub fn contains(&self, kind: &TypeMeta, name: &str) -> bool {
        self.lock().objects.contains_key(&(kind.clone(), name.to_string()))
    }

    /// Stored objects of `kind`, sorted by name.
    pub fn objects(&self, kind: &TypeMeta) -> Vec<Resource> {
        let mut out: Vec<Resource> = self.lock().objects.values().filter(|r| &r.types == kind).cloned().collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out
    }

    fn validate(&self, res: &Resource) -> Result<(), StoreError> {
        if res.metadata.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".into()));
        }
        if let Some(ns) = res.metadata.namespace.as_deref() {
            if ns != self.namespace {
                return Err(StoreError::Invalid(format!(
                    "namespace {} does not match store namespace {}",
                    ns, self.namespace
                )));
            }
        }
        Ok(())
    }

    /// Keys of objects that list `uid` as an owner.
    fn dependents_of(inner: &Inner, uid: &str) -> Vec<Key> {
        inner
            .objects
            .iter()
            .filter(|(_, r)| r.metadata.owner_references.iter().any(|o| o.uid == uid))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn namespace(&self) -> &str { &self.namespace }

    async fn get(&self, kind: &TypeMeta, name: &str) -> Result<Resource, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Get, kind, name, false)?;
        inner
            .objects
            .get(&(kind.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, name)))
    }

    async fn create(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError> {
        self.validate(res)?;
        let mut inner = self.lock();
        inner.record(Op::Create, &res.types, &res.metadata.name, params.dry_run)?;
        let key = (res.types.clone(), res.metadata.name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Invalid(format!("{} {} already exists", key.0, key.1)));
        }
        let mut out = res.clone();
        out.metadata.namespace = Some(self.namespace.clone());
        out.metadata.uid = Some(Uuid::new_v4().to_string());
        out.status = None;
        if params.dry_run {
            return Ok(out);
        }
        out.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key, out.clone());
        drop(inner);
        counter!("memstore_writes", 1u64);
        debug!(kind = %out.types, name = %out.metadata.name, "memstore create");
        self.emit(WatchEvent::Added(out.clone()));
        Ok(out)
    }

    async fn update(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError> {
        self.validate(res)?;
        let mut inner = self.lock();
        inner.record(Op::Update, &res.types, &res.metadata.name, params.dry_run)?;
        let key = (res.types.clone(), res.metadata.name.clone());
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", key.0, key.1)))?;
        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            return Err(StoreError::Conflict(format!("{} {}: injected conflict", key.0, key.1)));
        }
        if let Some(rv) = res.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{} {}: resourceVersion {} is stale",
                    key.0, key.1, rv
                )));
            }
        }
        let mut out = res.clone();
        out.metadata.namespace = current.metadata.namespace.clone();
        out.metadata.uid = current.metadata.uid.clone();
        out.status = current.status.clone();
        if params.dry_run {
            return Ok(out);
        }
        out.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key, out.clone());
        drop(inner);
        counter!("memstore_writes", 1u64);
        debug!(kind = %out.types, name = %out.metadata.name, "memstore update");
        self.emit(WatchEvent::Modified(out.clone()));
        Ok(out)
    }

    async fn delete(&self, kind: &TypeMeta, name: &str, params: &DeleteParams) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Delete, kind, name, params.dry_run)?;
        let key = (kind.clone(), name.to_string());
        if !inner.objects.contains_key(&key) {
            return Err(StoreError::NotFound(format!("{} {}", kind, name)));
        }
        if params.dry_run {
            return Ok(());
        }
        let mut removed = Vec::new();
        let mut queue = vec![key];
        while let Some(k) = queue.pop() {
            let Some(obj) = inner.objects.remove(&k) else { continue };
            if let Some(uid) = obj.metadata.uid.clone() {
                let deps = Self::dependents_of(&inner, &uid);
                match params.cascade {
                    CascadePolicy::Orphan => {
                        for dk in deps {
                            if let Some(dep) = inner.objects.get_mut(&dk) {
                                dep.metadata.owner_references.retain(|o| o.uid != uid);
                            }
                        }
                    }
                    CascadePolicy::Foreground | CascadePolicy::Background => queue.extend(deps),
                }
            }
            removed.push(obj);
        }
        drop(inner);
        counter!("memstore_deletes", removed.len() as u64);
        for obj in removed {
            debug!(kind = %obj.types, name = %obj.metadata.name, "memstore delete");
            self.emit(WatchEvent::Deleted(obj));
        }
        Ok(())
    }

    async fn list(&self, kind: &TypeMeta, selector: &Selector) -> Result<Vec<Resource>, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::List, kind, "", false)?;
        let mut out: Vec<Resource> = inner
            .objects
            .values()
            .filter(|r| &r.types == kind && selector.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }

    async fn watch(&self, kind: &TypeMeta, selector: &Selector) -> Result<WatchStream, StoreError> {
        let injected = {
            let mut inner = self.lock();
            inner.record(Op::Watch, kind, "", false)?;
            std::mem::take(&mut inner.pending_watch_errors)
        };
        let rx = self.events.subscribe();
        let kind = kind.clone();
        let selector = selector.clone();
        let stream = futures::stream::unfold((rx, injected), move |(mut rx, injected)| {
            let kind = kind.clone();
            let selector = selector.clone();
            async move {
                if injected > 0 {
                    return Some((Err(StoreError::Invalid("watch lagged (injected)".into())), (rx, injected - 1)));
                }
                loop {
                    match rx.recv().await {
                        Ok((k, ev)) => {
                            if k == kind && selector.matches(ev.resource()) {
                                return Some((Ok(ev), (rx, 0)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::Invalid(format!("watch lagged by {} events", n))), (rx, 0)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm() -> TypeMeta { TypeMeta::new("v1", "ConfigMap") }

    #[tokio::test]
    async fn create_assigns_identity_and_dry_run_does_not_persist() {
        let store = MemoryStore::new("ns");
        let desired = Resource::new(&cm(), "a").with("data", json!({ "k": "v" }));

        let dry = store.create(&desired, &WriteParams::dry_run(true)).await.unwrap();
        assert!(dry.uid().is_some());
        assert!(!store.contains(&cm(), "a"));

        let made = store.create(&desired, &WriteParams::default()).await.unwrap();
        assert_eq!(made.namespace(), Some("ns"));
        assert_eq!(made.resource_version(), Some("1"));
        assert!(store.create(&desired, &WriteParams::default()).await.is_err());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new("ns");
        let v1 = store.insert(Resource::new(&cm(), "a"));
        let mut first = v1.clone();
        first.payload.insert("data".into(), json!({ "x": "1" }));
        store.update(&first, &WriteParams::default()).await.unwrap();

        let mut stale = v1.clone();
        stale.payload.insert("data".into(), json!({ "x": "2" }));
        let err = store.update(&stale, &WriteParams::default()).await.unwrap_err();
        assert!(err.is_conflict(), "{}", err);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = MemoryStore::new("ns");
        let v1 = store.insert(Resource::new(&cm(), "a"));
        store.inject_conflicts(2);
        assert!(store.update(&v1, &WriteParams::default()).await.unwrap_err().is_conflict());
        assert!(store.update(&v1, &WriteParams::default()).await.unwrap_err().is_conflict());
        assert!(store.update(&v1, &WriteParams::default()).await.is_ok());
        assert_eq!(store.count(Op::Update, "a"), 3);
    }

    #[tokio::test]
    async fn cascade_deletes_or_orphans_dependents() {
        let store = MemoryStore::new("ns");
        let owner = store.insert(Resource::new(&cm(), "owner"));
        let oref = keel_core::OwnerReference::from_resource(&owner).unwrap();
        let mut child = Resource::new(&cm(), "child");
        child.stamp_owner_references(&[oref]);
        store.insert(child.clone());

        store
            .delete(&cm(), "owner", &DeleteParams { dry_run: false, cascade: CascadePolicy::Orphan })
            .await
            .unwrap();
        let orphan = store.get(&cm(), "child").await.unwrap();
        assert!(orphan.owner_references().is_empty());

        let owner = store.insert(Resource::new(&cm(), "owner"));
        let mut child = orphan;
        child.stamp_owner_references(&[keel_core::OwnerReference::from_resource(&owner).unwrap()]);
        store.update(&child, &WriteParams::default()).await.unwrap();
        store.delete(&cm(), "owner", &DeleteParams::default()).await.unwrap();
        assert!(!store.contains(&cm(), "child"));
        assert!(store.delete(&cm(), "owner", &DeleteParams::default()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_watch_errors_precede_events() {
        let store = MemoryStore::new("ns");
        store.inject_watch_errors(2);
        let mut stream = store.watch(&cm(), &Selector::everything()).await.unwrap();
        store.insert(Resource::new(&cm(), "a"));

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.unwrap().is_err());
        assert!(matches!(stream.next().await.unwrap(), Ok(WatchEvent::Added(r)) if r.name() == "a"));

        // consumed by the first watch only
        let mut again = store.watch(&cm(), &Selector::everything()).await.unwrap();
        store.insert(Resource::new(&cm(), "b"));
        assert!(again.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn watch_filters_by_kind_and_selector() {
        let store = MemoryStore::new("ns");
        let mut stream = store.watch(&cm(), &Selector::everything().with_label("app", "x")).await.unwrap();

        store.insert(Resource::new(&TypeMeta::new("v1", "Secret"), "s"));
        store.insert(Resource::new(&cm(), "unlabeled"));
        let mut labeled = Resource::new(&cm(), "labeled");
        labeled.metadata.labels.insert("app".into(), "x".into());
        store.insert(labeled);

        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(&ev, WatchEvent::Added(r) if r.name() == "labeled"));
    }

    #[tokio::test]
    async fn injected_failures_surface_per_op() {
        let store = MemoryStore::new("ns");
        store.fail_on(Op::Get, "a", StoreError::Invalid("boom".into()));
        let err = store.get(&cm(), "a").await.unwrap_err();
        assert_eq!(err, StoreError::Invalid("boom".into()));
        store.clear_failures();
        assert!(store.get(&cm(), "a").await.unwrap_err().is_not_found());
    }
}
