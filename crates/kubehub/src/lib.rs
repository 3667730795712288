//! Keel kubehub: the `Store` contract over a Kubernetes API server.
//!
//! Resources travel as `DynamicObject`s; kinds are resolved through discovery
//! once and cached.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use futures::StreamExt;
use keel_core::{Resource, Selector, StoreError, TypeMeta};
use keel_store::{CascadePolicy, DeleteParams, Store, WatchEvent, WatchStream, WriteParams};
use kube::{
    api::{Api, DeleteParams as KubeDeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "keel";

pub struct KubeStore {
    client: Client,
    namespace: String,
    kinds: Mutex<HashMap<TypeMeta, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into(), kinds: Mutex::new(HashMap::new()) }
    }

    /// Connect with the ambient kubeconfig / in-cluster config. Without an
    /// explicit namespace, the context's default namespace is used.
    pub async fn try_default(namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let ns = namespace.map(|s| s.to_string()).unwrap_or_else(|| client.default_namespace().to_string());
        info!(namespace = %ns, "kube store ready");
        Ok(Self::new(client, ns))
    }

    async fn api(&self, kind: &TypeMeta) -> Result<Api<DynamicObject>, StoreError> {
        let cached = self.kinds.lock().unwrap_or_else(|e| e.into_inner()).get(kind).cloned();
        let (ar, namespaced) = match cached {
            Some(hit) => hit,
            None => {
                let found = find_api_resource(self.client.clone(), kind).await?;
                self.kinds.lock().unwrap_or_else(|e| e.into_inner()).insert(kind.clone(), found.clone());
                found
            }
        };
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

async fn find_api_resource(client: Client, kind: &TypeMeta) -> Result<(ApiResource, bool), StoreError> {
    let gvk = GroupVersionKind {
        group: kind.group().to_string(),
        version: kind.version().to_string(),
        kind: kind.kind.clone(),
    };
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| map_kube_err(e, "discovery"))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(kind = %kind, plural = %ar.plural, namespaced, "resolved api resource");
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(StoreError::Invalid(format!("kind not served: {}", kind)))
}

fn map_kube_err(e: kube::Error, what: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{}: {}", what, ae.message)),
        other => StoreError::Invalid(format!("{}: {}", what, other)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_resource(obj: DynamicObject) -> Result<Resource, StoreError> {
    let mut raw = serde_json::to_value(&obj).map_err(|e| StoreError::Invalid(format!("serializing DynamicObject: {}", e)))?;
    strip_managed_fields(&mut raw);
    Resource::from_value(raw)
}

fn to_dynamic(res: &Resource) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(res.to_value()?).map_err(|e| StoreError::Invalid(format!("building DynamicObject: {}", e)))
}

fn propagation(cascade: CascadePolicy) -> PropagationPolicy {
    match cascade {
        CascadePolicy::Foreground => PropagationPolicy::Foreground,
        CascadePolicy::Background => PropagationPolicy::Background,
        CascadePolicy::Orphan => PropagationPolicy::Orphan,
    }
}

fn post_params(params: &WriteParams) -> PostParams {
    PostParams { dry_run: params.dry_run, field_manager: Some(FIELD_MANAGER.to_string()) }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    fn namespace(&self) -> &str { &self.namespace }

    async fn get(&self, kind: &TypeMeta, name: &str) -> Result<Resource, StoreError> {
        let api = self.api(kind).await?;
        counter!("kube_store_get", 1u64);
        let obj = api.get(name).await.map_err(|e| map_kube_err(e, &format!("get {} {}", kind, name)))?;
        to_resource(obj)
    }

    async fn create(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError> {
        let api = self.api(&res.types).await?;
        counter!("kube_store_create", 1u64);
        let obj = api
            .create(&post_params(params), &to_dynamic(res)?)
            .await
            .map_err(|e| map_kube_err(e, &format!("create {} {}", res.types, res.name())))?;
        to_resource(obj)
    }

    async fn update(&self, res: &Resource, params: &WriteParams) -> Result<Resource, StoreError> {
        let api = self.api(&res.types).await?;
        counter!("kube_store_update", 1u64);
        let obj = api
            .replace(res.name(), &post_params(params), &to_dynamic(res)?)
            .await
            .map_err(|e| map_kube_err(e, &format!("update {} {}", res.types, res.name())))?;
        to_resource(obj)
    }

    async fn delete(&self, kind: &TypeMeta, name: &str, params: &DeleteParams) -> Result<(), StoreError> {
        let api = self.api(kind).await?;
        counter!("kube_store_delete", 1u64);
        let dp = KubeDeleteParams {
            dry_run: params.dry_run,
            propagation_policy: Some(propagation(params.cascade)),
            ..Default::default()
        };
        api.delete(name, &dp)
            .await
            .map_err(|e| map_kube_err(e, &format!("delete {} {}", kind, name)))?;
        Ok(())
    }

    async fn list(&self, kind: &TypeMeta, selector: &Selector) -> Result<Vec<Resource>, StoreError> {
        let api = self.api(kind).await?;
        counter!("kube_store_list", 1u64);
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query());
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_err(e, &format!("list {}", kind)))?;
        list.items.into_iter().map(to_resource).collect()
    }

    async fn watch(&self, kind: &TypeMeta, selector: &Selector) -> Result<WatchStream, StoreError> {
        let api = self.api(kind).await?;
        let mut cfg = watcher::Config::default();
        if !selector.is_empty() {
            cfg = cfg.labels(&selector.to_query());
        }
        info!(kind = %kind, selector = %selector.to_query(), "watch started");
        let stream = watcher::watcher(api, cfg).flat_map(|ev| {
            let out: Vec<Result<WatchEvent, StoreError>> = match ev {
                Ok(Event::Applied(o)) => vec![to_resource(o).map(WatchEvent::Modified)],
                Ok(Event::Deleted(o)) => vec![to_resource(o).map(WatchEvent::Deleted)],
                Ok(Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    list.into_iter().map(|o| to_resource(o).map(WatchEvent::Added)).collect()
                }
                Err(e) => vec![Err(StoreError::Invalid(format!("watch: {}", e)))],
            };
            futures::stream::iter(out)
        });
        Ok(stream.boxed())
    }
}
