//! Batch manifests: a namespace plus an ordered list of parent → children trees.
//!
//! ```yaml
//! namespace: demo
//! trees:
//!   - prune: true
//!     parent:
//!       - { apiVersion: serving.knative.dev/v1, kind: Service, metadata: { name: web }, spec: {} }
//!     children:
//!       - - { apiVersion: eventing.knative.dev/v1, kind: Trigger, metadata: { name: on-order }, spec: {} }
//! ```
//!
//! Every list (the parent, each child list) becomes one operator and must be
//! homogeneous in kind.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use keel_core::{Resource, Selector};
use keel_reconcile::gc::{collector_for, OwnerIdentity};
use keel_reconcile::{Manager, Operator};
use keel_store::Store;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub trees: Vec<TreeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeSpec {
    #[serde(default)]
    pub parent: Vec<serde_json::Value>,
    #[serde(default)]
    pub children: Vec<Vec<serde_json::Value>>,
    /// Delete remote children of collectable kinds that reference the parent
    /// but are no longer declared.
    #[serde(default)]
    pub prune: bool,
}

pub fn parse(text: &str) -> Result<BatchFile> {
    let batch: BatchFile = serde_yaml::from_str(text).context("parsing batch manifest")?;
    if batch.trees.is_empty() {
        bail!("batch manifest declares no trees");
    }
    Ok(batch)
}

fn decode(docs: &[serde_json::Value], namespace: &str) -> Result<Vec<Resource>> {
    docs.iter()
        .enumerate()
        .map(|(i, raw)| -> Result<Resource> {
            let mut res = Resource::from_value(raw.clone()).with_context(|| format!("resource #{}", i))?;
            match res.namespace() {
                Some(ns) if ns != namespace => bail!("{} {} is in namespace {}, batch targets {}", res.types, res.name(), ns, namespace),
                Some(_) => {}
                None => res.metadata.namespace = Some(namespace.to_string()),
            }
            Ok(res)
        })
        .collect()
}

/// Build the operator forest against `store`. Empty lists become `None` slots.
pub fn build(batch: &BatchFile, store: Arc<dyn Store>) -> Result<Manager> {
    let namespace = store.namespace().to_string();
    let mut mgr = Manager::new();
    for (t, tree) in batch.trees.iter().enumerate() {
        let parents = decode(&tree.parent, &namespace).with_context(|| format!("tree {} parent", t))?;
        let owner = parents.first().map(|p| OwnerIdentity::from_resource(p, &namespace));

        let mut children = Vec::with_capacity(tree.children.len());
        for (c, docs) in tree.children.iter().enumerate() {
            let items = decode(docs, &namespace).with_context(|| format!("tree {} child list {}", t, c))?;
            if items.is_empty() {
                children.push(None);
                continue;
            }
            let mut op = Operator::new(store.clone(), items.clone()).with_context(|| format!("tree {} child list {}", t, c))?;
            if let (true, Some(owner)) = (tree.prune, owner.clone()) {
                if let Some(collector) = collector_for(&items[0].types, owner, &items, Selector::everything()) {
                    op = op.with_collector(collector);
                }
            }
            children.push(Some(op));
        }

        let parent = if parents.is_empty() {
            None
        } else {
            Some(Operator::new(store.clone(), parents).with_context(|| format!("tree {} parent", t))?)
        };
        mgr.add(parent, children);
    }
    Ok(mgr)
}
