//! Manager: an ordered forest of parent → children operators applied as one
//! batch.
//!
//! Parents are applied without inherited owner references; the references of
//! every non-failed parent status are collected by a post hook and stamped on
//! that parent's children. On the first failure the batch stops and, under
//! `PurgeOnError`, every parent in the forest is deleted once, best effort.

use std::sync::{Arc, Mutex};

use keel_core::{OwnerReference, Status};
use keel_store::CascadePolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::Callbacks;
use crate::operator::{ApplyOptions, DeleteOptions, Operator};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Leave partial progress in place.
    #[default]
    NothingOnError,
    /// Delete every parent of the batch, then return the original error.
    PurgeOnError,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub dry_run: bool,
    pub error_policy: ErrorPolicy,
    /// Stamp the parent's owner references on its children.
    pub propagate_owners: bool,
    pub wait_for_apply: bool,
    /// Cascade used by `delete` and by the purge sweep.
    pub cascade: CascadePolicy,
    /// Merged into every operator's hooks.
    pub callbacks: Callbacks,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            error_policy: ErrorPolicy::default(),
            propagate_owners: true,
            wait_for_apply: false,
            cascade: CascadePolicy::default(),
            callbacks: Callbacks::default(),
        }
    }
}

type Tree = (Option<Operator>, Vec<Option<Operator>>);

/// `None` slots are deliberate no-ops, so optional resources can be declared
/// conditionally.
#[derive(Default)]
pub struct Manager {
    forest: Vec<Tree>,
}

/// Accumulates owner references of applied statuses, deduplicated by uid.
/// Garbage-collection deletions pass through the same hooks and are ignored.
fn collector(acc: Arc<Mutex<Vec<OwnerReference>>>) -> Callbacks {
    Callbacks::default().post(move |hook, _err| {
        let Some(owner) = hook.status().and_then(Status::owner_reference) else { return Ok(()) };
        let mut refs = acc.lock().unwrap_or_else(|e| e.into_inner());
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
        Ok(())
    })
}

impl Manager {
    pub fn new() -> Self { Self::default() }

    /// Append a tree; trees are processed in insertion order.
    pub fn add(&mut self, parent: Option<Operator>, children: Vec<Option<Operator>>) -> &mut Self {
        self.forest.push((parent, children));
        self
    }

    pub fn len(&self) -> usize { self.forest.len() }

    pub fn is_empty(&self) -> bool { self.forest.is_empty() }

    /// Apply every tree, parent first. Returns all statuses in processing order.
    pub async fn apply(&mut self, cancel: &CancellationToken, opts: &ManagerOptions) -> Result<Vec<Status>, ReconcileError> {
        match self.apply_forest(cancel, opts).await {
            Ok(statuses) => Ok(statuses),
            Err(e) => {
                if opts.error_policy == ErrorPolicy::PurgeOnError {
                    warn!(error = %e, "batch failed; purging parents");
                    self.purge(cancel, opts).await;
                }
                Err(e)
            }
        }
    }

    async fn apply_forest(&mut self, cancel: &CancellationToken, opts: &ManagerOptions) -> Result<Vec<Status>, ReconcileError> {
        let mut statuses = Vec::new();
        for (tree, (parent, children)) in self.forest.iter_mut().enumerate() {
            let acc = Arc::new(Mutex::new(Vec::new()));
            if let Some(parent) = parent.as_mut() {
                let parent_opts = ApplyOptions {
                    dry_run: opts.dry_run,
                    wait_for_apply: opts.wait_for_apply,
                    callbacks: collector(acc.clone()).merged(&opts.callbacks),
                    ..Default::default()
                };
                statuses.extend(parent.apply(cancel, &parent_opts).await?);
            }

            let owner_references = if opts.propagate_owners {
                acc.lock().unwrap_or_else(|e| e.into_inner()).clone()
            } else {
                Vec::new()
            };
            debug!(tree, owners = owner_references.len(), "parent applied");

            let child_opts = ApplyOptions {
                dry_run: opts.dry_run,
                owner_references,
                wait_for_apply: opts.wait_for_apply,
                callbacks: opts.callbacks.clone(),
                ..Default::default()
            };
            for child in children.iter_mut().flatten() {
                statuses.extend(child.apply(cancel, &child_opts).await?);
            }
        }
        info!(trees = self.forest.len(), statuses = statuses.len(), dry_run = opts.dry_run, "batch applied");
        Ok(statuses)
    }

    /// Delete every tree, children before their parent. Stops at the first failure.
    pub async fn delete(&mut self, cancel: &CancellationToken, opts: &ManagerOptions) -> Result<Vec<Status>, ReconcileError> {
        let del = DeleteOptions { dry_run: opts.dry_run, cascade: opts.cascade, callbacks: opts.callbacks.clone() };
        let mut statuses = Vec::new();
        for (parent, children) in self.forest.iter_mut() {
            for child in children.iter_mut().rev().flatten() {
                statuses.extend(child.delete(cancel, &del).await?);
            }
            if let Some(parent) = parent.as_mut() {
                statuses.extend(parent.delete(cancel, &del).await?);
            }
        }
        Ok(statuses)
    }

    /// Best-effort rollback: delete every parent once; failures are logged
    /// and dropped. Children go with their parents through the store's
    /// cascade.
    pub async fn purge(&mut self, cancel: &CancellationToken, opts: &ManagerOptions) {
        let del = DeleteOptions { dry_run: opts.dry_run, cascade: opts.cascade, callbacks: opts.callbacks.clone() };
        for (tree, (parent, _)) in self.forest.iter_mut().enumerate() {
            let Some(parent) = parent.as_mut() else { continue };
            if let Err(e) = parent.delete(cancel, &del).await {
                warn!(tree, kind = ?parent.kind(), error = %e, "purge: delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Outcome, Resource, TypeMeta};

    fn status(outcome: Outcome, uid: Option<&str>) -> Status {
        let mut r = Resource::new(&TypeMeta::new("v1", "ConfigMap"), "cm");
        r.metadata.uid = uid.map(|s| s.to_string());
        Status::new(outcome, r)
    }

    #[test]
    fn collector_skips_failed_and_deleted_and_dedups_by_uid() {
        let acc = Arc::new(Mutex::new(Vec::new()));
        let cbs = collector(acc.clone());
        cbs.run_post(&status(Outcome::Created, Some("u1")), None).unwrap();
        cbs.run_post(&status(Outcome::Skipped, Some("u1")), None).unwrap();
        cbs.run_post(&status(Outcome::Failed, Some("u2")), None).unwrap();
        cbs.run_post(&status(Outcome::Deleted, Some("u3")), None).unwrap();
        cbs.run_post(&status(Outcome::Created, None), None).unwrap();
        let refs = acc.lock().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "u1");
    }

    #[test]
    fn owners_propagate_by_default() {
        let opts = ManagerOptions::default();
        assert!(opts.propagate_owners);
        assert_eq!(opts.error_policy, ErrorPolicy::NothingOnError);
    }
}
