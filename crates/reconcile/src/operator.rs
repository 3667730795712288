//! Operator: converges one homogeneous list of resources against a store.
//!
//! Per item, `apply` runs: stamp owner refs + labels → pre hooks → converge
//! (get, then create / skip / update-with-conflict-retry) → optional ready
//! wait → post hooks. The first failure stops the list; items after it are
//! left untouched.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use keel_core::{Outcome, OwnerReference, Resource, Selector, Status, StoreError, TypeMeta};
use keel_store::{CascadePolicy, DeleteParams, Store, WatchEvent, WriteParams};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::Callbacks;
use crate::config::{EngineConfig, RetryPolicy};
use crate::gc::Predicate;
use crate::ReconcileError;

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Ask the store to validate without persisting.
    pub dry_run: bool,
    /// Stamped onto every item before it is converged.
    pub owner_references: Vec<OwnerReference>,
    /// Merged into every item's labels.
    pub labels: BTreeMap<String, String>,
    /// Block after create/update until the resource reports `Ready=True`.
    pub wait_for_apply: bool,
    pub callbacks: Callbacks,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub dry_run: bool,
    pub cascade: CascadePolicy,
    pub callbacks: Callbacks,
}

/// When garbage collection runs relative to the declared items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcPhase {
    #[default]
    BeforeApply,
    AfterApply,
}

/// Deletion-by-absence for kinds that support partial declaration.
#[derive(Clone)]
pub struct Collector {
    /// Kind to sweep; needed even when nothing of it is declared any more.
    pub kind: TypeMeta,
    pub selector: Selector,
    pub predicate: Predicate,
    pub phase: GcPhase,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("kind", &self.kind)
            .field("selector", &self.selector)
            .field("phase", &self.phase)
            .finish()
    }
}

pub struct Operator {
    store: Arc<dyn Store>,
    items: Vec<Resource>,
    retry: RetryPolicy,
    wait_timeout: Duration,
    collector: Option<Collector>,
}

/// Race a store call against cancellation.
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        r = fut => r,
    }
}

impl Operator {
    /// All items must share one type descriptor.
    pub fn new(store: Arc<dyn Store>, items: Vec<Resource>) -> Result<Self, ReconcileError> {
        if let Some(first) = items.first() {
            if let Some(odd) = items.iter().find(|r| r.types != first.types) {
                return Err(ReconcileError::InvalidResource(format!(
                    "operator items must share one kind: {} vs {} ({})",
                    first.types,
                    odd.types,
                    odd.name()
                )));
            }
        }
        if let Some(unnamed) = items.iter().find(|r| r.name().is_empty()) {
            return Err(ReconcileError::InvalidResource(format!("{} item without a name", unnamed.types)));
        }
        let cfg = EngineConfig::from_env();
        Ok(Self { store, items, retry: cfg.retry, wait_timeout: cfg.wait_timeout, collector: None })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_collector(mut self, collector: Collector) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn items(&self) -> &[Resource] { &self.items }

    /// Kind handled by this operator; falls back to the collector's kind for an empty list.
    pub fn kind(&self) -> Option<&TypeMeta> {
        self.items.first().map(|r| &r.types).or(self.collector.as_ref().map(|c| &c.kind))
    }

    pub async fn apply(&mut self, cancel: &CancellationToken, opts: &ApplyOptions) -> Result<Vec<Status>, ReconcileError> {
        let t0 = Instant::now();
        let mut statuses = Vec::with_capacity(self.items.len());

        if self.gc_phase() == Some(GcPhase::BeforeApply) {
            self.collect_garbage(cancel, opts.dry_run, &opts.callbacks, &mut statuses).await?;
        }

        for idx in 0..self.items.len() {
            let mut desired = self.items[idx].clone();
            desired.stamp_owner_references(&opts.owner_references);
            desired.merge_labels(&opts.labels);

            opts.callbacks.run_pre(&desired)?;

            let (mut status, mut err) = self.converge(cancel, &desired, opts.dry_run).await;
            let changed = matches!(status.outcome, Outcome::Created | Outcome::Updated);
            if err.is_none() && changed && opts.wait_for_apply && !opts.dry_run {
                match self.wait_ready(cancel, &status.resource).await {
                    Ok(ready) => status.resource = ready,
                    Err(e) => err = Some(e),
                }
            }

            counter!("reconcile_outcomes", 1u64, "outcome" => status.outcome.as_str());
            match &err {
                None => info!(kind = %desired.types, name = %desired.name(), outcome = %status.outcome, dry_run = opts.dry_run, "applied"),
                Some(e) => warn!(kind = %desired.types, name = %desired.name(), outcome = %status.outcome, error = %e, "apply failed"),
            }

            opts.callbacks.run_post(&status, err.as_ref())?;
            if let Some(e) = err {
                return Err(e);
            }
            if !opts.dry_run {
                self.items[idx] = status.resource.clone();
            }
            statuses.push(status);
        }

        if self.gc_phase() == Some(GcPhase::AfterApply) {
            self.collect_garbage(cancel, opts.dry_run, &opts.callbacks, &mut statuses).await?;
        }

        histogram!("reconcile_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(statuses)
    }

    pub async fn delete(&mut self, cancel: &CancellationToken, opts: &DeleteOptions) -> Result<Vec<Status>, ReconcileError> {
        let params = DeleteParams { dry_run: opts.dry_run, cascade: opts.cascade };
        let mut statuses = Vec::with_capacity(self.items.len());
        for item in &self.items {
            opts.callbacks.run_pre(item)?;
            let (status, err) = self.delete_one(cancel, item, &params).await;
            counter!("reconcile_outcomes", 1u64, "outcome" => status.outcome.as_str());
            opts.callbacks.run_post(&status, err.as_ref())?;
            if let Some(e) = err {
                return Err(e);
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    fn gc_phase(&self) -> Option<GcPhase> { self.collector.as_ref().map(|c| c.phase) }

    /// Converge one desired resource. Always yields a status; the error is
    /// set exactly when the status is `Failed`.
    async fn converge(&self, cancel: &CancellationToken, desired: &Resource, dry_run: bool) -> (Status, Option<ReconcileError>) {
        let params = WriteParams::dry_run(dry_run);
        match guarded(cancel, self.store.get(&desired.types, desired.name())).await {
            Err(e) if e.is_not_found() => match guarded(cancel, self.store.create(&fresh_copy(desired), &params)).await {
                Ok(created) => (Status::new(Outcome::Created, created), None),
                Err(e) => (Status::new(Outcome::Failed, desired.clone()), Some(e.into())),
            },
            Err(e) => (Status::new(Outcome::Failed, desired.clone()), Some(e.into())),
            Ok(observed) => {
                if desired.is_satisfied_by(&observed) {
                    return (Status::new(Outcome::Skipped, observed), None);
                }
                match self.update_with_retry(cancel, desired, observed, &params).await {
                    Ok(updated) => (Status::new(Outcome::Updated, updated), None),
                    Err(e) => (Status::new(Outcome::Failed, desired.clone()), Some(e)),
                }
            }
        }
    }

    /// Copy desired onto observed and update; on conflict re-read and try
    /// again, up to `retry.attempts` updates in total.
    async fn update_with_retry(
        &self,
        cancel: &CancellationToken,
        desired: &Resource,
        mut observed: Resource,
        params: &WriteParams,
    ) -> Result<Resource, ReconcileError> {
        let mut attempt = 1u32;
        loop {
            let mut next = observed.clone();
            next.adopt_desired(desired);
            match guarded(cancel, self.store.update(&next, params)).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() && attempt < self.retry.attempts => {
                    counter!("reconcile_conflict_retries", 1u64);
                    debug!(kind = %desired.types, name = %desired.name(), attempt, error = %e, "update conflict; retrying");
                    guarded(cancel, async {
                        tokio::time::sleep(self.retry.backoff).await;
                        Ok(())
                    })
                    .await?;
                    observed = guarded(cancel, self.store.get(&desired.types, desired.name())).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete_one(&self, cancel: &CancellationToken, item: &Resource, params: &DeleteParams) -> (Status, Option<ReconcileError>) {
        match guarded(cancel, self.store.delete(&item.types, item.name(), params)).await {
            Ok(()) => {
                info!(kind = %item.types, name = %item.name(), dry_run = params.dry_run, "deleted");
                (Status::new(Outcome::Deleted, item.clone()), None)
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %item.types, name = %item.name(), "already absent");
                (Status::new(Outcome::Skipped, item.clone()), None)
            }
            Err(e) => {
                warn!(kind = %item.types, name = %item.name(), error = %e, "delete failed");
                (Status::new(Outcome::Failed, item.clone()), Some(e.into()))
            }
        }
    }

    /// List remote resources of the collector's kind and delete the ones its
    /// predicate flags, through the same hook pipeline as declared items.
    async fn collect_garbage(
        &self,
        cancel: &CancellationToken,
        dry_run: bool,
        callbacks: &Callbacks,
        statuses: &mut Vec<Status>,
    ) -> Result<(), ReconcileError> {
        let Some(collector) = self.collector.as_ref() else { return Ok(()) };
        let remote = guarded(cancel, self.store.list(&collector.kind, &collector.selector)).await?;
        let params = DeleteParams { dry_run, cascade: CascadePolicy::default() };
        for candidate in remote {
            if !(collector.predicate)(&candidate)? {
                continue;
            }
            callbacks.run_pre(&candidate)?;
            let (status, err) = self.delete_one(cancel, &candidate, &params).await;
            callbacks.run_post(&status, err.as_ref())?;
            if let Some(e) = err {
                return Err(e);
            }
            counter!("gc_deleted", 1u64);
            statuses.push(status);
        }
        Ok(())
    }

    /// Wait until `res` reports `Ready=True`, bounded by the wait timeout and
    /// the cancellation token.
    async fn wait_ready(&self, cancel: &CancellationToken, res: &Resource) -> Result<Resource, ReconcileError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReconcileError::Store(StoreError::Cancelled)),
            r = tokio::time::timeout(self.wait_timeout, self.watch_until_ready(&res.types, res.name())) => match r {
                Ok(done) => done,
                Err(_) => Err(ReconcileError::WaitTimeout(format!(
                    "{} {} not ready after {:?}",
                    res.types,
                    res.name(),
                    self.wait_timeout
                ))),
            },
        }
    }

    async fn watch_until_ready(&self, kind: &TypeMeta, name: &str) -> Result<Resource, ReconcileError> {
        // Open the watch before reading so a transition in between is not missed.
        let mut events = self.store.watch(kind, &Selector::everything()).await?;
        let current = self.store.get(kind, name).await?;
        if let Some(ready) = ready_verdict(current)? {
            return Ok(ready);
        }
        while let Some(ev) = events.next().await {
            // A lagged or restarted watch is not a verdict; the timeout bounds the wait.
            let ev = match ev {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(kind = %kind, name = %name, error = %e, "watch error while waiting; continuing");
                    continue;
                }
            };
            if ev.resource().name() != name {
                continue;
            }
            match ev {
                WatchEvent::Deleted(_) => {
                    return Err(ReconcileError::WaitUnexpectedState(format!("{} {} was deleted while waiting", kind, name)));
                }
                WatchEvent::Added(r) | WatchEvent::Modified(r) => {
                    if let Some(ready) = ready_verdict(r)? {
                        return Ok(ready);
                    }
                }
            }
        }
        Err(ReconcileError::WaitUnexpectedState(format!("watch on {} {} closed before it became ready", kind, name)))
    }
}

/// Desired copy without store-assigned identity, for create after the
/// remote object disappeared.
fn fresh_copy(desired: &Resource) -> Resource {
    let mut fresh = desired.clone();
    fresh.metadata.uid = None;
    fresh.metadata.resource_version = None;
    fresh.status = None;
    fresh
}

/// `Some` once ready, `None` while still progressing, error on `Ready=False`.
fn ready_verdict(res: Resource) -> Result<Option<Resource>, ReconcileError> {
    match res.ready_condition() {
        Some((true, _)) => Ok(Some(res)),
        Some((false, msg)) => Err(ReconcileError::WaitUnexpectedState(format!(
            "{} {} is not ready: {}",
            res.types,
            res.name(),
            msg.unwrap_or_else(|| "no reason given".into())
        ))),
        None => Ok(None),
    }
}
