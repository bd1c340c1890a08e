//! The per-kind reconcile loop.
//!
//! One cycle: dequeue a key, fetch the object, invoke the reconciler, persist
//! a changed status, schedule any requeue, then mark the key done. The work
//! queue guarantees a key is never in two cycles at once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use koil_core::prelude::*;
use koil_queue::{ItemBackoff, WorkQueue};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ControllerConfig;
use crate::reconciler::Reconciler;
use crate::status::{StatusOutcome, StatusWriter};
use crate::watcher::EventWatcher;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The object is gone; the finalize hook ran.
    Deleted,
    /// The object disappeared between fetch and status write; the next cycle
    /// observes the deletion and finalizes.
    Vanished,
    /// Status already matched; nothing was written.
    NoChange,
    Updated { resource_version: String },
    /// The status write lost an optimistic-concurrency race.
    Conflict,
    Failed(ReconcileError),
    /// Shutdown interrupted the fetch; the object was not touched.
    Abandoned,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Deleted => "deleted",
            CycleOutcome::Vanished => "vanished",
            CycleOutcome::NoChange => "no_change",
            CycleOutcome::Updated { .. } => "updated",
            CycleOutcome::Conflict => "conflict",
            CycleOutcome::Failed(_) => "failed",
            CycleOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    No,
    /// Straight back into the queue; the next cycle fetches fresh state.
    Now,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub requeue: Requeue,
}

pub struct ReconcileLoop {
    kind: ResourceKind,
    label: String,
    store: Arc<dyn ResourceStore>,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    backoff: ItemBackoff<ObjectKey>,
    writer: StatusWriter,
    config: ControllerConfig,
    workers: usize,
}

impl ReconcileLoop {
    pub fn new(
        kind: ResourceKind,
        store: Arc<dyn ResourceStore>,
        reconciler: Arc<dyn Reconciler>,
        config: &ControllerConfig,
        workers: usize,
    ) -> Self {
        let label = kind.gvk_key();
        Self {
            queue: Arc::new(WorkQueue::new(label.clone())),
            backoff: ItemBackoff::new(config.backoff),
            writer: StatusWriter::new(Arc::clone(&store), config.float_tolerance),
            label,
            kind,
            store,
            reconciler,
            config: config.clone(),
            workers: workers.max(1),
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Failures recorded for `key` since its last success.
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.backoff.failures(key)
    }

    /// Run the watcher and the worker pool until `cancel` fires. In-flight
    /// cycles finish before the queue is shut down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        let watcher = EventWatcher::new(
            self.kind.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.config.watch_backoff,
        );
        tasks.spawn(watcher.run(cancel.clone()));
        for id in 0..self.workers {
            tasks.spawn(Arc::clone(&self).worker(id, cancel.clone()));
        }
        info!(kind = %self.kind, workers = self.workers, "reconcile loop started");

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(kind = %self.kind, error = %e, "reconcile loop task aborted");
            }
        }
        self.queue.shutdown();
        info!(kind = %self.kind, "reconcile loop stopped");
    }

    async fn worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            let span = tracing::debug_span!("reconcile", kind = %self.label, key = %key, worker = id);
            let report = self.reconcile_key(&key, &cancel).instrument(span).await;
            self.schedule(&key, &report);
            self.queue.done(&key);
            metrics::gauge!("koil_workqueue_depth", self.queue.len() as f64, "kind" => self.label.clone());
        }
        debug!(kind = %self.kind, worker = id, "worker stopped");
    }

    /// Run a single cycle for `key`. Does not touch the queue.
    pub async fn reconcile_key(&self, key: &ObjectKey, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let report = self.cycle(key, cancel).await;
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("koil_reconcile_ms", ms, "kind" => self.label.clone());
        metrics::counter!(
            "koil_reconcile_total",
            1u64,
            "kind" => self.label.clone(),
            "outcome" => report.outcome.label()
        );
        match &report.outcome {
            CycleOutcome::Failed(e) => {
                warn!(key = %key, error = %e, requeue = ?report.requeue, "reconcile failed")
            }
            outcome => debug!(key = %key, outcome = outcome.label(), requeue = ?report.requeue, ms, "reconciled"),
        }
        report
    }

    async fn cycle(&self, key: &ObjectKey, cancel: &CancellationToken) -> CycleReport {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return CycleReport { outcome: CycleOutcome::Abandoned, requeue: Requeue::No };
            }
            res = self.store.get(key) => res,
        };
        let fetched = match fetched {
            Ok(Some(obj)) => obj,
            Ok(None) => return self.finalize(key).await,
            Err(e) => return self.failed(key, e.into()),
        };

        let invoked = AssertUnwindSafe(self.reconciler.reconcile(&fetched)).catch_unwind().await;
        let (updated, result) = match invoked {
            Ok(Ok(out)) => out,
            Ok(Err(ReconcileError::Store(e))) if e.is_conflict() => return self.conflict(),
            Ok(Err(e)) => return self.failed(key, e),
            Err(panic) => return self.failed(key, ReconcileError::Panicked(panic_message(panic.as_ref()))),
        };
        if updated.spec != fetched.spec {
            warn!(key = %key, "reconciler changed spec; only status is persisted");
        }

        let outcome = match self.writer.update_status_if_changed(&fetched, &updated).await {
            StatusOutcome::Unchanged => CycleOutcome::NoChange,
            StatusOutcome::Updated { resource_version } => CycleOutcome::Updated { resource_version },
            StatusOutcome::Conflict => return self.conflict(),
            StatusOutcome::StoreError(StoreError::NotFound(_)) => {
                return CycleReport { outcome: CycleOutcome::Vanished, requeue: Requeue::Now };
            }
            StatusOutcome::StoreError(e) => return self.failed(key, e.into()),
        };

        let requeue = if let Some(delay) = result.delay() {
            self.backoff.forget(key);
            Requeue::After(delay)
        } else if result.requeue {
            Requeue::After(self.backoff.next_delay(key))
        } else {
            self.backoff.forget(key);
            Requeue::No
        };
        CycleReport { outcome, requeue }
    }

    async fn finalize(&self, key: &ObjectKey) -> CycleReport {
        let res = AssertUnwindSafe(self.reconciler.finalize(key)).catch_unwind().await;
        match res {
            Ok(Ok(())) => {
                self.backoff.forget(key);
                debug!(key = %key, "object gone; finalized");
                CycleReport { outcome: CycleOutcome::Deleted, requeue: Requeue::No }
            }
            Ok(Err(e)) => self.failed(key, e),
            Err(panic) => self.failed(key, ReconcileError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn failed(&self, key: &ObjectKey, err: ReconcileError) -> CycleReport {
        let delay = self.backoff.next_delay(key);
        CycleReport { outcome: CycleOutcome::Failed(err), requeue: Requeue::After(delay) }
    }

    fn conflict(&self) -> CycleReport {
        CycleReport { outcome: CycleOutcome::Conflict, requeue: Requeue::Now }
    }

    /// Put `key` back into the queue as the report asks. Called while the key
    /// is still in flight, so the queue holds it until `done`.
    pub fn schedule(&self, key: &ObjectKey, report: &CycleReport) {
        match report.requeue {
            Requeue::No => {}
            Requeue::Now => self.queue.add(key.clone()),
            Requeue::After(delay) => self.queue.add_after(key.clone(), delay),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
