//! Translates store change notifications into work queue entries.

use std::sync::Arc;

use futures::StreamExt;
use koil_core::prelude::*;
use koil_queue::{Backoff, BackoffConfig, WorkQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Feeds one kind's work queue. Change type is irrelevant: every notification
/// just enqueues the key and the loop re-reads current state.
pub struct EventWatcher {
    kind: ResourceKind,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    backoff: BackoffConfig,
}

impl EventWatcher {
    pub fn new(
        kind: ResourceKind,
        store: Arc<dyn ResourceStore>,
        queue: Arc<WorkQueue<ObjectKey>>,
        backoff: BackoffConfig,
    ) -> Self {
        Self { kind, store, queue, backoff }
    }

    /// Run until `cancel` fires, resynchronizing after every lost subscription.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff);
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.sync_and_stream(&mut backoff) => res,
            };
            match res {
                Ok(()) => warn!(kind = %self.kind, "watch stream ended; resyncing"),
                Err(e) => warn!(kind = %self.kind, error = %e, "watch failed; resyncing"),
            }
            let delay = backoff.next_delay();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(kind = %self.kind, "event watcher stopped");
    }

    /// Subscribe, relist, enqueue everything, then stream until the
    /// subscription is lost.
    async fn sync_and_stream(&self, backoff: &mut Backoff) -> Result<(), StoreError> {
        // Subscribe before listing so no change slips between the two.
        let mut stream = self.store.watch(&self.kind).await?;
        let objects = self.store.list(&self.kind).await?;
        let count = objects.len();
        for obj in objects {
            self.queue.add(obj.key);
        }
        backoff.reset();
        metrics::counter!("koil_watch_resyncs_total", 1u64, "kind" => self.kind.gvk_key());
        info!(kind = %self.kind, objects = count, "resynced");

        while let Some(ev) = stream.next().await {
            self.enqueue(ev?);
        }
        Ok(())
    }

    fn enqueue(&self, ev: WatchEvent) {
        metrics::counter!("koil_watch_events_total", 1u64, "kind" => self.kind.gvk_key());
        match ev {
            WatchEvent::Changed { key, change } => {
                debug!(key = %key, ?change, "change observed");
                self.queue.add(key);
            }
            WatchEvent::Restarted(keys) => {
                debug!(kind = %self.kind, count = keys.len(), "store relisted");
                for key in keys {
                    self.queue.add(key);
                }
            }
        }
    }
}
