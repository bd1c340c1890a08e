//! Koil controller: level-triggered reconcile loops over a `ResourceStore`.
//!
//! Each registered kind gets an event watcher feeding a deduplicating work
//! queue and a pool of workers. A worker fetches the current object, hands it
//! to the kind's reconciler and writes the status back only when it changed.

#![forbid(unsafe_code)]

mod config;
mod manager;
mod reconcile;
mod reconciler;
mod status;
mod watcher;

pub use config::{ControllerConfig, LoopOptions};
pub use manager::{ControllerError, Manager};
pub use reconcile::{CycleOutcome, CycleReport, ReconcileLoop, Requeue};
pub use reconciler::{reconciler_fn, DeriveStatus, FnReconciler, Reconciler, StatusReconciler};
pub use status::{status_equal, StatusOutcome, StatusWriter};
pub use watcher::EventWatcher;

pub use koil_queue::{BackoffConfig, WorkQueue};
