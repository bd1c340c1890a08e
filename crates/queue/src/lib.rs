//! Koil work queue: deduplicating, delay-capable queue of keys awaiting
//! reconciliation, plus the exponential backoff used to schedule retries.

#![forbid(unsafe_code)]

mod backoff;
mod queue;

pub use backoff::{Backoff, BackoffConfig, ItemBackoff};
pub use queue::WorkQueue;
