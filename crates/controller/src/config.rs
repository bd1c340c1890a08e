use std::time::Duration;

use koil_queue::BackoffConfig;

/// Settings fixed at startup and shared by every reconcile loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Workers per kind unless a registration overrides it.
    pub workers: usize,
    /// Retry backoff for failed reconciliations, per object.
    pub backoff: BackoffConfig,
    /// Reconnect backoff for lost watch subscriptions.
    pub watch_backoff: BackoffConfig,
    /// Relative tolerance when comparing numeric status fields. Zero means
    /// exact; a non-zero value leaves any spec edit whose derived value moves
    /// by less than that fraction unpersisted.
    pub float_tolerance: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff: BackoffConfig::default(),
            watch_backoff: BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(30)),
            float_tolerance: 0.0,
        }
    }
}

/// Per-kind overrides given at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOptions {
    pub workers: Option<usize>,
}

impl LoopOptions {
    pub fn workers(n: usize) -> Self {
        Self { workers: Some(n) }
    }
}
