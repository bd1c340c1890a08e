use std::collections::BTreeMap;
use std::sync::Arc;

use koil_core::prelude::*;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ControllerConfig, LoopOptions};
use crate::reconcile::ReconcileLoop;
use crate::reconciler::Reconciler;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("a reconciler is already registered for {0}")]
    DuplicateKind(ResourceKind),
    #[error("no reconcilers registered")]
    NoReconcilers,
    #[error("invalid controller config: {0}")]
    InvalidConfig(String),
}

struct Registration {
    reconciler: Arc<dyn Reconciler>,
    options: LoopOptions,
}

/// Owns the store handle and one reconcile loop per registered kind.
pub struct Manager {
    store: Arc<dyn ResourceStore>,
    config: ControllerConfig,
    registrations: BTreeMap<ResourceKind, Registration>,
}

impl Manager {
    pub fn new(store: Arc<dyn ResourceStore>, config: ControllerConfig) -> Result<Self, ControllerError> {
        if config.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".into()));
        }
        if config.backoff.base.is_zero() {
            return Err(ControllerError::InvalidConfig("backoff base must be positive".into()));
        }
        if !config.float_tolerance.is_finite() || config.float_tolerance < 0.0 {
            return Err(ControllerError::InvalidConfig(format!(
                "float tolerance must be a non-negative number, got {}",
                config.float_tolerance
            )));
        }
        Ok(Self { store, config, registrations: BTreeMap::new() })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn register(&mut self, kind: ResourceKind, reconciler: impl Reconciler) -> Result<(), ControllerError> {
        self.register_with(kind, Arc::new(reconciler), LoopOptions::default())
    }

    pub fn register_with(
        &mut self,
        kind: ResourceKind,
        reconciler: Arc<dyn Reconciler>,
        options: LoopOptions,
    ) -> Result<(), ControllerError> {
        if options.workers == Some(0) {
            return Err(ControllerError::InvalidConfig(format!("{kind}: workers must be at least 1")));
        }
        if self.registrations.contains_key(&kind) {
            return Err(ControllerError::DuplicateKind(kind));
        }
        self.registrations.insert(kind, Registration { reconciler, options });
        Ok(())
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.registrations.keys().cloned().collect()
    }

    /// Build the loops without running them.
    pub fn loops(&self) -> Vec<Arc<ReconcileLoop>> {
        self.registrations
            .iter()
            .map(|(kind, reg)| {
                let workers = reg.options.workers.unwrap_or(self.config.workers);
                Arc::new(ReconcileLoop::new(
                    kind.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&reg.reconciler),
                    &self.config,
                    workers,
                ))
            })
            .collect()
    }

    /// Run every loop until `cancel` fires, then wait for in-flight cycles.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        if self.registrations.is_empty() {
            return Err(ControllerError::NoReconcilers);
        }
        let mut tasks = JoinSet::new();
        for lp in self.loops() {
            tasks.spawn(lp.run(cancel.clone()));
        }
        info!(kinds = self.registrations.len(), "controller started");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "reconcile loop aborted");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::reconciler_fn;
    use koil_queue::BackoffConfig;
    use koil_store::MemoryStore;
    use std::time::Duration;

    fn noop() -> impl Reconciler {
        reconciler_fn(|o| Ok((o.clone(), ReconcileResult::done())))
    }

    fn manager() -> Manager {
        Manager::new(Arc::new(MemoryStore::new()), ControllerConfig::default()).expect("config")
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut m = manager();
        let kind = ResourceKind::new("a.dev", "v1", "A");
        m.register(kind.clone(), noop()).expect("first");
        let err = m.register(kind.clone(), noop()).expect_err("dup");
        assert!(matches!(err, ControllerError::DuplicateKind(k) if k == kind));
    }

    #[test]
    fn kinds_are_sorted_and_worker_overrides_apply() {
        let mut m = manager();
        m.register(ResourceKind::new("b.dev", "v1", "B"), noop()).expect("b");
        m.register_with(ResourceKind::new("a.dev", "v1", "A"), Arc::new(noop()), LoopOptions::workers(5))
            .expect("a");
        let kinds: Vec<String> = m.kinds().iter().map(|k| k.gvk_key()).collect();
        assert_eq!(kinds, vec!["a.dev/v1/A", "b.dev/v1/B"]);
        let workers: Vec<usize> = m.loops().iter().map(|l| l.workers()).collect();
        assert_eq!(workers, vec![5, 2]);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let zero = ControllerConfig { workers: 0, ..Default::default() };
        assert!(matches!(Manager::new(store.clone(), zero), Err(ControllerError::InvalidConfig(_))));
        let nan = ControllerConfig { float_tolerance: f64::NAN, ..Default::default() };
        assert!(matches!(Manager::new(store.clone(), nan), Err(ControllerError::InvalidConfig(_))));
        let hot = ControllerConfig {
            backoff: BackoffConfig::new(Duration::ZERO, Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(matches!(Manager::new(store, hot), Err(ControllerError::InvalidConfig(_))));

        let mut m = manager();
        let err = m
            .register_with(ResourceKind::new("a.dev", "v1", "A"), Arc::new(noop()), LoopOptions::workers(0))
            .expect_err("zero workers");
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn start_without_reconcilers_fails() {
        let err = manager().start(CancellationToken::new()).await.expect_err("empty");
        assert!(matches!(err, ControllerError::NoReconcilers));
    }
}
