#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use koil_controller::{
    BackoffConfig, ControllerConfig, CycleOutcome, Manager, ReconcileLoop, Reconciler, Requeue,
};
use koil_core::prelude::*;
use koil_store::MemoryStore;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn kind() -> ResourceKind {
    ResourceKind::new("test.koil.dev", "v1", "Counter")
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced(kind(), "default", name)
}

fn fast_config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        workers,
        backoff: BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(50)),
        watch_backoff: BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(50)),
        float_tolerance: 0.0,
    }
}

/// status.doubled = spec.n * 2, with hooks for observing and perturbing calls.
#[derive(Default)]
struct Doubler {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Option<Duration>,
    panic_once: AtomicBool,
    finalized: Mutex<Vec<ObjectKey>>,
}

impl Doubler {
    fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Default::default() }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Reconciler for Doubler {
    async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if obj.key.name == "boom" && self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("reconciler exploded");
        }
        let n = obj.spec.get("n").and_then(|v| v.as_i64()).ok_or_else(|| ReconcileError::domain("spec.n missing"))?;
        Ok((obj.clone().with_status(json!({"doubled": n * 2})), ReconcileResult::done()))
    }

    async fn finalize(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        self.finalized.lock().unwrap().push(key.clone());
        Ok(())
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.handle).await.expect("stops in time").expect("join");
    }
}

fn start(store: &Arc<MemoryStore>, reconciler: Arc<Doubler>, workers: usize) -> Running {
    let mut manager = Manager::new(store.clone(), fast_config(workers)).expect("config");
    manager.register_with(kind(), reconciler, Default::default()).expect("register");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            manager.start(cancel).await.expect("start");
        }
    });
    Running { cancel, handle }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn status_of(store: &MemoryStore, name: &str) -> Option<serde_json::Value> {
    store.object(&key(name)).and_then(|o| o.status)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converges_and_skips_redundant_writes() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 3}));
    let r = Arc::new(Doubler::default());
    let running = start(&store, r.clone(), 2);

    eventually("status", || status_of(&store, "a") == Some(json!({"doubled": 6}))).await;
    assert_eq!(store.status_writes(), 1);

    // A metadata-only change triggers another cycle that finds nothing to do.
    let calls = r.calls();
    store.touch(&key("a"));
    eventually("second cycle", || r.calls() > calls).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.status_writes(), 1);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_cycle_per_key_at_a_time_and_last_spec_wins() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 0}));
    let r = Arc::new(Doubler::slow(Duration::from_millis(10)));
    let running = start(&store, r.clone(), 4);

    for n in 1..=20 {
        store.apply(key("a"), json!({"n": n}));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    eventually("final status", || status_of(&store, "a") == Some(json!({"doubled": 40}))).await;
    running.stop().await;

    assert_eq!(r.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_reconcile_in_parallel() {
    let store = Arc::new(MemoryStore::new());
    for name in ["a", "b", "c", "d"] {
        store.apply(key(name), json!({"n": 1}));
    }
    let r = Arc::new(Doubler::slow(Duration::from_millis(50)));
    let running = start(&store, r.clone(), 4);

    eventually("all statuses", || {
        ["a", "b", "c", "d"].iter().all(|n| status_of(&store, n) == Some(json!({"doubled": 2})))
    })
    .await;
    running.stop().await;
    assert!(r.max_active.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_status_write_is_retried_with_fresh_state() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 5}));
    store.inject_status_conflicts(2);
    let r = Arc::new(Doubler::default());
    let running = start(&store, r.clone(), 1);

    eventually("status after conflicts", || status_of(&store, "a") == Some(json!({"doubled": 10}))).await;
    running.stop().await;
    assert_eq!(store.status_writes(), 1);
    assert!(r.calls() >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_write_failures_back_off_and_recover() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 7}));
    store.inject_status_failures(3);
    let r = Arc::new(Doubler::default());
    let running = start(&store, r.clone(), 1);

    eventually("status after failures", || status_of(&store, "a") == Some(json!({"doubled": 14}))).await;
    running.stop().await;
    // Three failed writes, then the one that landed.
    assert!(r.calls() >= 4);
    assert_eq!(store.status_writes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_reconciler_does_not_kill_the_worker() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("boom"), json!({"n": 1}));
    store.apply(key("fine"), json!({"n": 2}));
    let r = Arc::new(Doubler { panic_once: AtomicBool::new(true), ..Default::default() });
    let running = start(&store, r.clone(), 1);

    eventually("both statuses", || {
        status_of(&store, "boom") == Some(json!({"doubled": 2})) && status_of(&store, "fine") == Some(json!({"doubled": 4}))
    })
    .await;
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_object_is_finalized() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 1}));
    let r = Arc::new(Doubler::default());
    let running = start(&store, r.clone(), 1);

    eventually("status", || status_of(&store, "a").is_some()).await;
    store.delete(&key("a"));
    eventually("finalize", || r.finalized.lock().unwrap().contains(&key("a"))).await;
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spec_changes_by_the_reconciler_are_not_persisted() {
    struct Meddler;

    #[async_trait::async_trait]
    impl Reconciler for Meddler {
        async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> {
            let mut out = obj.clone().with_status(json!({"seen": true}));
            out.spec = json!({"n": 999});
            Ok((out, ReconcileResult::done()))
        }
    }

    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 1}));
    let mut manager = Manager::new(store.clone(), fast_config(1)).expect("config");
    manager.register(kind(), Meddler).expect("register");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager.start(cancel.clone()));

    eventually("status", || status_of(&store, "a").is_some()).await;
    cancel.cancel();
    handle.await.expect("join").expect("start");
    let obj = store.object(&key("a")).expect("present");
    assert_eq!(obj.spec, json!({"n": 1}));
    assert_eq!(obj.generation, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_in_flight_cycles() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 4}));
    let r = Arc::new(Doubler::slow(Duration::from_millis(150)));
    let running = start(&store, r.clone(), 1);

    eventually("cycle started", || r.calls() == 1).await;
    running.stop().await;
    // The cycle that was running when shutdown began still completed its write.
    assert_eq!(status_of(&store, "a"), Some(json!({"doubled": 8})));
    assert_eq!(r.calls(), 1);
}

fn single_loop(store: &Arc<MemoryStore>, reconciler: Arc<dyn Reconciler>) -> ReconcileLoop {
    ReconcileLoop::new(kind(), store.clone(), reconciler, &fast_config(1), 1)
}

#[tokio::test]
async fn domain_errors_back_off_exponentially_and_reset_on_success() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"missing": true}));
    let lp = single_loop(&store, Arc::new(Doubler::default()));
    let cancel = CancellationToken::new();

    let first = lp.reconcile_key(&key("a"), &cancel).await;
    assert!(matches!(first.outcome, CycleOutcome::Failed(ReconcileError::Domain(_))));
    assert_eq!(first.requeue, Requeue::After(Duration::from_millis(5)));
    let second = lp.reconcile_key(&key("a"), &cancel).await;
    assert_eq!(second.requeue, Requeue::After(Duration::from_millis(10)));
    assert_eq!(lp.failures(&key("a")), 2);
    assert_eq!(store.status_writes(), 0);

    store.apply(key("a"), json!({"n": 1}));
    let fixed = lp.reconcile_key(&key("a"), &cancel).await;
    assert!(matches!(fixed.outcome, CycleOutcome::Updated { .. }));
    assert_eq!(fixed.requeue, Requeue::No);
    assert_eq!(lp.failures(&key("a")), 0);
}

#[tokio::test]
async fn requeue_directives_are_honored() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("later"), json!({}));
    store.apply(key("again"), json!({}));
    let r = koil_controller::reconciler_fn(|obj| {
        let result = if obj.key.name == "later" {
            ReconcileResult::requeue_after(Duration::from_secs(30))
        } else {
            ReconcileResult::requeue()
        };
        Ok((obj.clone(), result))
    });
    let lp = single_loop(&store, Arc::new(r));
    let cancel = CancellationToken::new();

    let later = lp.reconcile_key(&key("later"), &cancel).await;
    assert_eq!(later.outcome, CycleOutcome::NoChange);
    assert_eq!(later.requeue, Requeue::After(Duration::from_secs(30)));

    // A bare requeue goes through the per-key backoff.
    let again = lp.reconcile_key(&key("again"), &cancel).await;
    assert_eq!(again.requeue, Requeue::After(Duration::from_millis(5)));
    let again = lp.reconcile_key(&key("again"), &cancel).await;
    assert_eq!(again.requeue, Requeue::After(Duration::from_millis(10)));
}

#[tokio::test]
async fn missing_object_completes_without_requeue() {
    let store = Arc::new(MemoryStore::new());
    let r = Arc::new(Doubler::default());
    let lp = single_loop(&store, r.clone());
    let report = lp.reconcile_key(&key("ghost"), &CancellationToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Deleted);
    assert_eq!(report.requeue, Requeue::No);
    assert_eq!(r.calls(), 0);
    assert_eq!(r.finalized.lock().unwrap().as_slice(), &[key("ghost")]);
}

#[tokio::test]
async fn object_deleted_mid_cycle_is_finalized_once_on_the_next_cycle() {
    struct Remover {
        store: Arc<MemoryStore>,
        finalized: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Reconciler for Remover {
        async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> {
            self.store.delete(&obj.key);
            Ok((obj.clone().with_status(json!({"seen": true})), ReconcileResult::done()))
        }

        async fn finalize(&self, _key: &ObjectKey) -> Result<(), ReconcileError> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 1}));
    let r = Arc::new(Remover { store: store.clone(), finalized: AtomicUsize::new(0) });
    let lp = single_loop(&store, r.clone());
    let cancel = CancellationToken::new();

    let first = lp.reconcile_key(&key("a"), &cancel).await;
    assert_eq!(first.outcome, CycleOutcome::Vanished);
    assert_eq!(first.outcome.label(), "vanished");
    assert_eq!(first.requeue, Requeue::Now);
    assert_eq!(r.finalized.load(Ordering::SeqCst), 0);

    let second = lp.reconcile_key(&key("a"), &cancel).await;
    assert_eq!(second.outcome, CycleOutcome::Deleted);
    assert_eq!(second.requeue, Requeue::No);
    assert_eq!(r.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(store.status_writes(), 0);
}

#[tokio::test]
async fn cancelled_cycle_is_abandoned_before_fetch() {
    let store = Arc::new(MemoryStore::new());
    store.apply(key("a"), json!({"n": 1}));
    let r = Arc::new(Doubler::default());
    let lp = single_loop(&store, r.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = lp.reconcile_key(&key("a"), &cancel).await;
    assert_eq!(report.outcome, CycleOutcome::Abandoned);
    assert_eq!(r.calls(), 0);
}
