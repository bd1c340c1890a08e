//! Koil store: in-RAM versioned object store implementing `ResourceStore`.
//!
//! Every mutation bumps a store-wide counter that doubles as the object's
//! resource version, so versions are unique and monotonic like an API server's.

#![forbid(unsafe_code)]

mod manifest;

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use koil_core::prelude::*;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

pub use manifest::{parse_manifests, Manifest};

const EVENT_CAPACITY: usize = 1024;

struct Inner {
    objects: FxHashMap<ObjectKey, ResourceObject>,
    version: u64,
    status_writes: u64,
    inject_conflicts: u32,
    inject_failures: u32,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.version = self.version.saturating_add(1);
        self.version.to_string()
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: Mutex<broadcast::Sender<WatchEvent>>,
    version_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (version_tx, _) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner {
                objects: FxHashMap::default(),
                version: 0,
                status_writes: 0,
                inject_conflicts: 0,
                inject_failures: 0,
            }),
            events: Mutex::new(events),
            version_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, key: ObjectKey, change: ChangeType, version: u64) {
        let tx = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        // No receivers is fine: nobody is watching yet.
        let _ = tx.send(WatchEvent::Changed { key, change });
        self.version_tx.send_replace(version);
    }

    /// Create an object or replace its spec, as an external actor would.
    /// Generation advances only when the spec actually changes.
    pub fn apply(&self, key: ObjectKey, spec: serde_json::Value) -> ResourceObject {
        let (obj, change, version) = {
            let mut inner = self.lock();
            match inner.objects.get(&key).cloned() {
                Some(existing) if existing.spec == spec => return existing,
                Some(mut existing) => {
                    existing.spec = spec;
                    existing.generation = existing.generation.saturating_add(1);
                    existing.resource_version = inner.bump();
                    inner.objects.insert(key.clone(), existing.clone());
                    (existing, ChangeType::Modified, inner.version)
                }
                None => {
                    let mut obj = ResourceObject::new(key.clone(), spec);
                    obj.uid = Some(uuid::Uuid::new_v4().to_string());
                    obj.generation = 1;
                    obj.resource_version = inner.bump();
                    inner.objects.insert(key.clone(), obj.clone());
                    (obj, ChangeType::Added, inner.version)
                }
            }
        };
        debug!(key = %key, rv = %obj.resource_version, ?change, "object applied");
        self.publish(key, change, version);
        obj
    }

    /// Store a complete object (spec and status), e.g. from a seed manifest.
    pub fn insert(&self, mut obj: ResourceObject) -> ResourceObject {
        let key = obj.key.clone();
        let (change, version) = {
            let mut inner = self.lock();
            let change = match inner.objects.get(&key) {
                Some(existing) => {
                    obj.uid = existing.uid.clone();
                    obj.generation = if existing.spec == obj.spec {
                        existing.generation
                    } else {
                        existing.generation.saturating_add(1)
                    };
                    ChangeType::Modified
                }
                None => {
                    if obj.uid.is_none() {
                        obj.uid = Some(uuid::Uuid::new_v4().to_string());
                    }
                    obj.generation = obj.generation.max(1);
                    ChangeType::Added
                }
            };
            obj.resource_version = inner.bump();
            inner.objects.insert(key.clone(), obj.clone());
            (change, inner.version)
        };
        self.publish(key, change, version);
        obj
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<ResourceObject> {
        let (removed, version) = {
            let mut inner = self.lock();
            let removed = inner.objects.remove(key)?;
            inner.bump();
            (removed, inner.version)
        };
        debug!(key = %key, "object deleted");
        self.publish(key.clone(), ChangeType::Deleted, version);
        Some(removed)
    }

    /// Bump an object's resource version without touching spec or status, as
    /// a metadata-only write by another actor would.
    pub fn touch(&self, key: &ObjectKey) -> Option<String> {
        let (rv, version) = {
            let mut inner = self.lock();
            if !inner.objects.contains_key(key) {
                return None;
            }
            let rv = inner.bump();
            let version = inner.version;
            let obj = inner.objects.get_mut(key)?;
            obj.resource_version = rv.clone();
            (rv, version)
        };
        self.publish(key.clone(), ChangeType::Modified, version);
        Some(rv)
    }

    /// Drop every live watch subscription; their streams end.
    pub fn sever_watches(&self) {
        let mut tx = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let (fresh, _) = broadcast::channel(EVENT_CAPACITY);
        let old = std::mem::replace(&mut *tx, fresh);
        info!(receivers = old.receiver_count(), "severing watch subscriptions");
    }

    /// The next `n` status writes lose a race with another writer: the object's
    /// version moves on and the write is rejected as a conflict.
    pub fn inject_status_conflicts(&self, n: u32) {
        self.lock().inject_conflicts = n;
    }

    /// The next `n` status writes fail with a transient error.
    pub fn inject_status_failures(&self, n: u32) {
        self.lock().inject_failures = n;
    }

    /// Successful status writes so far.
    pub fn status_writes(&self) -> u64 {
        self.lock().status_writes
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ResourceObject> {
        self.lock().objects.get(key).cloned()
    }

    /// All objects, ordered by key.
    pub fn snapshot(&self) -> Vec<ResourceObject> {
        let mut items: Vec<_> = self.lock().objects.values().cloned().collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// Receiver that observes the store-wide version after every mutation.
    pub fn subscribe_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Insert every object of a multi-document YAML manifest.
    pub fn load_manifests(&self, yaml: &str) -> anyhow::Result<usize> {
        let objs = parse_manifests(yaml)?;
        let n = objs.len();
        for m in objs {
            self.insert(m.into_object());
        }
        info!(objects = n, "seeded store from manifests");
        Ok(n)
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ResourceObject>, StoreError> {
        Ok(self.object(key))
    }

    async fn list(&self, kind: &ResourceKind) -> Result<Vec<ResourceObject>, StoreError> {
        let mut items: Vec<_> = self.lock().objects.values().filter(|o| &o.key.kind == kind).cloned().collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, StoreError> {
        let rx = self.events.lock().unwrap_or_else(PoisonError::into_inner).subscribe();
        let stream = futures::stream::unfold((rx, kind.clone()), |(mut rx, kind)| async move {
            loop {
                match rx.recv().await {
                    Ok(WatchEvent::Changed { key, change }) if key.kind == kind => {
                        return Some((Ok(WatchEvent::Changed { key, change }), (rx, kind)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let err = StoreError::Transient(format!("watch lagged behind by {n} events"));
                        return Some((Err(err), (rx, kind)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
        expected_version: &str,
    ) -> Result<String, StoreError> {
        let (rv, version) = {
            let mut inner = self.lock();
            if inner.inject_failures > 0 {
                inner.inject_failures -= 1;
                return Err(StoreError::Transient("injected status write failure".to_string()));
            }
            if !inner.objects.contains_key(key) {
                return Err(StoreError::NotFound(key.clone()));
            }
            if inner.inject_conflicts > 0 {
                inner.inject_conflicts -= 1;
                let rv = inner.bump();
                if let Some(obj) = inner.objects.get_mut(key) {
                    obj.resource_version = rv;
                }
            }
            let current = inner.objects.get(key).map(|o| o.resource_version.clone()).unwrap_or_default();
            if current != expected_version {
                drop(inner);
                metrics::counter!("koil_store_conflicts_total", 1u64);
                return Err(StoreError::Conflict { key: key.clone(), expected: expected_version.to_string() });
            }
            let rv = inner.bump();
            let version = inner.version;
            inner.status_writes = inner.status_writes.saturating_add(1);
            if let Some(obj) = inner.objects.get_mut(key) {
                obj.status = Some(status.clone());
                obj.resource_version = rv.clone();
            }
            (rv, version)
        };
        self.publish(key.clone(), ChangeType::Modified, version);
        Ok(rv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced(ResourceKind::new("test.koil.dev", "v1", "Thing"), "default", name)
    }

    #[test]
    fn apply_only_bumps_generation_on_spec_change() {
        let s = MemoryStore::new();
        let a = s.apply(key("a"), json!({"x": 1}));
        assert_eq!(a.generation, 1);
        let same = s.apply(key("a"), json!({"x": 1}));
        assert_eq!(same.resource_version, a.resource_version);
        let b = s.apply(key("a"), json!({"x": 2}));
        assert_eq!(b.generation, 2);
        assert_ne!(b.resource_version, a.resource_version);
        assert_eq!(b.uid, a.uid);
    }

    #[tokio::test]
    async fn status_write_requires_current_version() {
        let s = MemoryStore::new();
        let a = s.apply(key("a"), json!({"x": 1}));
        let rv = s.update_status(&key("a"), &json!({"y": 1}), &a.resource_version).await.expect("write");
        assert_ne!(rv, a.resource_version);
        let stale = s.update_status(&key("a"), &json!({"y": 2}), &a.resource_version).await;
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
        let got = s.object(&key("a")).expect("present");
        assert_eq!(got.status, Some(json!({"y": 1})));
        assert_eq!(got.spec, json!({"x": 1}));
        assert_eq!(got.generation, 1);
        assert_eq!(s.status_writes(), 1);
    }

    #[tokio::test]
    async fn missing_object_status_write_is_not_found() {
        let s = MemoryStore::new();
        let r = s.update_status(&key("nope"), &json!({}), "1").await;
        assert!(matches!(r, Err(StoreError::NotFound(_))));
    }
}
