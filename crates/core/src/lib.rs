//! Koil core types: resource identities, objects, the store contract and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Group/Version/Kind of a reconciled resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Value of an object's `apiVersion` field.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
pub struct ParseKindError(pub String);

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(String::new(), *version, *kind))
            }
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(ParseKindError(key.to_string())),
        }
    }
}

/// Unique key of one object: used for queueing and store lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A stored object as the controller sees it.
///
/// `spec` is read-only input for the controller; `status` is owned by it.
/// `resource_version` changes on every successful store mutation and is the
/// token for optimistic concurrency on status writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub key: ObjectKey,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

impl ResourceObject {
    pub fn new(key: ObjectKey, spec: serde_json::Value) -> Self {
        Self { key, uid: None, generation: 0, resource_version: String::new(), spec, status: None }
    }

    pub fn with_status(mut self, status: serde_json::Value) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// Notification from a store watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed { key: ObjectKey, change: ChangeType },
    /// The store relisted on its own; these are all objects currently present.
    Restarted(Vec<ObjectKey>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The object changed since it was read; the write was rejected.
    #[error("conflict on {key}: expected resourceVersion {expected}")]
    Conflict { key: ObjectKey, expected: String },
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("kind not served by store: {0}")]
    UnknownKind(ResourceKind),
    /// Network, timeout or server side failure; always worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Contract of the authoritative object store.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ResourceObject>, StoreError>;

    async fn list(&self, kind: &ResourceKind) -> Result<Vec<ResourceObject>, StoreError>;

    /// Subscribe to changes of one kind. The stream ends or yields an error
    /// when the subscription is lost.
    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, StoreError>;

    /// Replace the status subtree, conditioned on `expected_version` still
    /// being current. Returns the new resource version.
    async fn update_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
        expected_version: &str,
    ) -> Result<String, StoreError>;
}

/// Directive returned by a reconciler alongside its computed object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue through the per-object backoff.
    pub requeue: bool,
    /// Requeue after a fixed delay; zero means no timed requeue.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self { requeue: true, requeue_after: None }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self { requeue: false, requeue_after: Some(delay) }
    }

    /// The effective timed delay, ignoring a zero duration.
    pub fn delay(&self) -> Option<Duration> {
        self.requeue_after.filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    /// The spec is invalid or cannot be reconciled right now.
    #[error("domain error: {0}")]
    Domain(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn domain(msg: impl Into<String>) -> Self {
        ReconcileError::Domain(msg.into())
    }
}

pub mod prelude {
    pub use super::{
        ChangeType, ObjectKey, ReconcileError, ReconcileResult, ResourceKind, ResourceObject, ResourceStore,
        StoreError, WatchEvent, WatchStream,
    };
}
