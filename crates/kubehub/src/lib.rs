//! Koil kubehub: a `ResourceStore` backed by the Kubernetes API.
//!
//! Kinds are resolved once through discovery when the store is built; an
//! unresolvable kind is a startup error. Objects travel as `DynamicObject`s,
//! status writes go through the `/status` subresource carrying the
//! resourceVersion read at fetch time, so the API server enforces optimistic
//! concurrency (409 on mismatch).

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use koil_core::prelude::*;
use kube::{
    api::{Api, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

/// Must stay below the client read timeout so idle watches are closed by the
/// server rather than timing out on our side.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build a client from the local kubeconfig, optionally pinned to a context.
/// Without a context the usual inference applies (in-cluster, then kubeconfig).
pub async fn client_for(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            kube::Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {ctx}"))?
        }
        None => kube::Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

#[derive(Clone)]
struct ResolvedKind {
    ar: ApiResource,
    namespaced: bool,
}

pub struct KubeStore {
    client: Client,
    kinds: FxHashMap<ResourceKind, ResolvedKind>,
}

impl KubeStore {
    /// Connect and resolve `kinds` through discovery.
    pub async fn connect(context: Option<&str>, kinds: &[ResourceKind]) -> Result<Self> {
        let client = client_for(context).await?;
        Self::with_client(client, kinds).await
    }

    pub async fn with_client(client: Client, kinds: &[ResourceKind]) -> Result<Self> {
        let mut groups: Vec<&str> = kinds.iter().map(|k| k.group.as_str()).collect();
        groups.sort_unstable();
        groups.dedup();
        let discovery = Discovery::new(client.clone())
            .filter(&groups)
            .run()
            .await
            .context("running API discovery")?;
        let mut resolved = FxHashMap::default();
        for kind in kinds {
            let entry = find_api_resource(&discovery, kind)?;
            info!(kind = %kind, plural = %entry.ar.plural, namespaced = entry.namespaced, "resolved kind");
            resolved.insert(kind.clone(), entry);
        }
        Ok(Self { client, kinds: resolved })
    }

    fn resolved(&self, kind: &ResourceKind) -> Result<&ResolvedKind, StoreError> {
        self.kinds.get(kind).ok_or_else(|| StoreError::UnknownKind(kind.clone()))
    }

    fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        let r = self.resolved(&key.kind)?;
        Ok(match (&key.namespace, r.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        })
    }

    fn api_all(&self, kind: &ResourceKind) -> Result<Api<DynamicObject>, StoreError> {
        let r = self.resolved(kind)?;
        Ok(Api::all_with(self.client.clone(), &r.ar))
    }
}

fn find_api_resource(discovery: &Discovery, kind: &ResourceKind) -> Result<ResolvedKind> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == kind.group && ar.version == kind.version && ar.kind == kind.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(ResolvedKind { ar, namespaced });
            }
        }
    }
    Err(anyhow!("kind not served by the API server: {}", kind))
}

fn key_of(kind: &ResourceKind, obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey { kind: kind.clone(), namespace: obj.metadata.namespace.clone(), name })
}

fn to_object(kind: &ResourceKind, obj: DynamicObject) -> Result<ResourceObject, StoreError> {
    let key = key_of(kind, &obj).ok_or_else(|| StoreError::Transient("object missing metadata.name".to_string()))?;
    Ok(ResourceObject {
        key,
        uid: obj.metadata.uid,
        generation: obj.metadata.generation.unwrap_or(0),
        resource_version: obj.metadata.resource_version.unwrap_or_default(),
        spec: obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null),
        status: obj.data.get("status").cloned().filter(|s| !s.is_null()),
    })
}

/// Body for a PUT on the status subresource. The server ignores everything
/// but `status` and rejects the write if `resourceVersion` is stale.
fn status_body(key: &ObjectKey, status: &serde_json::Value, expected_version: &str) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "name": key.name,
        "resourceVersion": expected_version,
    });
    if let Some(ns) = &key.namespace {
        metadata["namespace"] = serde_json::Value::String(ns.clone());
    }
    serde_json::json!({
        "apiVersion": key.kind.api_version(),
        "kind": key.kind.kind,
        "metadata": metadata,
        "status": status,
    })
}

fn classify(err: kube::Error, key: &ObjectKey, expected_version: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict { key: key.clone(), expected: expected_version.to_string() }
        }
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Transient(other.to_string()),
    }
}

fn translate(kind: &ResourceKind, ev: Result<Event<DynamicObject>, watcher::Error>) -> Option<Result<WatchEvent, StoreError>> {
    match ev {
        Ok(Event::Applied(o)) => {
            key_of(kind, &o).map(|key| Ok(WatchEvent::Changed { key, change: ChangeType::Modified }))
        }
        Ok(Event::Deleted(o)) => key_of(kind, &o).map(|key| Ok(WatchEvent::Changed { key, change: ChangeType::Deleted })),
        Ok(Event::Restarted(list)) => {
            debug!(kind = %kind, count = list.len(), "watch restart");
            Some(Ok(WatchEvent::Restarted(list.iter().filter_map(|o| key_of(kind, o)).collect())))
        }
        Err(e) => {
            metrics::counter!("koil_kube_watch_errors_total", 1u64);
            Some(Err(StoreError::Transient(format!("watch failed: {e}"))))
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ResourceObject>, StoreError> {
        let api = self.api_for(key)?;
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => to_object(&key.kind, obj).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Transient(e.to_string())),
        }
    }

    async fn list(&self, kind: &ResourceKind) -> Result<Vec<ResourceObject>, StoreError> {
        let api = self.api_all(kind)?;
        let list = api
            .list(&Default::default())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        list.items.into_iter().map(|o| to_object(kind, o)).collect()
    }

    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, StoreError> {
        let api = self.api_all(kind)?;
        let kind = kind.clone();
        let cfg = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        info!(kind = %kind, "kube watch started");
        let stream = watcher::watcher(api, cfg).filter_map(move |ev| futures::future::ready(translate(&kind, ev)));
        Ok(stream.boxed())
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
        expected_version: &str,
    ) -> Result<String, StoreError> {
        let api = self.api_for(key)?;
        let body = status_body(key, status, expected_version);
        let data = serde_json::to_vec(&body).map_err(|e| StoreError::Transient(format!("encoding status: {e}")))?;
        match api.replace_status(&key.name, &PostParams::default(), data).await {
            Ok(obj) => Ok(obj.metadata.resource_version.unwrap_or_default()),
            Err(e) => {
                let err = classify(e, key, expected_version);
                if !err.is_conflict() {
                    warn!(key = %key, error = %err, "status write failed");
                }
                Err(err)
            }
        }
    }
}
