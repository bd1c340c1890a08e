use koil_core::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Business logic for one resource kind.
///
/// `reconcile` must be a deterministic, idempotent function of the object's
/// spec: calling it twice with the same spec yields the same status. Only the
/// status of the returned object is persisted; spec changes are ignored.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError>;

    /// Called when a queued object no longer exists in the store.
    async fn finalize(&self, _key: &ObjectKey) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// A typed pure function from spec to status.
pub trait DeriveStatus: Send + Sync + 'static {
    type Spec: DeserializeOwned + Send;
    type Status: Serialize + Send;

    fn derive(&self, spec: &Self::Spec) -> Result<Self::Status, ReconcileError>;

    /// Directive returned with every derived status. Defaults to "wait for the
    /// next change".
    fn result(&self, _spec: &Self::Spec) -> ReconcileResult {
        ReconcileResult::done()
    }
}

/// Adapts a `DeriveStatus` into a `Reconciler` by decoding the spec and
/// encoding the derived status. A spec that does not decode is a domain error.
pub struct StatusReconciler<D> {
    derive: D,
}

impl<D: DeriveStatus> StatusReconciler<D> {
    pub fn new(derive: D) -> Self {
        Self { derive }
    }
}

#[async_trait::async_trait]
impl<D: DeriveStatus> Reconciler for StatusReconciler<D> {
    async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> {
        let spec: D::Spec = serde_json::from_value(obj.spec.clone())
            .map_err(|e| ReconcileError::domain(format!("invalid spec for {}: {e}", obj.key)))?;
        let status = self.derive.derive(&spec)?;
        let status = serde_json::to_value(&status)
            .map_err(|e| ReconcileError::domain(format!("encoding status for {}: {e}", obj.key)))?;
        let result = self.derive.result(&spec);
        Ok((obj.clone().with_status(status), result))
    }
}

type ReconcileFn =
    dyn Fn(&ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> + Send + Sync + 'static;

/// A synchronous closure used as a reconciler.
pub struct FnReconciler {
    f: Box<ReconcileFn>,
}

pub fn reconciler_fn<F>(f: F) -> FnReconciler
where
    F: Fn(&ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> + Send + Sync + 'static,
{
    FnReconciler { f: Box::new(f) }
}

#[async_trait::async_trait]
impl Reconciler for FnReconciler {
    async fn reconcile(&self, obj: &ResourceObject) -> Result<(ResourceObject, ReconcileResult), ReconcileError> {
        (self.f)(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct DoubleSpec {
        n: i64,
    }

    #[derive(Serialize)]
    struct DoubleStatus {
        doubled: i64,
    }

    struct Double;

    impl DeriveStatus for Double {
        type Spec = DoubleSpec;
        type Status = DoubleStatus;

        fn derive(&self, spec: &DoubleSpec) -> Result<DoubleStatus, ReconcileError> {
            if spec.n < 0 {
                return Err(ReconcileError::domain("n must not be negative"));
            }
            Ok(DoubleStatus { doubled: spec.n * 2 })
        }
    }

    fn obj(spec: serde_json::Value) -> ResourceObject {
        let kind = ResourceKind::new("test.koil.dev", "v1", "Double");
        ResourceObject::new(ObjectKey::cluster(kind, "d"), spec)
    }

    #[tokio::test]
    async fn derives_status_and_keeps_spec() {
        let r = StatusReconciler::new(Double);
        let (out, result) = r.reconcile(&obj(json!({"n": 21}))).await.expect("ok");
        assert_eq!(out.status, Some(json!({"doubled": 42})));
        assert_eq!(out.spec, json!({"n": 21}));
        assert_eq!(result, ReconcileResult::done());
    }

    #[tokio::test]
    async fn undecodable_spec_is_a_domain_error() {
        let r = StatusReconciler::new(Double);
        let err = r.reconcile(&obj(json!({"n": "many"}))).await.expect_err("bad spec");
        assert!(matches!(err, ReconcileError::Domain(_)));
        let err = r.reconcile(&obj(json!({"n": -1}))).await.expect_err("negative");
        assert_eq!(err, ReconcileError::domain("n must not be negative"));
    }

    #[tokio::test]
    async fn default_finalize_is_a_no_op() {
        let r = reconciler_fn(|o| Ok((o.clone(), ReconcileResult::done())));
        let key = obj(json!({})).key;
        assert!(r.finalize(&key).await.is_ok());
    }
}
