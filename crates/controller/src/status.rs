//! Conditional status persistence.

use std::sync::Arc;

use koil_core::prelude::*;
use serde_json::{Number, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// Written; the store returned a new resource version.
    Updated { resource_version: String },
    /// Proposed status equals the stored one; nothing was written.
    Unchanged,
    /// The object changed since it was fetched; the write was rejected.
    Conflict,
    StoreError(StoreError),
}

impl StatusOutcome {
    fn label(&self) -> &'static str {
        match self {
            StatusOutcome::Updated { .. } => "updated",
            StatusOutcome::Unchanged => "unchanged",
            StatusOutcome::Conflict => "conflict",
            StatusOutcome::StoreError(_) => "error",
        }
    }
}

/// Writes the status subtree only, and only when it changed.
pub struct StatusWriter {
    store: Arc<dyn ResourceStore>,
    tolerance: f64,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn ResourceStore>, tolerance: f64) -> Self {
        Self { store, tolerance: tolerance.max(0.0) }
    }

    /// Whether `proposed` would change `stored`. A reconciler that proposes no
    /// status at all never clears an existing one.
    pub fn differs(&self, stored: Option<&Value>, proposed: Option<&Value>) -> bool {
        match (stored, proposed) {
            (_, None) => false,
            (None, Some(p)) => !p.is_null(),
            (Some(s), Some(p)) => !status_equal(s, p, self.tolerance),
        }
    }

    /// Persist `updated.status` if it differs from `fetched.status`, conditioned
    /// on `fetched.resource_version` still being current in the store.
    pub async fn update_status_if_changed(&self, fetched: &ResourceObject, updated: &ResourceObject) -> StatusOutcome {
        let proposed = match updated.status.as_ref() {
            Some(p) if self.differs(fetched.status.as_ref(), Some(p)) => p,
            _ => return StatusOutcome::Unchanged,
        };
        let key = &fetched.key;
        let outcome = match self.store.update_status(key, proposed, &fetched.resource_version).await {
            Ok(resource_version) => {
                debug!(key = %key, from = %fetched.resource_version, to = %resource_version, "status updated");
                StatusOutcome::Updated { resource_version }
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(key = %key, rv = %fetched.resource_version, "status write conflicted");
                StatusOutcome::Conflict
            }
            Err(e) => {
                warn!(key = %key, error = %e, "status write failed");
                StatusOutcome::StoreError(e)
            }
        };
        metrics::counter!(
            "koil_status_writes_total",
            1u64,
            "kind" => key.kind.gvk_key(),
            "result" => outcome.label()
        );
        outcome
    }
}

/// Structural equality over JSON status values. Numbers compare by value, so
/// `16` equals `16.0`; floats also match within `tolerance` relative to the
/// larger magnitude (zero means exact).
pub fn status_equal(a: &Value, b: &Value, tolerance: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y, tolerance),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| status_equal(x, y, tolerance))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm.iter().all(|(k, v)| ym.get(k).is_some_and(|w| status_equal(v, w, tolerance)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number, tolerance: f64) -> bool {
    if x == y {
        return true;
    }
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) if a == b => true,
        (Some(a), Some(b)) => (a - b).abs() <= tolerance * a.abs().max(b.abs()),
        _ => false,
    }
}
