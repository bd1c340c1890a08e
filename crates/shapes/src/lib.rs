//! Koil shapes: the `Circle` and `Square` kinds and their reconcilers.
//!
//! Both derive an `area` from their spec. Areas are computed in `f32`, so a
//! stored status written by another single-precision client compares equal.

#![forbid(unsafe_code)]

mod crd;

use std::f32::consts::PI;
use std::sync::Arc;

use koil_controller::{ControllerError, DeriveStatus, LoopOptions, Manager, StatusReconciler};
use koil_core::prelude::*;
use serde::{Deserialize, Serialize};

pub use crd::{crd_for, crds};

pub const GROUP: &str = "shapes.koil.dev";
pub const VERSION: &str = "v1alpha1";

pub fn circle_kind() -> ResourceKind {
    ResourceKind::new(GROUP, VERSION, "Circle")
}

pub fn square_kind() -> ResourceKind {
    ResourceKind::new(GROUP, VERSION, "Square")
}

/// Every kind this crate reconciles.
pub fn kinds() -> Vec<ResourceKind> {
    vec![circle_kind(), square_kind()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CircleSpec {
    #[serde(default)]
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SquareSpec {
    #[serde(default)]
    pub width: f32,
}

/// Status shared by both kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaStatus {
    pub area: f32,
}

fn checked_length(field: &str, v: f32) -> Result<f32, ReconcileError> {
    if !v.is_finite() {
        return Err(ReconcileError::domain(format!("{field} must be finite, got {v}")));
    }
    if v < 0.0 {
        return Err(ReconcileError::domain(format!("{field} must not be negative, got {v}")));
    }
    Ok(v)
}

/// Square in double precision, then narrow.
fn squared(v: f32) -> f32 {
    f64::from(v).powi(2) as f32
}

fn checked_area(area: f32) -> Result<AreaStatus, ReconcileError> {
    if area.is_finite() {
        Ok(AreaStatus { area })
    } else {
        Err(ReconcileError::domain("area overflows a 32-bit float"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Circle;

impl DeriveStatus for Circle {
    type Spec = CircleSpec;
    type Status = AreaStatus;

    fn derive(&self, spec: &CircleSpec) -> Result<AreaStatus, ReconcileError> {
        let r = checked_length("radius", spec.radius)?;
        checked_area(squared(r) * PI)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Square;

impl DeriveStatus for Square {
    type Spec = SquareSpec;
    type Status = AreaStatus;

    fn derive(&self, spec: &SquareSpec) -> Result<AreaStatus, ReconcileError> {
        let w = checked_length("width", spec.width)?;
        checked_area(squared(w))
    }
}

/// Register both shape reconcilers. `workers` overrides the manager default
/// per kind when present.
pub fn register_all(
    manager: &mut Manager,
    workers: impl Fn(&ResourceKind) -> Option<usize>,
) -> Result<(), ControllerError> {
    let circle = circle_kind();
    let square = square_kind();
    manager.register_with(
        circle.clone(),
        Arc::new(StatusReconciler::new(Circle)),
        LoopOptions { workers: workers(&circle) },
    )?;
    manager.register_with(
        square.clone(),
        Arc::new(StatusReconciler::new(Square)),
        LoopOptions { workers: workers(&square) },
    )?;
    tracing::debug!(%circle, %square, "shape reconcilers registered");
    Ok(())
}
