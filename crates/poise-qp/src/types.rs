//! Per-tick input and output types of the controller.

use nalgebra::{DVector, Vector3, Vector6};
use poise_core::config::Bounds;
use poise_core::traits::BodyId;
use serde::Serialize;

use crate::output::DebugData;

// ---------------------------------------------------------------------------
// Supports
// ---------------------------------------------------------------------------

/// Contact geometry of a candidate support, in the frame of its body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ContactGeometry {
    /// A single contact point.
    Point { point: Vector3<f64> },
    /// A flat contact patch described by its corner points.
    Plane { points: Vec<Vector3<f64>> },
}

impl ContactGeometry {
    /// Contact points in the body frame.
    pub fn points(&self) -> &[Vector3<f64>] {
        match self {
            Self::Point { point } => std::slice::from_ref(point),
            Self::Plane { points } => points,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points().len()
    }
}

/// A candidate support as listed in the command.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SupportData {
    pub body: BodyId,
    pub geometry: ContactGeometry,
    /// Contact surface normal in the world frame. Need not be unit length.
    pub normal: Vector3<f64>,
    /// Coulomb friction coefficient.
    pub mu: f64,
    /// Whether the command allows this support to bear force.
    pub available: bool,
}

impl SupportData {
    /// An available point contact at the body origin on flat ground.
    pub fn point(body: BodyId, mu: f64) -> Self {
        Self {
            body,
            geometry: ContactGeometry::Point {
                point: Vector3::zeros(),
            },
            normal: Vector3::z(),
            mu,
            available: true,
        }
    }
}

/// Whether a resolved support bears force this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SupportMode {
    /// Force-bearing: contributes contact rows and force variables.
    Active,
    /// Allowed by the command but not in contact.
    Available,
}

/// A support after resolution against the measured state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SupportElement {
    /// Position of this support in the command's list.
    pub command_index: usize,
    pub body: BodyId,
    pub geometry: ContactGeometry,
    /// Unit surface normal, world frame.
    pub normal: Vector3<f64>,
    pub mu: f64,
    pub mode: SupportMode,
}

impl SupportElement {
    pub fn is_active(&self) -> bool {
        self.mode == SupportMode::Active
    }
}

// ---------------------------------------------------------------------------
// Body motion objectives
// ---------------------------------------------------------------------------

/// Tracking error of a body, used to add PD feedback to a desired acceleration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BodyTrackingError {
    /// `[angular; linear]` pose error, world frame.
    pub position_error: Vector6<f64>,
    /// `[angular; linear]` spatial velocity error, world frame.
    pub velocity_error: Vector6<f64>,
}

/// A desired spatial acceleration of one body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DesiredBodyMotion {
    pub body: BodyId,
    /// Desired `[ω̇; v̇]` in the world frame. NaN components are not controlled.
    pub body_vdot: Vector6<f64>,
    /// Positive: cost weight. Negative: hard equality. Zero: bounds only.
    pub weight: f64,
    /// Acceleration bounds for this tick. Falls back to the parameter set.
    pub accel_bounds: Option<Bounds>,
    pub tracking: Option<BodyTrackingError>,
}

// ---------------------------------------------------------------------------
// Command and tick input
// ---------------------------------------------------------------------------

/// Decoded command for one tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QpInput {
    pub param_set_name: String,
    pub q_des: DVector<f64>,
    pub supports: Vec<SupportData>,
    pub body_motions: Vec<DesiredBodyMotion>,
    /// Commanded centroidal angular momentum rate.
    pub kdot_des: Vector3<f64>,
}

impl QpInput {
    /// A command holding `q_des` with the given supports and nothing else.
    pub fn hold(param_set_name: impl Into<String>, q_des: DVector<f64>, supports: Vec<SupportData>) -> Self {
        Self {
            param_set_name: param_set_name.into(),
            q_des,
            supports,
            body_motions: Vec::new(),
            kdot_des: Vector3::zeros(),
        }
    }
}

/// Everything the controller consumes in one tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TickInput {
    /// Controller time in seconds.
    pub t: f64,
    pub q: DVector<f64>,
    pub qd: DVector<f64>,
    /// Measured contact, one entry per command support.
    pub contact_sensed: Vec<bool>,
    pub command: QpInput,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Commands sent to the actuation layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QpControllerOutput {
    pub q_ref: DVector<f64>,
    pub qd_ref: DVector<f64>,
    pub qdd: DVector<f64>,
    /// Actuator efforts, one per actuator.
    pub u: DVector<f64>,
}

/// Which backend produced the accepted solution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SolverKind {
    /// Warm-started active-set solver.
    Fast,
    /// Interior-point fallback.
    Robust,
}

/// Result of a successful tick.
#[derive(Clone, Debug, Serialize)]
pub struct TickOutput {
    pub output: QpControllerOutput,
    /// World-frame force at each active contact point, in support order.
    pub contact_forces: Vec<Vector3<f64>>,
    pub active_supports: Vec<SupportElement>,
    pub solver: SolverKind,
    pub solve_time_us: u64,
    pub debug: Option<Box<DebugData>>,
}
