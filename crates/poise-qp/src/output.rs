//! Output assembly and debug capture.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::Serialize;

use crate::builder::{Constraint, ProblemLayout, QpWorkspace};
use crate::solver::QpStatus;
use crate::types::{SolverKind, SupportElement};

/// Physical quantities recovered from a QP solution.
#[derive(Clone, Debug, PartialEq)]
pub struct Assembled {
    pub qdd: DVector<f64>,
    pub u: DVector<f64>,
    pub beta: DVector<f64>,
    /// World-frame force per contact point.
    pub contact_forces: Vec<Vector3<f64>>,
}

/// Split `x` and map it through the torque map and friction basis of `ws`.
pub fn assemble(ws: &QpWorkspace, layout: &ProblemLayout, x: &DVector<f64>) -> Assembled {
    let qdd = x.rows(0, layout.nv).into_owned();
    let beta = x.rows(layout.beta_offset(), layout.n_beta).into_owned();
    let u = &ws.torque_qdd * &qdd + &ws.torque_beta * &beta + &ws.torque_offset;
    let contact_forces = (0..layout.n_points)
        .map(|p| ws.friction_basis.fixed_rows::<3>(3 * p) * &beta)
        .collect();
    Assembled {
        qdd,
        u,
        beta,
        contact_forces,
    }
}

/// Snapshot of one tick's problem and solution.
///
/// Captured only when enabled. The controller never reads it back.
#[derive(Clone, Debug, Serialize)]
pub struct DebugData {
    pub tick: u64,
    pub t: f64,
    pub param_set: String,
    pub active_supports: Vec<SupportElement>,
    /// Unit normal of each contact point.
    pub normals: Vec<Vector3<f64>>,
    pub friction_basis: DMatrix<f64>,
    pub qdd_des: DVector<f64>,
    pub layout: ProblemLayout,
    pub hessian: DMatrix<f64>,
    pub linear: DVector<f64>,
    pub a_eq: DMatrix<f64>,
    pub b_eq: DVector<f64>,
    pub a_in: DMatrix<f64>,
    pub b_in: DVector<f64>,
    pub inequality_rows: Vec<Constraint>,
    pub x: DVector<f64>,
    pub beta: DVector<f64>,
    pub contact_forces: Vec<Vector3<f64>>,
    pub solver: SolverKind,
    pub fast_status: Option<QpStatus>,
}

/// Per-tick context of a debug snapshot.
#[derive(Clone, Copy, Debug)]
pub struct DebugContext<'a> {
    pub tick: u64,
    pub t: f64,
    pub param_set: &'a str,
    pub active_supports: &'a [SupportElement],
    pub qdd_des: &'a DVector<f64>,
    pub solver: SolverKind,
    pub fast_status: Option<QpStatus>,
}

impl DebugData {
    pub fn capture(
        context: &DebugContext<'_>,
        ws: &QpWorkspace,
        layout: &ProblemLayout,
        x: &DVector<f64>,
        assembled: &Assembled,
    ) -> Self {
        let normals = context
            .active_supports
            .iter()
            .flat_map(|s| std::iter::repeat_n(s.normal, s.geometry.num_points()))
            .collect();
        Self {
            tick: context.tick,
            t: context.t,
            param_set: context.param_set.to_owned(),
            active_supports: context.active_supports.to_vec(),
            normals,
            friction_basis: ws.friction_basis.clone(),
            qdd_des: context.qdd_des.clone(),
            layout: layout.clone(),
            hessian: ws.hessian.clone(),
            linear: ws.linear.clone(),
            a_eq: ws.a_eq.clone(),
            b_eq: ws.b_eq.clone(),
            a_in: ws.a_in.clone(),
            b_in: ws.b_in.clone(),
            inequality_rows: ws.inequality_rows.clone(),
            x: x.clone(),
            beta: assembled.beta.clone(),
            contact_forces: assembled.contact_forces.clone(),
            solver: context.solver,
            fast_status: context.fast_status,
        }
    }
}
