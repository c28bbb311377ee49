//! Dynamics quantities evaluated once per tick.
//!
//! Everything the builder needs from the dynamics engine is gathered here and
//! size-checked, so the builder itself cannot fail.

use nalgebra::{DMatrix, DVector, Vector3, Vector6};
use poise_core::config::Bounds;
use poise_core::traits::{BodyId, RigidBodyDynamics};

use crate::error::{TickError, check_dim};
use crate::types::SupportElement;

/// One force-bearing contact point.
#[derive(Clone, Debug)]
pub struct ContactPoint {
    /// Index into the active support list.
    pub support: usize,
    pub body: BodyId,
    /// World-frame unit normal.
    pub normal: Vector3<f64>,
    pub mu: f64,
    /// Linear point Jacobian (3 × nv).
    pub jacobian: DMatrix<f64>,
    pub jdot_v: Vector3<f64>,
}

/// A body acceleration objective, resolved for this tick.
#[derive(Clone, Debug)]
pub struct BodyObjective {
    pub body: BodyId,
    /// Desired `[ω̇; v̇]` after PD feedback. NaN components are skipped.
    pub vdot_des: Vector6<f64>,
    pub weight: f64,
    pub bounds: Option<Bounds>,
    /// Spatial body Jacobian (6 × nv).
    pub jacobian: DMatrix<f64>,
    pub jdot_v: Vector6<f64>,
}

/// Dynamics terms at the current `(q, qd)`.
#[derive(Clone, Debug)]
pub struct DynamicsTerms {
    pub h: DMatrix<f64>,
    pub c: DVector<f64>,
    pub contacts: Vec<ContactPoint>,
    pub objectives: Vec<BodyObjective>,
    /// Angular rows of the centroidal momentum matrix (3 × nv).
    pub ak: DMatrix<f64>,
    pub akdot_v: Vector3<f64>,
}

/// Desired body motion before Jacobian evaluation.
#[derive(Clone, Debug)]
pub struct ObjectiveSpec {
    pub body: BodyId,
    pub vdot_des: Vector6<f64>,
    pub weight: f64,
    pub bounds: Option<Bounds>,
}

/// Evaluate dynamics terms for the active supports and body objectives.
pub fn evaluate<D: RigidBodyDynamics + ?Sized>(
    dynamics: &D,
    q: &DVector<f64>,
    qd: &DVector<f64>,
    supports: &[SupportElement],
    objectives: Vec<ObjectiveSpec>,
) -> Result<DynamicsTerms, TickError> {
    let nv = q.len();
    let h = dynamics.mass_matrix(q);
    check_dim("mass matrix rows", nv, h.nrows())?;
    check_dim("mass matrix columns", nv, h.ncols())?;
    let c = dynamics.bias(q, qd);
    check_dim("bias vector", nv, c.len())?;

    let mut contacts = Vec::new();
    for (support, element) in supports.iter().enumerate() {
        for point in element.geometry.points() {
            let jacobian = dynamics.point_jacobian(q, element.body, point);
            check_dim("point jacobian rows", 3, jacobian.nrows())?;
            check_dim("point jacobian columns", nv, jacobian.ncols())?;
            contacts.push(ContactPoint {
                support,
                body: element.body,
                normal: element.normal,
                mu: element.mu,
                jacobian,
                jdot_v: dynamics.point_jacobian_dot_times_v(q, qd, element.body, point),
            });
        }
    }

    let objectives = objectives
        .into_iter()
        .map(|spec| {
            let jacobian = dynamics.body_jacobian(q, spec.body);
            check_dim("body jacobian rows", 6, jacobian.nrows())?;
            check_dim("body jacobian columns", nv, jacobian.ncols())?;
            if let Some(bounds) = &spec.bounds {
                check_dim("body acceleration bounds", 6, bounds.min.len())?;
                check_dim("body acceleration bounds", 6, bounds.max.len())?;
            }
            Ok(BodyObjective {
                body: spec.body,
                vdot_des: spec.vdot_des,
                weight: spec.weight,
                bounds: spec.bounds,
                jdot_v: dynamics.body_jacobian_dot_times_v(q, qd, spec.body),
                jacobian,
            })
        })
        .collect::<Result<Vec<_>, TickError>>()?;

    let centroidal = dynamics.centroidal_momentum_matrix(q);
    check_dim("centroidal momentum matrix rows", 6, centroidal.nrows())?;
    check_dim("centroidal momentum matrix columns", nv, centroidal.ncols())?;
    let ak = centroidal.rows(0, 3).into_owned();
    let akdot_v = dynamics
        .centroidal_momentum_matrix_dot_times_v(q, qd)
        .fixed_rows::<3>(0)
        .into_owned();

    Ok(DynamicsTerms {
        h,
        c,
        contacts,
        objectives,
        ak,
        akdot_v,
    })
}
