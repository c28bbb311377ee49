//! QP problem construction.
//!
//! # Formulation
//!
//! Decision variables: `x = [qdd (nv); β (4 per contact point); ε (3 per contact point)]`
//!
//! Cost: `½ xᵀ H x + fᵀ x` made of
//! - joint acceleration tracking `Σ w_qdd (qdd - qdd_des)²`
//! - positive-weight body objectives `w ‖Jb qdd + J̇b qd - v̇_des‖²`
//! - force regularization `w_grf ‖β‖²` and slack penalty `w_slack ‖ε‖²`
//! - angular momentum rate tracking `(k̇_des - Ak qdd - Ȧk qd)ᵀ W (…)`
//!
//! Subject to (equalities first):
//! - Floating-base dynamics: `H_f qdd - (Jcᵀ E)_f β = -C_f`
//! - Contact points: `Jc qdd + ε = -J̇c qd - kp_accel Jc qd`
//! - Negative-weight body objectives: `Jb qdd = v̇_des - J̇b qd`
//!
//! and inequalities `A x <= b`, in this order: actuator limits through the
//! torque map `u = Tq qdd + Tb β + t0`, body acceleration bounds, joint
//! acceleration bounds, `β >= 0`, and `|ε| <= slack_limit`. Non-finite bounds
//! produce no row.

use std::hash::{DefaultHasher, Hash, Hasher};

use nalgebra::{DMatrix, DVector, Vector3};
use poise_core::config::ControllerParams;
use poise_core::traits::BodyId;
use serde::Serialize;

use crate::robot::RobotPropertyCache;
use crate::solver::QpProblem;
use crate::terms::DynamicsTerms;
use crate::types::SupportElement;

/// Diagonal regularization added to the Hessian.
pub const REG: f64 = 1e-8;

/// Friction cone edges per contact point.
pub const EDGES_PER_POINT: usize = 4;

// ---------------------------------------------------------------------------
// Friction cone
// ---------------------------------------------------------------------------

/// Edges of the four-sided pyramid inscribed in the friction cone.
///
/// Edges are unit vectors `(n ± μ t1)/‖·‖` and `(n ± μ t2)/‖·‖` where `t1`,
/// `t2` complete `n` to an orthonormal frame.
pub fn friction_edges(normal: &Vector3<f64>, mu: f64) -> [Vector3<f64>; EDGES_PER_POINT] {
    let n = normal.normalize();
    let reference = if n.z.abs() < 0.9 {
        Vector3::z()
    } else {
        Vector3::x()
    };
    let t1 = n.cross(&reference).normalize();
    let t2 = n.cross(&t1);
    [
        (n + t1 * mu).normalize(),
        (n - t1 * mu).normalize(),
        (n + t2 * mu).normalize(),
        (n - t2 * mu).normalize(),
    ]
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Sizes and offsets of one built problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProblemLayout {
    pub nv: usize,
    pub nu: usize,
    pub n_points: usize,
    pub n_beta: usize,
    pub n_eps: usize,
    pub nx: usize,
    pub n_eq: usize,
    pub n_in: usize,
    /// `(body, contact points)` of every active support, in order.
    pub supports: Vec<(BodyId, usize)>,
    /// Body of every motion objective, in order.
    pub objectives: Vec<BodyId>,
    /// Hash of what each inequality row constrains, bounds excluded.
    pub row_signature: u64,
}

impl ProblemLayout {
    pub const fn beta_offset(&self) -> usize {
        self.nv
    }

    pub const fn eps_offset(&self) -> usize {
        self.nv + self.n_beta
    }
}

/// One inequality row, as it was generated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum Constraint {
    Torque {
        actuator: usize,
        upper: bool,
        limit: f64,
    },
    BodyAccel {
        objective: usize,
        component: usize,
        upper: bool,
        limit: f64,
    },
    Qdd {
        dof: usize,
        upper: bool,
        limit: f64,
    },
    /// `β >= 0`.
    Force { beta: usize },
    Slack {
        eps: usize,
        upper: bool,
        limit: f64,
    },
}

impl Constraint {
    /// What the row constrains, without its bound.
    fn shape(&self) -> (u8, usize, usize, bool) {
        match *self {
            Self::Torque {
                actuator, upper, ..
            } => (0, actuator, 0, upper),
            Self::BodyAccel {
                objective,
                component,
                upper,
                ..
            } => (1, objective, component, upper),
            Self::Qdd { dof, upper, .. } => (2, dof, 0, upper),
            Self::Force { beta } => (3, beta, 0, false),
            Self::Slack { eps, upper, .. } => (4, eps, 0, upper),
        }
    }
}

fn row_signature(rows: &[Constraint]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for row in rows {
        row.shape().hash(&mut hasher);
    }
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Dims {
    nv: usize,
    nu: usize,
    nx: usize,
    n_beta: usize,
    n_contact_rows: usize,
    n_eq: usize,
    n_in: usize,
}

/// Problem buffers reused across ticks.
///
/// Buffers are reallocated only when the problem dimensions change, or after
/// [`invalidate`](Self::invalidate).
#[derive(Debug)]
pub struct QpWorkspace {
    pub hessian: DMatrix<f64>,
    pub linear: DVector<f64>,
    pub a_eq: DMatrix<f64>,
    pub b_eq: DVector<f64>,
    pub a_in: DMatrix<f64>,
    pub b_in: DVector<f64>,
    /// `Tq` of the torque map (nu × nv).
    pub torque_qdd: DMatrix<f64>,
    /// `Tb` of the torque map (nu × nβ).
    pub torque_beta: DMatrix<f64>,
    /// `t0` of the torque map (nu).
    pub torque_offset: DVector<f64>,
    /// Block-diagonal friction cone edges `E` (3 per point × nβ).
    pub friction_basis: DMatrix<f64>,
    /// `Jcᵀ E` (nv × nβ): generalized force per unit β.
    pub contact_force_map: DMatrix<f64>,
    pub inequality_rows: Vec<Constraint>,
    dims: Option<Dims>,
    reallocations: usize,
}

impl Default for QpWorkspace {
    fn default() -> Self {
        Self {
            hessian: DMatrix::zeros(0, 0),
            linear: DVector::zeros(0),
            a_eq: DMatrix::zeros(0, 0),
            b_eq: DVector::zeros(0),
            a_in: DMatrix::zeros(0, 0),
            b_in: DVector::zeros(0),
            torque_qdd: DMatrix::zeros(0, 0),
            torque_beta: DMatrix::zeros(0, 0),
            torque_offset: DVector::zeros(0),
            friction_basis: DMatrix::zeros(0, 0),
            contact_force_map: DMatrix::zeros(0, 0),
            inequality_rows: Vec::new(),
            dims: None,
            reallocations: 0,
        }
    }
}

impl QpWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force reallocation on the next build.
    pub fn invalidate(&mut self) {
        self.dims = None;
    }

    /// Number of times the buffers were (re)allocated.
    pub const fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// View of the last built problem.
    pub fn problem(&self) -> QpProblem<'_> {
        QpProblem {
            hessian: &self.hessian,
            linear: &self.linear,
            a_eq: &self.a_eq,
            b_eq: &self.b_eq,
            a_in: &self.a_in,
            b_in: &self.b_in,
        }
    }

    fn prepare(&mut self, dims: Dims) {
        if self.dims == Some(dims) {
            self.hessian.fill(0.0);
            self.linear.fill(0.0);
            self.a_eq.fill(0.0);
            self.b_eq.fill(0.0);
            self.a_in.fill(0.0);
            self.b_in.fill(0.0);
            self.friction_basis.fill(0.0);
            return;
        }
        let Dims {
            nv,
            nu,
            nx,
            n_beta,
            n_contact_rows,
            n_eq,
            n_in,
        } = dims;
        self.hessian = DMatrix::zeros(nx, nx);
        self.linear = DVector::zeros(nx);
        self.a_eq = DMatrix::zeros(n_eq, nx);
        self.b_eq = DVector::zeros(n_eq);
        self.a_in = DMatrix::zeros(n_in, nx);
        self.b_in = DVector::zeros(n_in);
        self.torque_qdd = DMatrix::zeros(nu, nv);
        self.torque_beta = DMatrix::zeros(nu, n_beta);
        self.torque_offset = DVector::zeros(nu);
        self.friction_basis = DMatrix::zeros(n_contact_rows, n_beta);
        self.contact_force_map = DMatrix::zeros(nv, n_beta);
        self.dims = Some(dims);
        self.reallocations += 1;
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Everything the builder reads.
#[derive(Clone, Copy, Debug)]
pub struct BuildInputs<'a> {
    pub params: &'a ControllerParams,
    pub rpc: &'a RobotPropertyCache,
    pub terms: &'a DynamicsTerms,
    /// Active supports, in the order their points appear in `terms.contacts`.
    pub supports: &'a [SupportElement],
    pub q: &'a DVector<f64>,
    pub qd: &'a DVector<f64>,
    pub qdd_des: &'a DVector<f64>,
    /// Commanded centroidal angular momentum rate.
    pub kdot_des: Vector3<f64>,
}

/// Build the QP for this tick into `ws`.
pub fn build(ws: &mut QpWorkspace, inputs: &BuildInputs<'_>) -> ProblemLayout {
    let BuildInputs {
        params,
        rpc,
        terms,
        supports,
        q,
        qd,
        qdd_des,
        kdot_des,
    } = *inputs;

    let nv = rpc.nv;
    let nu = rpc.nu();
    let n_points = terms.contacts.len();
    let n_beta = EDGES_PER_POINT * n_points;
    let n_eps = 3 * n_points;
    let nx = nv + n_beta + n_eps;
    let n_body_eq: usize = terms
        .objectives
        .iter()
        .filter(|o| o.weight < 0.0)
        .map(|o| o.vdot_des.iter().filter(|v| !v.is_nan()).count())
        .sum();
    let n_eq = rpc.unactuated.len() + 3 * n_points + n_body_eq;

    collect_inequalities(&mut ws.inequality_rows, params, rpc, terms, q, n_beta, n_eps);
    let n_in = ws.inequality_rows.len();

    ws.prepare(Dims {
        nv,
        nu,
        nx,
        n_beta,
        n_contact_rows: 3 * n_points,
        n_eq,
        n_in,
    });

    let layout = ProblemLayout {
        nv,
        nu,
        n_points,
        n_beta,
        n_eps,
        nx,
        n_eq,
        n_in,
        supports: supports
            .iter()
            .map(|s| (s.body, s.geometry.num_points()))
            .collect(),
        objectives: terms.objectives.iter().map(|o| o.body).collect(),
        row_signature: row_signature(&ws.inequality_rows),
    };
    let beta0 = layout.beta_offset();
    let eps0 = layout.eps_offset();

    // --- Friction basis and contact force map ---
    for (p, contact) in terms.contacts.iter().enumerate() {
        let edges = friction_edges(&contact.normal, contact.mu);
        for (k, edge) in edges.iter().enumerate() {
            let col = EDGES_PER_POINT * p + k;
            ws.friction_basis
                .fixed_view_mut::<3, 1>(3 * p, col)
                .copy_from(edge);
            let generalized = contact.jacobian.transpose() * edge;
            ws.contact_force_map.set_column(col, &generalized);
        }
    }

    // --- Torque map: u = B_act⁻¹ (H_act qdd + C_act - (Jcᵀ E)_act β) ---
    let h_act = terms.h.select_rows(rpc.actuated.iter());
    let c_act = terms.c.select_rows(rpc.actuated.iter());
    let force_act = ws.contact_force_map.select_rows(rpc.actuated.iter());
    ws.torque_qdd = &rpc.b_act_inv * h_act;
    ws.torque_beta = -(&rpc.b_act_inv * force_act);
    ws.torque_offset = &rpc.b_act_inv * c_act;

    build_cost(ws, params, terms, qd, qdd_des, kdot_des, &layout);

    // --- Equality constraints ---
    let mut row = 0;
    for &i in &rpc.unactuated {
        ws.a_eq
            .view_mut((row, 0), (1, nv))
            .copy_from(&terms.h.row(i));
        for b in 0..n_beta {
            ws.a_eq[(row, beta0 + b)] = -ws.contact_force_map[(i, b)];
        }
        ws.b_eq[row] = -terms.c[i];
        row += 1;
    }
    for (p, contact) in terms.contacts.iter().enumerate() {
        let jqd = &contact.jacobian * qd;
        for d in 0..3 {
            ws.a_eq
                .view_mut((row, 0), (1, nv))
                .copy_from(&contact.jacobian.row(d));
            ws.a_eq[(row, eps0 + 3 * p + d)] = 1.0;
            ws.b_eq[row] = -contact.jdot_v[d] - params.kp_accel * jqd[d];
            row += 1;
        }
    }
    for objective in terms.objectives.iter().filter(|o| o.weight < 0.0) {
        for (k, vdot) in objective.vdot_des.iter().enumerate() {
            if vdot.is_nan() {
                continue;
            }
            ws.a_eq
                .view_mut((row, 0), (1, nv))
                .copy_from(&objective.jacobian.row(k));
            ws.b_eq[row] = vdot - objective.jdot_v[k];
            row += 1;
        }
    }
    debug_assert_eq!(row, n_eq, "equality row count mismatch");

    // --- Inequality constraints ---
    for (row, constraint) in ws.inequality_rows.iter().enumerate() {
        let (upper, limit, offset) = match *constraint {
            Constraint::Torque {
                actuator,
                upper,
                limit,
            } => {
                ws.a_in
                    .view_mut((row, 0), (1, nv))
                    .copy_from(&ws.torque_qdd.row(actuator));
                ws.a_in
                    .view_mut((row, beta0), (1, n_beta))
                    .copy_from(&ws.torque_beta.row(actuator));
                (upper, limit, ws.torque_offset[actuator])
            }
            Constraint::BodyAccel {
                objective,
                component,
                upper,
                limit,
            } => {
                let objective = &terms.objectives[objective];
                ws.a_in
                    .view_mut((row, 0), (1, nv))
                    .copy_from(&objective.jacobian.row(component));
                (upper, limit, objective.jdot_v[component])
            }
            Constraint::Qdd { dof, upper, limit } => {
                ws.a_in[(row, dof)] = 1.0;
                (upper, limit, 0.0)
            }
            Constraint::Force { beta } => {
                ws.a_in[(row, beta0 + beta)] = 1.0;
                (false, 0.0, 0.0)
            }
            Constraint::Slack { eps, upper, limit } => {
                ws.a_in[(row, eps0 + eps)] = 1.0;
                (upper, limit, 0.0)
            }
        };
        // Rows are written as upper bounds; lower bounds are negated.
        ws.b_in[row] = limit - offset;
        if !upper {
            ws.a_in.row_mut(row).neg_mut();
            ws.b_in[row] = -ws.b_in[row];
        }
    }

    layout
}

fn build_cost(
    ws: &mut QpWorkspace,
    params: &ControllerParams,
    terms: &DynamicsTerms,
    qd: &DVector<f64>,
    qdd_des: &DVector<f64>,
    kdot_des: Vector3<f64>,
    layout: &ProblemLayout,
) {
    let nv = layout.nv;
    let w_qdd = &params.whole_body.w_qdd;

    for i in 0..nv {
        ws.hessian[(i, i)] += 2.0 * w_qdd[i];
        ws.linear[i] -= 2.0 * w_qdd[i] * qdd_des[i];
    }

    for objective in terms.objectives.iter().filter(|o| o.weight > 0.0) {
        let w = objective.weight;
        for (k, vdot) in objective.vdot_des.iter().enumerate() {
            if vdot.is_nan() {
                continue;
            }
            let jk = objective.jacobian.row(k).transpose();
            ws.hessian
                .view_mut((0, 0), (nv, nv))
                .ger(2.0 * w, &jk, &jk, 1.0);
            ws.linear
                .rows_mut(0, nv)
                .axpy(2.0 * w * (objective.jdot_v[k] - vdot), &jk, 1.0);
        }
    }

    for b in 0..layout.n_beta {
        let i = layout.beta_offset() + b;
        ws.hessian[(i, i)] += 2.0 * params.w_grf;
    }
    for e in 0..layout.n_eps {
        let i = layout.eps_offset() + e;
        ws.hessian[(i, i)] += 2.0 * params.w_slack;
    }

    // Angular momentum rate: k̇_des = k̇_cmd - kp_ang Ak qd
    let w_kdot = DMatrix::from_fn(3, 3, |r, c| {
        0.5 * (params.w_kdot[r][c] + params.w_kdot[c][r])
    });
    let ak_qd = &terms.ak * qd;
    let residual = DVector::from_fn(3, |r, _| {
        kdot_des[r] - params.kp_ang * ak_qd[r] - terms.akdot_v[r]
    });
    let akt_w = terms.ak.transpose() * w_kdot;
    let mut h_qq = ws.hessian.view_mut((0, 0), (nv, nv));
    h_qq += &akt_w * &terms.ak * 2.0;
    let mut f_q = ws.linear.rows_mut(0, nv);
    f_q -= &akt_w * residual * 2.0;

    let transposed = ws.hessian.transpose();
    ws.hessian += transposed;
    ws.hessian *= 0.5;
    for i in 0..layout.nx {
        ws.hessian[(i, i)] += REG;
    }
}

fn collect_inequalities(
    rows: &mut Vec<Constraint>,
    params: &ControllerParams,
    rpc: &RobotPropertyCache,
    terms: &DynamicsTerms,
    q: &DVector<f64>,
    n_beta: usize,
    n_eps: usize,
) {
    rows.clear();

    for actuator in 0..rpc.nu() {
        push_bound_pair(rows, rpc.umin[actuator], rpc.umax[actuator], |upper, limit| {
            Constraint::Torque {
                actuator,
                upper,
                limit,
            }
        });
    }

    for (objective, body) in terms.objectives.iter().enumerate() {
        if let Some(bounds) = &body.bounds {
            for component in 0..6 {
                push_bound_pair(
                    rows,
                    bounds.min[component],
                    bounds.max[component],
                    |upper, limit| Constraint::BodyAccel {
                        objective,
                        component,
                        upper,
                        limit,
                    },
                );
            }
        }
    }

    let bounds = &params.whole_body.qdd_bounds;
    for dof in 0..rpc.nv {
        let mut min = bounds.min[dof];
        let knee_locked = params.min_knee_angle.is_some_and(|angle| {
            rpc.feet
                .iter()
                .any(|f| f.knee == Some(dof) && q[dof] < angle)
        });
        if knee_locked {
            min = min.max(0.0);
        }
        push_bound_pair(rows, min, bounds.max[dof], |upper, limit| Constraint::Qdd {
            dof,
            upper,
            limit,
        });
    }

    rows.extend((0..n_beta).map(|beta| Constraint::Force { beta }));

    let slack = params.slack_limit;
    for eps in 0..n_eps {
        push_bound_pair(rows, -slack, slack, |upper, limit| Constraint::Slack {
            eps,
            upper,
            limit,
        });
    }
}

/// Push the upper then the lower bound, skipping non-finite ones.
fn push_bound_pair(
    rows: &mut Vec<Constraint>,
    min: f64,
    max: f64,
    make: impl Fn(bool, f64) -> Constraint,
) {
    if max.is_finite() {
        rows.push(make(true, max));
    }
    if min.is_finite() {
        rows.push(make(false, min));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terms::{ObjectiveSpec, evaluate};
    use crate::types::{ContactGeometry, SupportMode};
    use approx::assert_relative_eq;
    use nalgebra::Vector6;
    use poise_core::config::Bounds;
    use poise_core::traits::RigidBodyDynamics;
    use poise_model::biped::{L_FOOT, NU, NV, PELVIS, R_FOOT};
    use poise_model::PointFootBiped;

    struct Fixture {
        model: PointFootBiped,
        rpc: RobotPropertyCache,
        params: ControllerParams,
        q: DVector<f64>,
        qd: DVector<f64>,
    }

    impl Fixture {
        fn new() -> Self {
            let model = PointFootBiped::default();
            let rpc = RobotPropertyCache::resolve(&model, &model.layout()).unwrap();
            let q = model.standing_configuration();
            Self {
                model,
                rpc,
                params: ControllerParams::uniform(NV, 10.0, 1.0),
                q,
                qd: DVector::zeros(NV),
            }
        }

        fn build(
            &self,
            ws: &mut QpWorkspace,
            supports: &[SupportElement],
            objectives: Vec<ObjectiveSpec>,
        ) -> ProblemLayout {
            let terms = evaluate(&self.model, &self.q, &self.qd, supports, objectives).unwrap();
            let qdd_des = DVector::from_fn(NV, |i, _| 0.1 * i as f64);
            build(
                ws,
                &BuildInputs {
                    params: &self.params,
                    rpc: &self.rpc,
                    terms: &terms,
                    supports,
                    q: &self.q,
                    qd: &self.qd,
                    qdd_des: &qdd_des,
                    kdot_des: Vector3::new(0.0, 0.5, 0.0),
                },
            )
        }
    }

    fn foot(body: BodyId) -> SupportElement {
        SupportElement {
            command_index: 0,
            body,
            geometry: ContactGeometry::Point {
                point: Vector3::zeros(),
            },
            normal: Vector3::z(),
            mu: 0.6,
            mode: SupportMode::Active,
        }
    }

    #[test]
    fn friction_edges_lie_on_cone() {
        for normal in [Vector3::z(), Vector3::new(0.3, -0.2, 1.0), Vector3::x()] {
            let n = normal.normalize();
            let mu = 0.6;
            for edge in friction_edges(&normal, mu) {
                assert_relative_eq!(edge.norm(), 1.0, epsilon = 1e-12);
                let normal_part = edge.dot(&n);
                let tangential = (edge - n * normal_part).norm();
                assert_relative_eq!(tangential / normal_part, mu, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn double_support_dimensions() {
        let fx = Fixture::new();
        let mut ws = QpWorkspace::new();
        let layout = fx.build(&mut ws, &[foot(L_FOOT), foot(R_FOOT)], Vec::new());
        assert_eq!(layout.n_points, 2);
        assert_eq!(layout.nx, NV + 8 + 6);
        assert_eq!(layout.n_eq, 3 + 6);
        // torque ±, qdd ±, β >= 0, ε ±
        assert_eq!(layout.n_in, 2 * NU + 2 * NV + 8 + 12);
        assert_eq!(ws.a_in.shape(), (layout.n_in, layout.nx));
        assert_eq!(layout.supports, vec![(L_FOOT, 1), (R_FOOT, 1)]);
    }

    #[test]
    fn flight_has_no_contact_rows() {
        let fx = Fixture::new();
        let mut ws = QpWorkspace::new();
        let layout = fx.build(&mut ws, &[], Vec::new());
        assert_eq!(layout.nx, NV);
        assert_eq!(layout.n_eq, 3);
        assert!(ws.inequality_rows.iter().all(|r| !matches!(
            r,
            Constraint::Force { .. } | Constraint::Slack { .. }
        )));
    }

    #[test]
    fn build_is_bit_identical() {
        let fx = Fixture::new();
        let supports = [foot(L_FOOT), foot(R_FOOT)];
        let mut first = QpWorkspace::new();
        let mut second = QpWorkspace::new();
        fx.build(&mut first, &supports, Vec::new());
        fx.build(&mut second, &supports, Vec::new());
        // Rebuilding into a used workspace must not leak old values either.
        fx.build(&mut second, &supports, Vec::new());
        assert_eq!(first.hessian, second.hessian);
        assert_eq!(first.linear, second.linear);
        assert_eq!(first.a_eq, second.a_eq);
        assert_eq!(first.b_eq, second.b_eq);
        assert_eq!(first.a_in, second.a_in);
        assert_eq!(first.b_in, second.b_in);
    }

    #[test]
    fn hessian_symmetric_and_regularized() {
        let mut fx = Fixture::new();
        fx.params.w_kdot = [[1.0, 0.2, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut ws = QpWorkspace::new();
        let layout = fx.build(&mut ws, &[foot(L_FOOT)], Vec::new());
        assert_eq!(ws.hessian, ws.hessian.transpose());
        for i in 0..layout.nx {
            assert!(ws.hessian[(i, i)] >= REG);
        }
        // w_grf = 0: the force block carries only the regularization.
        assert_relative_eq!(ws.hessian[(NV, NV)], REG);
    }

    #[test]
    fn reallocates_only_on_dimension_change() {
        let fx = Fixture::new();
        let mut ws = QpWorkspace::new();
        fx.build(&mut ws, &[foot(L_FOOT), foot(R_FOOT)], Vec::new());
        fx.build(&mut ws, &[foot(L_FOOT), foot(R_FOOT)], Vec::new());
        assert_eq!(ws.reallocations(), 1);
        fx.build(&mut ws, &[foot(L_FOOT)], Vec::new());
        assert_eq!(ws.reallocations(), 2);
        ws.invalidate();
        fx.build(&mut ws, &[foot(L_FOOT)], Vec::new());
        assert_eq!(ws.reallocations(), 3);
    }

    #[test]
    fn knee_lower_bound_raised_below_min_angle() {
        let mut fx = Fixture::new();
        fx.params.min_knee_angle = Some(-0.9);
        let mut ws = QpWorkspace::new();
        fx.build(&mut ws, &[], Vec::new());
        assert!(ws.inequality_rows.contains(&Constraint::Qdd {
            dof: 5,
            upper: false,
            limit: 0.0
        }));
        assert!(ws.inequality_rows.contains(&Constraint::Qdd {
            dof: 9,
            upper: false,
            limit: 0.0
        }));
        // Other joints keep their configured bound.
        assert!(ws.inequality_rows.contains(&Constraint::Qdd {
            dof: 4,
            upper: false,
            limit: -100.0
        }));
    }

    #[test]
    fn unbounded_entries_produce_no_rows() {
        let mut fx = Fixture::new();
        fx.params.whole_body.qdd_bounds = Bounds::unbounded(NV);
        fx.params.slack_limit = f64::INFINITY;
        let mut ws = QpWorkspace::new();
        let layout = fx.build(&mut ws, &[foot(L_FOOT)], Vec::new());
        assert_eq!(layout.n_in, 2 * NU + 4);
    }

    #[test]
    fn body_equality_skips_nan_components() {
        let fx = Fixture::new();
        let mut vdot = Vector6::zeros();
        vdot[0] = f64::NAN;
        vdot[1] = f64::NAN;
        vdot[2] = f64::NAN;
        vdot[5] = 0.5;
        let spec = ObjectiveSpec {
            body: PELVIS,
            vdot_des: vdot,
            weight: -1.0,
            bounds: Some(Bounds::symmetric(6, 2.0)),
        };
        let mut ws = QpWorkspace::new();
        let layout = fx.build(&mut ws, &[], vec![spec]);
        assert_eq!(layout.n_eq, 3 + 3);
        // Pelvis z acceleration row: qdd[2] = 0.5
        assert_relative_eq!(ws.a_eq[(5, 2)], 1.0);
        assert_relative_eq!(ws.b_eq[5], 0.5);
        assert_eq!(
            ws.inequality_rows
                .iter()
                .filter(|r| matches!(r, Constraint::BodyAccel { .. }))
                .count(),
            12
        );
    }

    #[test]
    fn layout_identifies_inequality_rows() {
        let fx = Fixture::new();
        let mut ws = QpWorkspace::new();
        let objective = |body, bounds: Bounds| ObjectiveSpec {
            body,
            vdot_des: Vector6::zeros(),
            weight: 1.0,
            bounds: Some(bounds),
        };
        let mut angular = Bounds::symmetric(6, 2.0);
        let mut linear = Bounds::symmetric(6, 2.0);
        for i in 0..3 {
            angular.min[i + 3] = f64::NEG_INFINITY;
            angular.max[i + 3] = f64::INFINITY;
            linear.min[i] = f64::NEG_INFINITY;
            linear.max[i] = f64::INFINITY;
        }

        let base = fx.build(&mut ws, &[], vec![objective(PELVIS, angular.clone())]);
        let other_rows = fx.build(&mut ws, &[], vec![objective(PELVIS, linear)]);
        let other_body = fx.build(&mut ws, &[], vec![objective(L_FOOT, angular.clone())]);
        assert_eq!(base.n_in, other_rows.n_in);
        assert_ne!(base.row_signature, other_rows.row_signature);
        assert_eq!(base.row_signature, other_body.row_signature);
        assert_ne!(base.objectives, other_body.objectives);

        // Bound values alone do not change the signature.
        let mut wider = angular;
        wider.max[0] = 3.0;
        let rebuilt = fx.build(&mut ws, &[], vec![objective(PELVIS, wider)]);
        assert_eq!(base, rebuilt);
    }

    #[test]
    fn torque_map_matches_inverse_dynamics() {
        let fx = Fixture::new();
        let mut ws = QpWorkspace::new();
        fx.build(&mut ws, &[foot(L_FOOT)], Vec::new());
        let h = fx.model.mass_matrix(&fx.q);
        let c = fx.model.bias(&fx.q, &fx.qd);
        let qdd = DVector::from_fn(NV, |i, _| 0.05 * i as f64);
        let beta = DVector::from_element(4, 10.0);
        let u = &ws.torque_qdd * &qdd + &ws.torque_beta * &beta + &ws.torque_offset;
        let generalized = &h * &qdd + &c - &ws.contact_force_map * &beta;
        for (j, &dof) in fx.rpc.actuated.iter().enumerate() {
            assert_relative_eq!(u[j], generalized[dof], epsilon = 1e-9);
        }
    }
}
