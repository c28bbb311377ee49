//! Planar-hip point-foot biped.
//!
//! A translating pelvis carries two legs whose feet are placed by three
//! prismatic coordinates relative to a hip mount. Each foot is a point mass
//! with a rotor about the world y axis (the ankle). All bodies translate
//! without rotating except the feet, which rotate with their ankle.
//!
//! Velocity coordinates:
//!
//! | index | name      | kind                        |
//! |-------|-----------|-----------------------------|
//! | 0..3  | `base_*`  | pelvis position, unactuated |
//! | 3..6  | `l_hip_x`, `l_hip_y`, `l_knee` | left foot offset |
//! | 6     | `l_ankle` | left foot rotor             |
//! | 7..10 | `r_hip_x`, `r_hip_y`, `r_knee` | right foot offset |
//! | 10    | `r_ankle` | right foot rotor            |
//!
//! The mass matrix is configuration independent, so the bias vector is pure
//! gravity and every `J̇ qd` term of the body origins vanishes.

use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6,
};
use poise_core::config::{FootLayout, RobotLayoutConfig};
use poise_core::traits::{BodyId, RigidBodyDynamics};

/// Number of velocity coordinates.
pub const NV: usize = 11;
/// Number of actuators.
pub const NU: usize = 8;

pub const PELVIS: BodyId = 0;
pub const L_FOOT: BodyId = 1;
pub const R_FOOT: BodyId = 2;

const BODY_NAMES: [&str; 3] = ["pelvis", "l_foot", "r_foot"];

const JOINT_NAMES: [&str; NV] = [
    "base_x", "base_y", "base_z", "l_hip_x", "l_hip_y", "l_knee", "l_ankle", "r_hip_x", "r_hip_y",
    "r_knee", "r_ankle",
];

/// Coordinate layout of one leg.
#[derive(Debug, Clone, Copy)]
struct Leg {
    /// First of the three foot offset coordinates.
    offset: usize,
    ankle: usize,
    /// +1 for the left leg, -1 for the right leg.
    side: f64,
}

const LEGS: [Leg; 2] = [
    Leg {
        offset: 3,
        ankle: 6,
        side: 1.0,
    },
    Leg {
        offset: 7,
        ankle: 10,
        side: -1.0,
    },
];

const fn leg_of(body: BodyId) -> Option<Leg> {
    match body {
        L_FOOT => Some(LEGS[0]),
        R_FOOT => Some(LEGS[1]),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// PointFootBiped
// ---------------------------------------------------------------------------

/// Reference biped used by tests and the demo binary.
#[derive(Debug, Clone)]
pub struct PointFootBiped {
    pub pelvis_mass: f64,
    pub foot_mass: f64,
    pub ankle_inertia: f64,
    pub gravity: f64,
    /// Lateral distance from the pelvis to each hip mount.
    pub hip_width: f64,
    /// Symmetric effort limit of every actuator.
    pub effort_limit: f64,
}

impl Default for PointFootBiped {
    fn default() -> Self {
        Self {
            pelvis_mass: 30.0,
            foot_mass: 2.0,
            ankle_inertia: 0.05,
            gravity: 9.81,
            hip_width: 0.1,
            effort_limit: 500.0,
        }
    }
}

impl PointFootBiped {
    pub fn total_mass(&self) -> f64 {
        self.pelvis_mass + 2.0 * self.foot_mass
    }

    /// Standing pose: pelvis 1 m above the ground, feet on the ground below the hips.
    pub fn standing_configuration(&self) -> DVector<f64> {
        let mut q = DVector::zeros(NV);
        q[2] = 1.0;
        q[5] = -1.0;
        q[9] = -1.0;
        q
    }

    /// Body and joint names the controller needs for this robot.
    pub fn layout(&self) -> RobotLayoutConfig {
        let foot = |prefix: &str| FootLayout {
            body: format!("{prefix}_foot"),
            leg_joints: ["hip_x", "hip_y", "knee", "ankle"]
                .iter()
                .map(|j| format!("{prefix}_{j}"))
                .collect(),
            ankle_joints: vec![format!("{prefix}_ankle")],
            knee_joint: Some(format!("{prefix}_knee")),
        };
        RobotLayoutConfig {
            pelvis: BODY_NAMES[PELVIS].into(),
            feet: vec![foot("l"), foot("r")],
        }
    }

    /// World position of a foot origin.
    fn foot_origin(&self, q: &DVector<f64>, leg: Leg) -> Vector3<f64> {
        let pelvis = Vector3::new(q[0], q[1], q[2]);
        let hip = Vector3::new(0.0, leg.side * self.hip_width, 0.0);
        let offset = Vector3::new(q[leg.offset], q[leg.offset + 1], q[leg.offset + 2]);
        pelvis + hip + offset
    }

    fn foot_rotation(q: &DVector<f64>, leg: Leg) -> UnitQuaternion<f64> {
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q[leg.ankle])
    }

    /// Whole-body center of mass.
    pub fn center_of_mass(&self, q: &DVector<f64>) -> Vector3<f64> {
        let pelvis = Vector3::new(q[0], q[1], q[2]);
        let feet: Vector3<f64> = LEGS.iter().map(|&leg| self.foot_origin(q, leg)).sum();
        (pelvis * self.pelvis_mass + feet * self.foot_mass) / self.total_mass()
    }

    fn check_body(&self, body: BodyId) {
        debug_assert!(body < self.num_bodies(), "body id {body} out of range");
    }
}

impl RigidBodyDynamics for PointFootBiped {
    fn num_velocities(&self) -> usize {
        NV
    }

    fn num_bodies(&self) -> usize {
        BODY_NAMES.len()
    }

    fn body_id(&self, name: &str) -> Option<BodyId> {
        BODY_NAMES.iter().position(|&n| n == name)
    }

    fn joint_index(&self, name: &str) -> Option<usize> {
        JOINT_NAMES.iter().position(|&n| n == name)
    }

    fn actuation_matrix(&self) -> DMatrix<f64> {
        let mut b = DMatrix::zeros(NV, NU);
        for j in 0..NU {
            b[(3 + j, j)] = 1.0;
        }
        b
    }

    fn actuator_limits(&self) -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_element(NU, -self.effort_limit),
            DVector::from_element(NU, self.effort_limit),
        )
    }

    fn joint_limits(&self) -> (DVector<f64>, DVector<f64>) {
        let mut min = DVector::from_element(NV, f64::NEG_INFINITY);
        let mut max = DVector::from_element(NV, f64::INFINITY);
        for leg in LEGS {
            for (k, (lo, hi)) in [(-0.5, 0.5), (-0.5, 0.5), (-1.2, -0.5)].into_iter().enumerate() {
                min[leg.offset + k] = lo;
                max[leg.offset + k] = hi;
            }
            min[leg.ankle] = -1.0;
            max[leg.ankle] = 1.0;
        }
        (min, max)
    }

    fn mass_matrix(&self, _q: &DVector<f64>) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(NV, NV);
        let eye = Matrix3::identity();
        h.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(eye * self.total_mass()));
        for leg in LEGS {
            let mf = eye * self.foot_mass;
            h.fixed_view_mut::<3, 3>(0, leg.offset).copy_from(&mf);
            h.fixed_view_mut::<3, 3>(leg.offset, 0).copy_from(&mf);
            h.fixed_view_mut::<3, 3>(leg.offset, leg.offset)
                .copy_from(&mf);
            h[(leg.ankle, leg.ankle)] = self.ankle_inertia;
        }
        h
    }

    fn bias(&self, _q: &DVector<f64>, _qd: &DVector<f64>) -> DVector<f64> {
        let mut c = DVector::zeros(NV);
        c[2] = self.total_mass() * self.gravity;
        for leg in LEGS {
            c[leg.offset + 2] = self.foot_mass * self.gravity;
        }
        c
    }

    fn body_transform(&self, q: &DVector<f64>, body: BodyId) -> Isometry3<f64> {
        self.check_body(body);
        match leg_of(body) {
            Some(leg) => Isometry3::from_parts(
                Translation3::from(self.foot_origin(q, leg)),
                Self::foot_rotation(q, leg),
            ),
            None => Isometry3::translation(q[0], q[1], q[2]),
        }
    }

    fn point_jacobian(
        &self,
        q: &DVector<f64>,
        body: BodyId,
        point: &Vector3<f64>,
    ) -> DMatrix<f64> {
        self.check_body(body);
        let mut j = DMatrix::zeros(3, NV);
        j.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());
        if let Some(leg) = leg_of(body) {
            j.fixed_view_mut::<3, 3>(0, leg.offset)
                .copy_from(&Matrix3::identity());
            let lever = Self::foot_rotation(q, leg) * point;
            j.fixed_view_mut::<3, 1>(0, leg.ankle)
                .copy_from(&Vector3::y().cross(&lever));
        }
        j
    }

    fn point_jacobian_dot_times_v(
        &self,
        q: &DVector<f64>,
        qd: &DVector<f64>,
        body: BodyId,
        point: &Vector3<f64>,
    ) -> Vector3<f64> {
        self.check_body(body);
        match leg_of(body) {
            Some(leg) => {
                let omega = Vector3::y() * qd[leg.ankle];
                let lever = Self::foot_rotation(q, leg) * point;
                omega.cross(&omega.cross(&lever))
            }
            None => Vector3::zeros(),
        }
    }

    fn body_jacobian(&self, _q: &DVector<f64>, body: BodyId) -> DMatrix<f64> {
        self.check_body(body);
        let mut j = DMatrix::zeros(6, NV);
        j.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&Matrix3::identity());
        if let Some(leg) = leg_of(body) {
            j[(1, leg.ankle)] = 1.0;
            j.fixed_view_mut::<3, 3>(3, leg.offset)
                .copy_from(&Matrix3::identity());
        }
        j
    }

    fn body_jacobian_dot_times_v(
        &self,
        _q: &DVector<f64>,
        _qd: &DVector<f64>,
        body: BodyId,
    ) -> Vector6<f64> {
        self.check_body(body);
        Vector6::zeros()
    }

    fn centroidal_momentum_matrix(&self, q: &DVector<f64>) -> DMatrix<f64> {
        let com = self.center_of_mass(q);
        let mut a = DMatrix::zeros(6, NV);
        // The pelvis columns of the angular rows vanish: sum of m (r - c) is zero.
        a.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(Matrix3::identity() * self.total_mass()));
        for leg in LEGS {
            let r = self.foot_origin(q, leg) - com;
            a.fixed_view_mut::<3, 3>(0, leg.offset)
                .copy_from(&(r.cross_matrix() * self.foot_mass));
            a[(1, leg.ankle)] = self.ankle_inertia;
            a.fixed_view_mut::<3, 3>(3, leg.offset)
                .copy_from(&(Matrix3::identity() * self.foot_mass));
        }
        a
    }

    fn centroidal_momentum_matrix_dot_times_v(
        &self,
        _q: &DVector<f64>,
        _qd: &DVector<f64>,
    ) -> Vector6<f64> {
        Vector6::zeros()
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "PointFootBiped"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn moving_state() -> (DVector<f64>, DVector<f64>) {
        let model = PointFootBiped::default();
        let mut q = model.standing_configuration();
        q[3] = 0.1;
        q[6] = 0.3;
        q[8] = -0.05;
        let qd = DVector::from_fn(NV, |i, _| 0.1 * (i as f64) - 0.4);
        (q, qd)
    }

    #[test]
    fn standing_feet_touch_ground() {
        let model = PointFootBiped::default();
        let q = model.standing_configuration();
        let left = model.point_position(&q, L_FOOT, &Vector3::zeros());
        let right = model.point_position(&q, R_FOOT, &Vector3::zeros());
        assert_relative_eq!(left, Vector3::new(0.0, 0.1, 0.0), epsilon = 1e-12);
        assert_relative_eq!(right, Vector3::new(0.0, -0.1, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn mass_matrix_is_symmetric_positive_definite() {
        let model = PointFootBiped::default();
        let h = model.mass_matrix(&model.standing_configuration());
        assert_relative_eq!(h.clone(), h.transpose(), epsilon = 1e-12);
        assert!(h.cholesky().is_some());
    }

    #[test]
    fn gravity_bias_matches_weight() {
        let model = PointFootBiped::default();
        let q = model.standing_configuration();
        let c = model.bias(&q, &DVector::zeros(NV));
        assert_relative_eq!(c[2], model.total_mass() * model.gravity, epsilon = 1e-9);
        assert_relative_eq!(c[5], model.foot_mass * model.gravity, epsilon = 1e-9);
    }

    #[test]
    fn names_resolve() {
        let model = PointFootBiped::default();
        assert_eq!(model.body_id("r_foot"), Some(R_FOOT));
        assert_eq!(model.body_id("head"), None);
        assert_eq!(model.joint_index("l_knee"), Some(5));
        assert_eq!(model.joint_index("r_ankle"), Some(10));
        let layout = model.layout();
        for foot in &layout.feet {
            assert!(model.body_id(&foot.body).is_some());
            for joint in &foot.leg_joints {
                assert!(model.joint_index(joint).is_some(), "{joint}");
            }
        }
    }

    #[test]
    fn point_jacobian_matches_finite_difference() {
        let model = PointFootBiped::default();
        let (q, _) = moving_state();
        let point = Vector3::new(0.05, 0.02, -0.03);
        let j = model.point_jacobian(&q, L_FOOT, &point);
        let h = 1e-6;
        for col in 0..NV {
            let mut qp = q.clone();
            qp[col] += h;
            let mut qm = q.clone();
            qm[col] -= h;
            let fd = (model.point_position(&qp, L_FOOT, &point)
                - model.point_position(&qm, L_FOOT, &point))
                / (2.0 * h);
            for row in 0..3 {
                assert_relative_eq!(j[(row, col)], fd[row], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn point_jacobian_dot_matches_finite_difference() {
        let model = PointFootBiped::default();
        let (q, qd) = moving_state();
        let point = Vector3::new(0.05, 0.0, -0.03);
        let h = 1e-6;
        let jp = model.point_jacobian(&(&q + &qd * h), R_FOOT, &point);
        let jm = model.point_jacobian(&(&q - &qd * h), R_FOOT, &point);
        let fd = (jp - jm) / (2.0 * h) * &qd;
        let analytic = model.point_jacobian_dot_times_v(&q, &qd, R_FOOT, &point);
        for row in 0..3 {
            assert_relative_eq!(analytic[row], fd[row], epsilon = 1e-6);
        }
    }

    #[test]
    fn centroidal_momentum_linear_rows_are_total_momentum() {
        let model = PointFootBiped::default();
        let (q, qd) = moving_state();
        let h = model.centroidal_momentum_matrix(&q) * &qd;
        let expected = (model.center_of_mass(&(&q + &qd * 1e-6))
            - model.center_of_mass(&(&q - &qd * 1e-6)))
            / 2e-6
            * model.total_mass();
        for i in 0..3 {
            assert_relative_eq!(h[3 + i], expected[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn centroidal_angular_momentum_ignores_pelvis_translation() {
        let model = PointFootBiped::default();
        let (q, _) = moving_state();
        let a = model.centroidal_momentum_matrix(&q);
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(a[(r, c)], 0.0, epsilon = 1e-12);
            }
        }
        assert_relative_eq!(a[(1, 6)], model.ankle_inertia);
    }

    #[test]
    fn actuation_skips_floating_base() {
        let model = PointFootBiped::default();
        let b = model.actuation_matrix();
        for row in 0..3 {
            assert!(b.row(row).iter().all(|v| *v == 0.0));
        }
        for row in 3..NV {
            assert_eq!(b.row(row).iter().filter(|v| **v != 0.0).count(), 1);
        }
    }

    #[test]
    fn standing_pose_within_joint_limits() {
        let model = PointFootBiped::default();
        let q = model.standing_configuration();
        let (min, max) = model.joint_limits();
        for i in 0..NV {
            assert!(min[i] <= q[i] && q[i] <= max[i], "coordinate {i}");
        }
    }
}
