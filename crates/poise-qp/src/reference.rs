//! Reference generators: whole-body PID, velocity-reference integrator and
//! body-motion PD.
//!
//! All three are pure. They return the updated integrator state instead of
//! writing it, so the controller can commit it only when the tick succeeds.
//!
//! Integrators use a read-then-update convention: the state read at the start
//! of a tick is decayed, incremented with this tick's term, clamped, and the
//! clamped value is used for this tick's output.

use nalgebra::{DVector, Vector6};
use poise_core::config::{BodyMotionParams, VRefIntegratorParams, WholeBodyParams};

use crate::robot::RobotPropertyCache;
use crate::types::DesiredBodyMotion;

/// Time step since the previous tick. Zero on the first tick and when the
/// clock runs backwards.
pub fn tick_dt(t_prev: Option<f64>, t: f64) -> f64 {
    match t_prev {
        Some(prev) if t >= prev => t - prev,
        Some(prev) => {
            tracing::warn!(t, t_prev = prev, "controller time went backwards, using dt = 0");
            0.0
        }
        None => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Whole-body PID
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct PidOutput {
    /// Desired positions after integral correction and joint-limit clamping.
    pub q_ref: DVector<f64>,
    pub qdd_des: DVector<f64>,
    /// Updated position-error integrator state.
    pub integrator: DVector<f64>,
}

/// Joint-space PID producing desired accelerations.
pub fn whole_body_pid(
    params: &WholeBodyParams,
    rpc: &RobotPropertyCache,
    dt: f64,
    q: &DVector<f64>,
    qd: &DVector<f64>,
    q_des: &DVector<f64>,
    integrator: &DVector<f64>,
) -> PidOutput {
    let nv = q.len();
    let ip = &params.integrator;
    let kd = params.effective_kd();

    let integrator = DVector::from_fn(nv, |i, _| {
        let err = q_des[i] - q[i];
        let clamp = ip.clamps[i];
        (ip.eta * integrator[i] + ip.gains[i] * err * dt).clamp(-clamp, clamp)
    });

    let q_ref = DVector::from_fn(nv, |i, _| {
        (q_des[i] + integrator[i])
            .max(rpc.joint_min[i])
            .min(rpc.joint_max[i])
    });

    let qdd_des = DVector::from_fn(nv, |i, _| {
        let qdd = params.kp[i] * (q_ref[i] - q[i]) - kd[i] * qd[i];
        params.qdd_bounds.clamp(i, qdd)
    });

    PidOutput {
        q_ref,
        qdd_des,
        integrator,
    }
}

// ---------------------------------------------------------------------------
// Velocity reference
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct VelocityReference {
    pub qd_ref: DVector<f64>,
    /// Updated velocity integrator state.
    pub integrator: DVector<f64>,
}

/// Integrate the solved accelerations into a velocity reference.
///
/// When a foot's contact changes, its leg entries restart from the measured
/// velocity. With `zero_ankles_on_contact`, a touchdown zeroes the ankle
/// entries and stance ankles get no velocity reference.
///
/// `foot_contact` and `contact_prev` have one entry per foot of `rpc`.
#[allow(clippy::too_many_arguments)]
pub fn velocity_reference(
    params: &VRefIntegratorParams,
    rpc: &RobotPropertyCache,
    dt: f64,
    qd: &DVector<f64>,
    qdd: &DVector<f64>,
    foot_contact: &[bool],
    contact_prev: &[bool],
    integrator: &DVector<f64>,
) -> VelocityReference {
    let eta = params.eta;
    let mut v = DVector::from_fn(qd.len(), |i, _| {
        let clamp = params.clamps[i];
        ((1.0 - eta) * integrator[i] + eta * qd[i] + qdd[i] * dt).clamp(-clamp, clamp)
    });

    for (foot, (&now, &before)) in rpc.feet.iter().zip(foot_contact.iter().zip(contact_prev)) {
        if now == before {
            continue;
        }
        // Contact changed: restart the leg from the measured velocity.
        for &joint in &foot.leg {
            v[joint] = qd[joint].clamp(-params.clamps[joint], params.clamps[joint]);
        }
        if params.zero_ankles_on_contact && now {
            for &ankle in &foot.ankles {
                v[ankle] = 0.0;
            }
        }
    }

    let mut qd_ref = &v - qd;
    if params.zero_ankles_on_contact {
        // Stance ankles are not velocity controlled.
        for (foot, &now) in rpc.feet.iter().zip(foot_contact) {
            if now {
                for &ankle in &foot.ankles {
                    qd_ref[ankle] = 0.0;
                }
            }
        }
    }

    VelocityReference {
        qd_ref,
        integrator: v,
    }
}

// ---------------------------------------------------------------------------
// Body motion PD
// ---------------------------------------------------------------------------

/// Desired body acceleration with PD feedback on the tracking error.
///
/// Without a tracking error or without gains the commanded acceleration is
/// returned as is. NaN components stay NaN.
pub fn body_motion_pd(motion: &DesiredBodyMotion, params: Option<&BodyMotionParams>) -> Vector6<f64> {
    match (&motion.tracking, params) {
        (Some(tracking), Some(params)) => Vector6::from_fn(|i, _| {
            motion.body_vdot[i]
                + params.kp[i] * tracking.position_error[i]
                + params.kd[i] * tracking.velocity_error[i]
        }),
        _ => motion.body_vdot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BodyTrackingError;
    use approx::assert_relative_eq;
    use poise_core::config::{Bounds, ControllerParams};
    use poise_model::biped::{NV, PELVIS};
    use poise_model::PointFootBiped;

    fn setup() -> (PointFootBiped, RobotPropertyCache, ControllerParams) {
        let model = PointFootBiped::default();
        let rpc = RobotPropertyCache::resolve(&model, &model.layout()).unwrap();
        (model, rpc, ControllerParams::uniform(NV, 10.0, 1.0))
    }

    #[test]
    fn dt_handles_first_tick_and_backwards_time() {
        assert_relative_eq!(tick_dt(None, 3.0), 0.0);
        assert_relative_eq!(tick_dt(Some(1.0), 1.25), 0.25);
        assert_relative_eq!(tick_dt(Some(2.0), 1.0), 0.0);
    }

    #[test]
    fn pid_zero_error_at_rest() {
        let (model, rpc, params) = setup();
        let q = model.standing_configuration();
        let out = whole_body_pid(
            &params.whole_body,
            &rpc,
            0.01,
            &q,
            &DVector::zeros(NV),
            &q,
            &DVector::zeros(NV),
        );
        assert_eq!(out.qdd_des, DVector::zeros(NV));
        assert_eq!(out.q_ref, q);
        assert_eq!(out.integrator, DVector::zeros(NV));
    }

    #[test]
    fn pid_pd_terms_and_bounds() {
        let (model, rpc, mut params) = setup();
        params.whole_body.kd = Some(vec![2.0; NV]);
        params.whole_body.qdd_bounds = Bounds::symmetric(NV, 1.0);
        let q = model.standing_configuration();
        let mut q_des = q.clone();
        q_des[3] += 0.05;
        q_des[4] += 0.3;
        let mut qd = DVector::zeros(NV);
        qd[3] = 0.1;
        let out = whole_body_pid(
            &params.whole_body,
            &rpc,
            0.0,
            &q,
            &qd,
            &q_des,
            &DVector::zeros(NV),
        );
        // 10 * 0.05 - 2 * 0.1
        assert_relative_eq!(out.qdd_des[3], 0.3, epsilon = 1e-12);
        // 10 * 0.3 clamped to 1
        assert_relative_eq!(out.qdd_des[4], 1.0);
    }

    #[test]
    fn pid_reference_respects_joint_limits() {
        let (model, rpc, params) = setup();
        let q = model.standing_configuration();
        let mut q_des = q.clone();
        q_des[5] = 0.0;
        let out = whole_body_pid(
            &params.whole_body,
            &rpc,
            0.0,
            &q,
            &DVector::zeros(NV),
            &q_des,
            &DVector::zeros(NV),
        );
        assert_relative_eq!(out.q_ref[5], -0.5);
    }

    #[test]
    fn pid_integrator_bounded_and_converges() {
        let (model, rpc, mut params) = setup();
        let ip = &mut params.whole_body.integrator;
        ip.gains = vec![1.0; NV];
        ip.eta = 0.5;
        ip.clamps = vec![0.1; NV];
        ip.clamps[4] = 1.0;
        let q = model.standing_configuration();
        let mut q_des = q.clone();
        q_des[3] += 0.2;
        q_des[4] += 0.2;
        let dt = 0.1;

        let mut state = DVector::zeros(NV);
        for _ in 0..200 {
            let out = whole_body_pid(
                &params.whole_body,
                &rpc,
                dt,
                &q,
                &DVector::zeros(NV),
                &q_des,
                &state,
            );
            for i in 0..NV {
                assert!(out.integrator[i].abs() <= params.whole_body.integrator.clamps[i]);
                assert!(out.qdd_des[i].is_finite());
            }
            state = out.integrator;
        }
        // gains * e * dt / (1 - eta) = 1 * 0.2 * 0.1 / 0.5 = 0.04, inside both clamps
        assert_relative_eq!(state[4], 0.04, epsilon = 1e-12);
        assert_relative_eq!(state[3], 0.04, epsilon = 1e-12);

        // A larger error saturates at the clamp.
        q_des[3] = q[3] + 2.0;
        for _ in 0..200 {
            state = whole_body_pid(
                &params.whole_body,
                &rpc,
                dt,
                &q,
                &DVector::zeros(NV),
                &q_des,
                &state,
            )
            .integrator;
        }
        assert_relative_eq!(state[3], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn vref_zeroes_ankles_on_touchdown() {
        let (_, rpc, params) = setup();
        let qd = DVector::from_element(NV, 0.2);
        let qdd = DVector::from_element(NV, 1.0);
        let state = DVector::from_element(NV, 0.5);

        let out = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[true, false],
            &[false, false],
            &state,
        );
        assert_eq!(out.integrator[6], 0.0);
        assert!(out.integrator[10] != 0.0);
        // Stance ankle has no velocity reference; swing ankle does.
        assert_eq!(out.qd_ref[6], 0.0);
        assert!(out.qd_ref[10] != 0.0);
    }

    #[test]
    fn vref_keeps_ankles_when_disabled_or_already_in_contact() {
        let (_, rpc, mut params) = setup();
        let qd = DVector::from_element(NV, 0.2);
        let qdd = DVector::from_element(NV, 1.0);
        let state = DVector::from_element(NV, 0.5);

        // Contact held from the previous tick: no transition.
        let held = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[true, true],
            &[true, true],
            &state,
        );
        assert!(held.integrator[6] != 0.0);

        params.vref_integrator.zero_ankles_on_contact = false;
        let disabled = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[true, true],
            &[false, false],
            &state,
        );
        // Touchdown still restarts both legs from qd, ankles included.
        for foot in &rpc.feet {
            for &joint in &foot.leg {
                assert_relative_eq!(disabled.integrator[joint], 0.2);
            }
        }
    }

    #[test]
    fn vref_stance_ankles_tracked_when_zeroing_disabled() {
        let (_, rpc, mut params) = setup();
        params.vref_integrator.zero_ankles_on_contact = false;
        let qd = DVector::from_element(NV, 0.2);
        let qdd = DVector::from_element(NV, 1.0);
        let state = DVector::from_element(NV, 0.5);

        let out = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[true, true],
            &[true, true],
            &state,
        );
        for foot in &rpc.feet {
            for &ankle in &foot.ankles {
                assert_relative_eq!(out.qd_ref[ankle], out.integrator[ankle] - qd[ankle]);
                assert!(out.qd_ref[ankle] != 0.0);
            }
        }
    }

    #[test]
    fn vref_restarts_leg_on_contact_change() {
        let (_, rpc, params) = setup();
        let mut qd = DVector::from_element(NV, 0.2);
        qd[4] = 0.35;
        qd[8] = -0.15;
        let qdd = DVector::from_element(NV, 1.0);
        let state = DVector::from_element(NV, 0.5);

        // Left foot lifts off, right foot stays down.
        let out = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[false, true],
            &[true, true],
            &state,
        );
        let left = &rpc.feet[0];
        for &joint in &left.leg {
            assert_relative_eq!(out.integrator[joint], qd[joint]);
            assert_relative_eq!(out.qd_ref[joint], 0.0);
        }
        // The right leg keeps integrating.
        let eta = params.vref_integrator.eta;
        assert_relative_eq!(
            out.integrator[8],
            (1.0 - eta) * 0.5 + eta * qd[8] + 0.01,
            epsilon = 1e-12
        );
    }

    #[test]
    fn vref_blend_and_clamp() {
        let (_, rpc, mut params) = setup();
        params.vref_integrator.eta = 0.5;
        params.vref_integrator.clamps = vec![0.3; NV];
        let qd = DVector::from_element(NV, 0.2);
        let qdd = DVector::zeros(NV);
        let state = DVector::from_element(NV, 0.0);
        let out = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &qd,
            &qdd,
            &[false, false],
            &[false, false],
            &state,
        );
        assert_relative_eq!(out.integrator[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(out.qd_ref[0], -0.1, epsilon = 1e-12);

        let fast = DVector::from_element(NV, 10.0);
        let out = velocity_reference(
            &params.vref_integrator,
            &rpc,
            0.01,
            &fast,
            &qdd,
            &[false, false],
            &[false, false],
            &state,
        );
        assert_relative_eq!(out.integrator[0], 0.3);
    }

    #[test]
    fn body_pd_adds_feedback() {
        let params = BodyMotionParams {
            body: "pelvis".into(),
            kp: [4.0; 6],
            kd: [1.0; 6],
            accel_bounds: Bounds::unbounded(6),
            weight: 1.0,
        };
        let mut vdot = Vector6::zeros();
        vdot[0] = f64::NAN;
        vdot[5] = 1.0;
        let motion = DesiredBodyMotion {
            body: PELVIS,
            body_vdot: vdot,
            weight: 1.0,
            accel_bounds: None,
            tracking: Some(BodyTrackingError {
                position_error: Vector6::from_element(0.1),
                velocity_error: Vector6::from_element(-0.2),
            }),
        };
        let out = body_motion_pd(&motion, Some(&params));
        assert!(out[0].is_nan());
        assert_relative_eq!(out[5], 1.0 + 0.4 - 0.2, epsilon = 1e-12);
        assert_eq!(body_motion_pd(&motion, None)[5], 1.0);
    }
}
