//! The per-tick controller.
//!
//! [`QpController::tick`] runs the whole pipeline:
//!
//! 1. validate the command and resolve supports
//! 2. whole-body PID → desired joint accelerations
//! 3. body-motion PD → body acceleration objectives
//! 4. evaluate dynamics terms and build the QP into the reused workspace
//! 5. solve (fast path, robust fallback, warm start)
//! 6. assemble torques and contact forces, integrate the velocity reference
//! 7. commit the controller state
//!
//! State is committed only at step 7. Any error leaves it untouched except
//! for the warm start, which is discarded.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use poise_core::config::{
    BodyMotionParams, ControllerConfig, ControllerParams, ControllerSettings, FailSafePolicy,
    ParamSets, RobotLayoutConfig,
};
use poise_core::error::ConfigError;
use poise_core::traits::{BodyId, RigidBodyDynamics};

use crate::builder::{BuildInputs, QpWorkspace, build};
use crate::error::{TickError, check_dim};
use crate::output::{DebugContext, DebugData, assemble};
use crate::reference::{PidOutput, body_motion_pd, tick_dt, velocity_reference, whole_body_pid};
use crate::robot::RobotPropertyCache;
use crate::solve::{SolveStats, SolverSession};
use crate::state::{ControllerState, ProblemTag};
use crate::support::{foot_contacts, resolve_supports};
use crate::terms::{ObjectiveSpec, evaluate};
use crate::types::{QpControllerOutput, QpInput, SupportElement, TickInput, TickOutput};

/// Whole-body QP balance controller for one robot.
#[derive(Debug)]
pub struct QpController {
    rpc: RobotPropertyCache,
    param_sets: ParamSets,
    /// Body ids of every body named in a `body_motion` entry.
    body_ids: BTreeMap<String, BodyId>,
    settings: ControllerSettings,
    state: ControllerState,
    workspace: QpWorkspace,
    session: SolverSession,
}

impl QpController {
    /// Bind configuration to a robot model.
    pub fn new<D: RigidBodyDynamics + ?Sized>(
        dynamics: &D,
        layout: &RobotLayoutConfig,
        param_sets: ParamSets,
        settings: ControllerSettings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let rpc = RobotPropertyCache::resolve(dynamics, layout)?;
        let body_ids = resolve_param_sets(dynamics, &param_sets, rpc.nv)?;
        let state = ControllerState::new(rpc.nv, rpc.feet.len());
        let session = SolverSession::new(&settings);
        tracing::debug!(
            model = dynamics.name(),
            nv = rpc.nv,
            nu = rpc.nu(),
            param_sets = param_sets.len(),
            "controller initialized"
        );
        Ok(Self {
            rpc,
            param_sets,
            body_ids,
            settings,
            state,
            workspace: QpWorkspace::new(),
            session,
        })
    }

    pub fn from_config<D: RigidBodyDynamics + ?Sized>(
        dynamics: &D,
        config: &ControllerConfig,
    ) -> Result<Self, ConfigError> {
        Self::new(
            dynamics,
            &config.robot,
            config.param_sets.clone(),
            config.controller.clone(),
        )
    }

    /// Replace the solver session (custom backends).
    #[must_use]
    pub fn with_session(mut self, session: SolverSession) -> Self {
        self.session = session;
        self
    }

    /// Swap the parameter sets between ticks.
    pub fn set_param_sets<D: RigidBodyDynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        param_sets: ParamSets,
    ) -> Result<(), ConfigError> {
        self.body_ids = resolve_param_sets(dynamics, &param_sets, self.rpc.nv)?;
        self.param_sets = param_sets;
        Ok(())
    }

    /// Forget everything learned since construction.
    pub fn reset(&mut self) {
        self.state.reset();
        self.workspace.invalidate();
        tracing::debug!("controller reset");
    }

    pub const fn state(&self) -> &ControllerState {
        &self.state
    }

    pub const fn workspace(&self) -> &QpWorkspace {
        &self.workspace
    }

    pub const fn robot(&self) -> &RobotPropertyCache {
        &self.rpc
    }

    pub const fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub const fn param_sets(&self) -> &ParamSets {
        &self.param_sets
    }

    pub const fn stats(&self) -> &SolveStats {
        self.session.stats()
    }

    /// Run one control cycle.
    pub fn tick<D: RigidBodyDynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        input: &TickInput,
    ) -> Result<TickOutput, TickError> {
        let result = self.run(dynamics, input);
        if let Err(err) = &result {
            self.state.warm_start = None;
            if matches!(err, TickError::DimensionMismatch { .. }) {
                self.workspace.invalidate();
            }
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    fn run<D: RigidBodyDynamics + ?Sized>(
        &mut self,
        dynamics: &D,
        input: &TickInput,
    ) -> Result<TickOutput, TickError> {
        let nv = self.rpc.nv;
        let command = &input.command;
        check_dim("dynamics velocities", nv, dynamics.num_velocities())?;
        check_dim("q", nv, input.q.len())?;
        check_dim("qd", nv, input.qd.len())?;
        check_dim("q_des", nv, command.q_des.len())?;
        check_dim(
            "contact_sensed",
            command.supports.len(),
            input.contact_sensed.len(),
        )?;
        let params = self
            .param_sets
            .get(&command.param_set_name)
            .ok_or_else(|| TickError::UnknownParamSet(command.param_set_name.clone()))?;
        validate_command(command, dynamics.num_bodies())?;

        let (q, qd) = (&input.q, &input.qd);
        let dt = tick_dt(self.state.t_prev, input.t);

        // --- Supports ---
        let supports = resolve_supports(
            dynamics,
            q,
            &command.supports,
            &input.contact_sensed,
            params.contact_threshold,
            self.settings.terrain_height,
        );
        let active: Vec<SupportElement> =
            supports.iter().filter(|s| s.is_active()).cloned().collect();
        let cold_start = match self.state.active_support_count_prev {
            Some(prev) if (prev == 0) != active.is_empty() => {
                tracing::debug!(
                    before = prev,
                    now = active.len(),
                    "all supports lost or gained, cold start"
                );
                true
            }
            _ => false,
        };

        // --- References ---
        let pid = whole_body_pid(
            &params.whole_body,
            &self.rpc,
            dt,
            q,
            qd,
            &command.q_des,
            &self.state.q_integrator_state,
        );
        let objectives = command
            .body_motions
            .iter()
            .map(|motion| {
                let body_params = self.body_params(params, motion.body);
                ObjectiveSpec {
                    body: motion.body,
                    vdot_des: body_motion_pd(motion, body_params),
                    weight: motion.weight,
                    bounds: motion
                        .accel_bounds
                        .clone()
                        .or_else(|| body_params.map(|p| p.accel_bounds.clone())),
                }
            })
            .collect();

        // --- Build ---
        let terms = evaluate(dynamics, q, qd, &active, objectives)?;
        let layout = build(
            &mut self.workspace,
            &BuildInputs {
                params,
                rpc: &self.rpc,
                terms: &terms,
                supports: &active,
                q,
                qd,
                qdd_des: &pid.qdd_des,
                kdot_des: command.kdot_des,
            },
        );

        // --- Solve ---
        let warm_start = if cold_start {
            None
        } else {
            self.state.warm_start.as_ref()
        };
        let start = Instant::now();
        let deadline = start + Duration::from_micros(self.settings.solve_budget_us);
        let solved = self.session.solve(
            &self.workspace.problem(),
            ProblemTag::from_layout(&layout),
            warm_start,
            self.settings.use_fast_qp,
            deadline,
        );
        let solve_time_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let outcome = match solved {
            Ok(outcome) => outcome,
            Err(failure) => {
                let (policy, fallback) = self.fail_safe(&terms.h, &terms.c, &pid);
                tracing::error!(
                    t = input.t,
                    fast = ?failure.fast,
                    robust = ?failure.robust,
                    policy = ?policy,
                    "QP solve failed, applying fail-safe output"
                );
                return Err(TickError::SolverFailure {
                    fast: failure.fast,
                    robust: failure.robust,
                    fallback: Box::new(fallback),
                    policy,
                });
            }
        };

        // --- Output ---
        let assembled = assemble(&self.workspace, &layout, &outcome.x);
        let foot_contact = foot_contacts(&self.rpc.feet, &supports);
        let vref = velocity_reference(
            &params.vref_integrator,
            &self.rpc,
            dt,
            qd,
            &assembled.qdd,
            &foot_contact,
            &self.state.contact_prev,
            &self.state.vref_integrator_state,
        );
        let output = QpControllerOutput {
            q_ref: pid.q_ref,
            qd_ref: vref.qd_ref,
            qdd: assembled.qdd.clone(),
            u: assembled.u.clone(),
        };

        let debug = self.settings.capture_debug.then(|| {
            Box::new(DebugData::capture(
                &DebugContext {
                    tick: self.state.ticks,
                    t: input.t,
                    param_set: &command.param_set_name,
                    active_supports: &active,
                    qdd_des: &pid.qdd_des,
                    solver: outcome.solver,
                    fast_status: outcome.fast_status,
                },
                &self.workspace,
                &layout,
                &outcome.x,
                &assembled,
            ))
        });

        // --- Commit ---
        let state = &mut self.state;
        state.t_prev = Some(input.t);
        state.contact_prev = foot_contact;
        state.vref_integrator_state = vref.integrator;
        state.q_integrator_state = pid.integrator;
        state.warm_start = outcome.warm_start;
        state.last_output = Some(output.clone());
        state.active_support_count_prev = Some(active.len());
        state.ticks += 1;

        Ok(TickOutput {
            output,
            contact_forces: assembled.contact_forces,
            active_supports: active,
            solver: outcome.solver,
            solve_time_us,
            debug,
        })
    }

    fn body_params<'p>(&self, params: &'p ControllerParams, body: BodyId) -> Option<&'p BodyMotionParams> {
        params
            .body_motion
            .iter()
            .find(|p| self.body_ids.get(&p.body) == Some(&body))
    }

    /// Output to apply when no QP solution exists, and the policy that made it.
    fn fail_safe(
        &self,
        h: &DMatrix<f64>,
        c: &DVector<f64>,
        pid: &PidOutput,
    ) -> (FailSafePolicy, QpControllerOutput) {
        if self.settings.fail_safe == FailSafePolicy::HoldPrevious {
            if let Some(previous) = &self.state.last_output {
                return (FailSafePolicy::HoldPrevious, previous.clone());
            }
        }
        let rpc = &self.rpc;
        let h_act = h.select_rows(rpc.actuated.iter());
        let c_act = c.select_rows(rpc.actuated.iter());
        let mut u = &rpc.b_act_inv * (h_act * &pid.qdd_des + c_act);
        for (i, value) in u.iter_mut().enumerate() {
            *value = value.clamp(rpc.umin[i], rpc.umax[i]);
        }
        let output = QpControllerOutput {
            q_ref: pid.q_ref.clone(),
            qd_ref: DVector::zeros(rpc.nv),
            qdd: pid.qdd_des.clone(),
            u,
        };
        (FailSafePolicy::PidTorque, output)
    }
}

/// Validate parameter sets against the model and resolve their body names.
fn resolve_param_sets<D: RigidBodyDynamics + ?Sized>(
    dynamics: &D,
    param_sets: &ParamSets,
    nv: usize,
) -> Result<BTreeMap<String, BodyId>, ConfigError> {
    if param_sets.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "param_sets".into(),
            message: "at least one parameter set is required".into(),
        });
    }
    param_sets.validate()?;
    param_sets.validate_dofs(nv)?;

    let mut body_ids = BTreeMap::new();
    for (_, params) in param_sets.iter() {
        for body in &params.body_motion {
            let id = dynamics
                .body_id(&body.body)
                .ok_or_else(|| ConfigError::UnknownBody(body.body.clone()))?;
            body_ids.insert(body.body.clone(), id);
        }
    }
    Ok(body_ids)
}

/// Reject commands that are well-sized but unusable.
fn validate_command(command: &QpInput, num_bodies: usize) -> Result<(), TickError> {
    for (i, support) in command.supports.iter().enumerate() {
        if support.body >= num_bodies {
            return Err(TickError::UnknownBody(support.body));
        }
        let norm = support.normal.norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(TickError::InvalidCommand(format!(
                "support {i} has a degenerate normal"
            )));
        }
        if !(support.mu.is_finite() && support.mu >= 0.0) {
            return Err(TickError::InvalidCommand(format!(
                "support {i} has friction coefficient {}",
                support.mu
            )));
        }
        if support.geometry.num_points() == 0 {
            return Err(TickError::InvalidCommand(format!(
                "support {i} has no contact points"
            )));
        }
    }
    for motion in &command.body_motions {
        if motion.body >= num_bodies {
            return Err(TickError::UnknownBody(motion.body));
        }
        if let Some(bounds) = &motion.accel_bounds {
            check_dim("body acceleration bounds", 6, bounds.len())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SupportData;
    use nalgebra::Vector3;
    use poise_model::biped::{L_FOOT, NV, PELVIS, R_FOOT};
    use poise_model::PointFootBiped;

    fn controller(model: &PointFootBiped) -> QpController {
        QpController::new(
            model,
            &model.layout(),
            ParamSets::single("standing", ControllerParams::uniform(NV, 10.0, 1.0)),
            ControllerSettings::default(),
        )
        .unwrap()
    }

    fn standing_input(model: &PointFootBiped, t: f64) -> TickInput {
        let q = model.standing_configuration();
        TickInput {
            t,
            q: q.clone(),
            qd: DVector::zeros(NV),
            contact_sensed: vec![true, true],
            command: QpInput::hold(
                "standing",
                q,
                vec![SupportData::point(L_FOOT, 1.0), SupportData::point(R_FOOT, 1.0)],
            ),
        }
    }

    #[test]
    fn unknown_param_set_commits_nothing() {
        let model = PointFootBiped::default();
        let mut ctrl = controller(&model);
        let mut input = standing_input(&model, 0.0);
        input.command.param_set_name = "walking".into();
        let err = ctrl.tick(&model, &input).unwrap_err();
        assert!(matches!(err, TickError::UnknownParamSet(ref name) if name == "walking"));
        assert_eq!(ctrl.state().t_prev, None);
        assert_eq!(ctrl.state().ticks, 0);
    }

    #[test]
    fn bad_support_body_rejected() {
        let model = PointFootBiped::default();
        let mut ctrl = controller(&model);
        let mut input = standing_input(&model, 0.0);
        input.command.supports[1].body = 42;
        assert!(matches!(
            ctrl.tick(&model, &input),
            Err(TickError::UnknownBody(42))
        ));
    }

    #[test]
    fn degenerate_support_rejected() {
        let model = PointFootBiped::default();
        let mut ctrl = controller(&model);
        let mut input = standing_input(&model, 0.0);
        input.command.supports[0].normal = Vector3::zeros();
        assert!(matches!(
            ctrl.tick(&model, &input),
            Err(TickError::InvalidCommand(_))
        ));

        let mut input = standing_input(&model, 0.0);
        input.command.supports[0].mu = -0.1;
        assert!(matches!(
            ctrl.tick(&model, &input),
            Err(TickError::InvalidCommand(_))
        ));
    }

    #[test]
    fn contact_sensed_length_checked() {
        let model = PointFootBiped::default();
        let mut ctrl = controller(&model);
        let mut input = standing_input(&model, 0.0);
        input.contact_sensed.pop();
        assert!(matches!(
            ctrl.tick(&model, &input),
            Err(TickError::DimensionMismatch {
                what: "contact_sensed",
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn body_motion_params_must_name_known_bodies() {
        let model = PointFootBiped::default();
        let mut params = ControllerParams::uniform(NV, 10.0, 1.0);
        params.body_motion.push(BodyMotionParams {
            body: "tail".into(),
            kp: [0.0; 6],
            kd: [0.0; 6],
            accel_bounds: poise_core::config::Bounds::unbounded(6),
            weight: 1.0,
        });
        let err = QpController::new(
            &model,
            &model.layout(),
            ParamSets::single("standing", params),
            ControllerSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBody(ref name) if name == "tail"));
    }

    #[test]
    fn body_params_resolved_by_id() {
        let model = PointFootBiped::default();
        let mut params = ControllerParams::uniform(NV, 10.0, 1.0);
        params.body_motion.push(BodyMotionParams {
            body: "pelvis".into(),
            kp: [1.0; 6],
            kd: [1.0; 6],
            accel_bounds: poise_core::config::Bounds::symmetric(6, 3.0),
            weight: 1.0,
        });
        let ctrl = QpController::new(
            &model,
            &model.layout(),
            ParamSets::single("standing", params.clone()),
            ControllerSettings::default(),
        )
        .unwrap();
        assert!(ctrl.body_params(&params, PELVIS).is_some());
        assert!(ctrl.body_params(&params, L_FOOT).is_none());
    }

    #[test]
    fn empty_param_sets_rejected() {
        let model = PointFootBiped::default();
        let err = QpController::new(
            &model,
            &model.layout(),
            ParamSets::default(),
            ControllerSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
