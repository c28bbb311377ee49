//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use nalgebra::DVector;
use poise_core::config::{ControllerParams, ControllerSettings, ParamSets};
use poise_model::biped::{L_FOOT, NV, R_FOOT};
use poise_model::PointFootBiped;
use poise_qp::{
    QpBackend, QpController, QpInput, QpProblem, QpSolution, QpStatus, SupportData, TickInput,
};

pub const DT: f64 = 0.002;

pub fn model() -> PointFootBiped {
    PointFootBiped::default()
}

pub fn standing_params() -> ControllerParams {
    ControllerParams::uniform(NV, 10.0, 1.0)
}

pub fn controller_with(model: &PointFootBiped, settings: ControllerSettings) -> QpController {
    QpController::new(
        model,
        &model.layout(),
        ParamSets::single("standing", standing_params()),
        settings,
    )
    .unwrap()
}

pub fn controller(model: &PointFootBiped) -> QpController {
    controller_with(model, ControllerSettings::default())
}

/// Standing still on both feet, both contacts sensed.
pub fn standing_input(model: &PointFootBiped, t: f64) -> TickInput {
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

/// Standing on the left foot with the right foot lifted 10 cm.
pub fn left_stance_input(model: &PointFootBiped, t: f64) -> TickInput {
    let mut input = standing_input(model, t);
    input.q[9] += 0.1;
    input.command.q_des = input.q.clone();
    input.contact_sensed = vec![true, false];
    input
}

/// The whole robot 0.5 m above the ground, nothing sensed.
pub fn flight_input(model: &PointFootBiped, t: f64) -> TickInput {
    let mut input = standing_input(model, t);
    input.q[2] += 0.5;
    input.command.q_des = input.q.clone();
    input.contact_sensed = vec![false, false];
    input
}

/// A backend that always reports the same failure.
pub struct Failing(pub QpStatus);

impl QpBackend for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn solve(&mut self, _: &QpProblem<'_>, _: Option<&[usize]>, _: Instant) -> QpSolution {
        QpSolution::failed(self.0, 0)
    }
}

/// Sleeps before delegating, so the deadline can expire.
pub struct Sleepy<B>(pub B, pub Duration);

impl<B: QpBackend> QpBackend for Sleepy<B> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn solve(
        &mut self,
        problem: &QpProblem<'_>,
        warm_start: Option<&[usize]>,
        deadline: Instant,
    ) -> QpSolution {
        std::thread::sleep(self.1);
        self.0.solve(problem, warm_start, deadline)
    }
}
