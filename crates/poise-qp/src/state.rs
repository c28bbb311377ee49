//! Controller state carried between ticks.

use nalgebra::DVector;
use poise_core::traits::BodyId;
use serde::Serialize;

use crate::builder::ProblemLayout;
use crate::types::QpControllerOutput;

/// Shape of a built problem. A warm start is only valid for a problem with
/// the same tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProblemTag {
    pub n_x: usize,
    pub n_eq: usize,
    pub n_in: usize,
    /// `(body, contact points)` of each active support.
    pub supports: Vec<(BodyId, usize)>,
    /// Body of each motion objective.
    pub objectives: Vec<BodyId>,
    /// Identity of the inequality rows, see [`ProblemLayout::row_signature`].
    pub rows: u64,
}

impl ProblemTag {
    pub fn from_layout(layout: &ProblemLayout) -> Self {
        Self {
            n_x: layout.nx,
            n_eq: layout.n_eq,
            n_in: layout.n_in,
            supports: layout.supports.clone(),
            objectives: layout.objectives.clone(),
            rows: layout.row_signature,
        }
    }
}

/// Active inequality set of an accepted solution, tagged with its problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WarmStartToken {
    pub tag: ProblemTag,
    pub active_set: Vec<usize>,
    /// Solve counter value when the token was stored.
    pub generation: u64,
}

impl WarmStartToken {
    /// The active set, if the token was stored for a problem shaped like `tag`.
    pub fn active_set_for(&self, tag: &ProblemTag) -> Option<&[usize]> {
        (self.tag == *tag).then_some(self.active_set.as_slice())
    }
}

/// Everything the controller remembers between ticks.
///
/// Ticks compute their updates into locals and commit them here only when
/// they succeed.
#[derive(Clone, Debug, Serialize)]
pub struct ControllerState {
    pub t_prev: Option<f64>,
    /// Contact flag per foot of the robot layout.
    pub contact_prev: Vec<bool>,
    pub vref_integrator_state: DVector<f64>,
    pub q_integrator_state: DVector<f64>,
    pub warm_start: Option<WarmStartToken>,
    /// Last successful output, for the hold-previous fail-safe.
    pub last_output: Option<QpControllerOutput>,
    /// Number of active supports on the previous successful tick.
    pub active_support_count_prev: Option<usize>,
    /// Successful ticks since construction or the last reset.
    pub ticks: u64,
}

impl ControllerState {
    pub fn new(nv: usize, n_feet: usize) -> Self {
        Self {
            t_prev: None,
            contact_prev: vec![false; n_feet],
            vref_integrator_state: DVector::zeros(nv),
            q_integrator_state: DVector::zeros(nv),
            warm_start: None,
            last_output: None,
            active_support_count_prev: None,
            ticks: 0,
        }
    }

    /// Return to the freshly constructed state.
    pub fn reset(&mut self) {
        *self = Self::new(self.q_integrator_state.len(), self.contact_prev.len());
    }
}
