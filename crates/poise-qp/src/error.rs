use poise_core::config::FailSafePolicy;
use poise_core::traits::BodyId;
use thiserror::Error;

use crate::solver::QpStatus;
use crate::types::QpControllerOutput;

/// Tick-level failures.
///
/// Every failure leaves the controller state as it was before the tick,
/// except that the warm start is discarded.
#[derive(Debug, Error)]
pub enum TickError {
    /// An input or a dynamics quantity does not have the expected size.
    #[error("Dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Unknown body id {0}")]
    UnknownBody(BodyId),

    #[error("Unknown parameter set: {0}")]
    UnknownParamSet(String),

    /// The command is well-sized but not usable (bad normal, negative friction, ...).
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Both QP backends failed. Carries the fail-safe output to apply instead.
    #[error("QP solve failed (fast: {fast:?}, robust: {robust:?}), fail-safe {policy:?} applied")]
    SolverFailure {
        fast: Option<QpStatus>,
        robust: QpStatus,
        fallback: Box<QpControllerOutput>,
        policy: FailSafePolicy,
    },
}

impl TickError {
    /// Fail-safe output attached to a solver failure.
    pub fn fallback_output(&self) -> Option<&QpControllerOutput> {
        match self {
            Self::SolverFailure { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}

/// Compare a length against its expected value.
pub(crate) fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<(), TickError> {
    if expected == got {
        Ok(())
    } else {
        Err(TickError::DimensionMismatch {
            what,
            expected,
            got,
        })
    }
}
