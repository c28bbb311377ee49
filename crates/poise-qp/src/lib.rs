//! Per-tick whole-body QP balance controller for legged robots.
//!
//! Every control cycle turns the measured state and a decoded command into
//! joint accelerations, contact forces and actuator efforts by solving one
//! convex QP:
//!
//! 1. **Support resolution**: which candidate contacts bear force this tick
//! 2. **Reference generation**: whole-body PID, body-motion PD, velocity
//!    reference integrator
//! 3. **Problem build**: floating-base dynamics, contact, friction cone,
//!    actuator and acceleration limits into a reused workspace
//! 4. **Solve**: warm-started active-set solver, Clarabel fallback
//! 5. **Output**: torques through the dynamics relation, contact forces
//!
//! # Architecture
//!
//! The dynamics engine is reached only through
//! [`poise_core::RigidBodyDynamics`]. [`QpController`] owns all persistent
//! state (integrators, warm start, problem buffers, solver session) and is
//! driven by [`QpController::tick`], which commits state only when the tick
//! succeeds.

pub mod builder;
pub mod controller;
pub mod error;
pub mod output;
pub mod reference;
pub mod robot;
pub mod solve;
pub mod solver;
pub mod state;
pub mod support;
pub mod terms;
pub mod types;

pub use builder::{EDGES_PER_POINT, ProblemLayout, QpWorkspace, friction_edges};
pub use controller::QpController;
pub use error::TickError;
pub use output::DebugData;
pub use robot::RobotPropertyCache;
pub use solve::{SolveStats, SolverSession};
pub use solver::{ActiveSetSolver, InteriorPointSolver, QpBackend, QpProblem, QpSolution, QpStatus};
pub use state::{ControllerState, ProblemTag, WarmStartToken};
pub use types::{
    BodyTrackingError, ContactGeometry, DesiredBodyMotion, QpControllerOutput, QpInput,
    SolverKind, SupportData, SupportElement, SupportMode, TickInput, TickOutput,
};
