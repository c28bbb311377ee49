//! Solve orchestration: fast path, validation, robust fallback, warm start.

use std::time::Instant;

use nalgebra::DVector;
use poise_core::config::ControllerSettings;
use serde::Serialize;

use crate::solver::{ActiveSetSolver, InteriorPointSolver, QpBackend, QpProblem, QpSolution, QpStatus};
use crate::state::{ProblemTag, WarmStartToken};
use crate::types::SolverKind;

/// Relative constraint violation above which a solution is rejected.
pub const FEASIBILITY_TOLERANCE: f64 = 1e-3;

/// Counters over the lifetime of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SolveStats {
    pub solves: u64,
    pub fast_attempts: u64,
    pub warm_starts: u64,
    pub fast_accepted: u64,
    pub robust_attempts: u64,
    pub robust_accepted: u64,
    pub failures: u64,
}

/// An accepted solution.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub x: DVector<f64>,
    pub solver: SolverKind,
    /// Status of the fast attempt, when one was made.
    pub fast_status: Option<QpStatus>,
    /// Token to store for the next tick.
    pub warm_start: Option<WarmStartToken>,
}

/// Both backends failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SolveFailure {
    pub fast: Option<QpStatus>,
    pub robust: QpStatus,
}

/// Owns the QP backends for the lifetime of a controller.
pub struct SolverSession {
    fast: Box<dyn QpBackend>,
    robust: Box<dyn QpBackend>,
    stats: SolveStats,
    generation: u64,
}

impl std::fmt::Debug for SolverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverSession")
            .field("fast", &self.fast.name())
            .field("robust", &self.robust.name())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SolverSession {
    /// Active-set fast path and Clarabel fallback.
    pub fn new(settings: &ControllerSettings) -> Self {
        Self::with_backends(
            Box::new(ActiveSetSolver::new(settings.max_active_set_iterations)),
            Box::new(InteriorPointSolver::default()),
        )
    }

    pub fn with_backends(fast: Box<dyn QpBackend>, robust: Box<dyn QpBackend>) -> Self {
        Self {
            fast,
            robust,
            stats: SolveStats::default(),
            generation: 0,
        }
    }

    pub const fn stats(&self) -> &SolveStats {
        &self.stats
    }

    /// Solve `problem`, trying the fast backend first when `use_fast`.
    ///
    /// `warm_start` seeds the fast backend only when its tag equals `tag`.
    pub fn solve(
        &mut self,
        problem: &QpProblem<'_>,
        tag: ProblemTag,
        warm_start: Option<&WarmStartToken>,
        use_fast: bool,
        deadline: Instant,
    ) -> Result<SolveOutcome, SolveFailure> {
        self.stats.solves += 1;

        let mut fast_status = None;
        if use_fast {
            let seed = warm_start.and_then(|token| token.active_set_for(&tag));
            if warm_start.is_some() && seed.is_none() {
                tracing::debug!("warm start does not match problem shape, cold start");
            }
            self.stats.fast_attempts += 1;
            if seed.is_some() {
                self.stats.warm_starts += 1;
            }

            let solution = self.fast.solve(problem, seed, deadline);
            fast_status = Some(solution.status);
            match check_solution(problem, &solution) {
                Ok(()) => {
                    self.stats.fast_accepted += 1;
                    let warm_start = self.token(tag, solution.active_set);
                    return Ok(SolveOutcome {
                        x: solution.x,
                        solver: SolverKind::Fast,
                        fast_status,
                        warm_start,
                    });
                }
                Err(reason) => {
                    tracing::debug!(
                        backend = self.fast.name(),
                        status = ?solution.status,
                        iterations = solution.iterations,
                        reason,
                        "fast QP rejected, falling back"
                    );
                }
            }
        }

        self.stats.robust_attempts += 1;
        let solution = self.robust.solve(problem, None, deadline);
        let (robust_status, reason) = match check_solution(problem, &solution) {
            Ok(()) => {
                self.stats.robust_accepted += 1;
                let warm_start = self.token(tag, solution.active_set);
                return Ok(SolveOutcome {
                    x: solution.x,
                    solver: SolverKind::Robust,
                    fast_status,
                    warm_start,
                });
            }
            Err(reason) if solution.status == QpStatus::Optimal => {
                (QpStatus::NumericalFailure, reason)
            }
            Err(reason) => (solution.status, reason),
        };

        tracing::warn!(
            backend = self.robust.name(),
            status = ?robust_status,
            fast = ?fast_status,
            reason,
            "robust QP failed"
        );
        self.stats.failures += 1;
        Err(SolveFailure {
            fast: fast_status,
            robust: robust_status,
        })
    }

    fn token(&mut self, tag: ProblemTag, active_set: Option<Vec<usize>>) -> Option<WarmStartToken> {
        let active_set = active_set?;
        self.generation += 1;
        Some(WarmStartToken {
            tag,
            active_set,
            generation: self.generation,
        })
    }
}

/// Accept a backend solution only if it is usable as is.
fn check_solution(problem: &QpProblem<'_>, solution: &QpSolution) -> Result<(), &'static str> {
    if solution.status != QpStatus::Optimal {
        return Err("status");
    }
    if solution.x.len() != problem.nx() {
        return Err("solution length");
    }
    if solution.x.iter().any(|v| !v.is_finite()) {
        return Err("non-finite solution");
    }
    if let Some(active) = &solution.active_set {
        if active.iter().any(|&i| i >= problem.n_in()) {
            return Err("active set out of range");
        }
    }
    let scale = 1.0 + if problem.n_eq() == 0 { 0.0 } else { problem.b_eq.amax() };
    if problem.equality_residual(&solution.x) > FEASIBILITY_TOLERANCE * scale {
        return Err("equality residual");
    }
    let scale = 1.0 + if problem.n_in() == 0 { 0.0 } else { problem.b_in.amax() };
    if problem.inequality_violation(&solution.x) > FEASIBILITY_TOLERANCE * scale {
        return Err("inequality violation");
    }
    Ok(())
}
