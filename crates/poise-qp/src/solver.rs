//! QP backends.
//!
//! Problems have the form
//!
//! ```text
//! minimize    ½ xᵀ H x + fᵀ x
//! subject to  A_eq x  = b_eq
//!             A_in x <= b_in
//! ```
//!
//! Two backends ship:
//! - [`ActiveSetSolver`]: dense primal-dual active-set iteration on the KKT
//!   system, warm-started from a previous active set. Fast when the active set
//!   changes little between ticks, but may give up (singular working set,
//!   iteration limit).
//! - [`InteriorPointSolver`]: Clarabel (pure Rust interior-point solver).
//!   Slower, no warm start, robust.
//!
//! Active sets are indices into the inequality block.

use std::time::Instant;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
    SupportedConeT::{NonnegativeConeT, ZeroConeT},
};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Problem and solution
// ---------------------------------------------------------------------------

/// Borrowed view of a QP.
#[derive(Clone, Copy, Debug)]
pub struct QpProblem<'a> {
    pub hessian: &'a DMatrix<f64>,
    pub linear: &'a DVector<f64>,
    pub a_eq: &'a DMatrix<f64>,
    pub b_eq: &'a DVector<f64>,
    pub a_in: &'a DMatrix<f64>,
    pub b_in: &'a DVector<f64>,
}

impl QpProblem<'_> {
    pub fn nx(&self) -> usize {
        self.linear.len()
    }

    pub fn n_eq(&self) -> usize {
        self.b_eq.len()
    }

    pub fn n_in(&self) -> usize {
        self.b_in.len()
    }

    /// Infinity norm of `A_eq x - b_eq`.
    pub fn equality_residual(&self, x: &DVector<f64>) -> f64 {
        if self.n_eq() == 0 {
            return 0.0;
        }
        (self.a_eq * x - self.b_eq).amax()
    }

    /// Largest violation of `A_in x <= b_in`, zero when feasible.
    pub fn inequality_violation(&self, x: &DVector<f64>) -> f64 {
        if self.n_in() == 0 {
            return 0.0;
        }
        (self.a_in * x - self.b_in).max().max(0.0)
    }
}

/// Backend outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum QpStatus {
    Optimal,
    Infeasible,
    NumericalFailure,
    IterationLimit,
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub status: QpStatus,
    /// Active inequality rows at the solution, when the backend reports them.
    pub active_set: Option<Vec<usize>>,
    /// Iterations used. Zero for backends that do not report it.
    pub iterations: u32,
}

impl QpSolution {
    /// A solution carrying only a failure status.
    pub fn failed(status: QpStatus, iterations: u32) -> Self {
        Self {
            x: DVector::zeros(0),
            status,
            active_set: None,
            iterations,
        }
    }
}

/// A QP solver.
pub trait QpBackend {
    fn name(&self) -> &'static str;

    /// Solve `problem`, optionally seeded with an active set, before `deadline`.
    fn solve(
        &mut self,
        problem: &QpProblem<'_>,
        warm_start: Option<&[usize]>,
        deadline: Instant,
    ) -> QpSolution;
}

// ---------------------------------------------------------------------------
// Active-set backend
// ---------------------------------------------------------------------------

/// Dense active-set solver with warm start.
///
/// Each iteration solves the equality-constrained KKT system over the working
/// set, then drops the working row with the most negative multiplier or, if
/// all multipliers are non-negative, adds the most violated inactive row.
/// Stops when neither applies.
///
/// The working set is kept linearly independent of the equalities. A violated
/// row that the working set already implies replaces an idle working row
/// (multiplier near zero); when there is none the problem is reported
/// infeasible.
#[derive(Clone, Debug)]
pub struct ActiveSetSolver {
    pub max_iter: u32,
    /// Primal feasibility and dual sign tolerance.
    pub tolerance: f64,
}

impl Default for ActiveSetSolver {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tolerance: 1e-7,
        }
    }
}

impl ActiveSetSolver {
    pub fn new(max_iter: u32) -> Self {
        Self {
            max_iter,
            ..Self::default()
        }
    }
}

/// Singular value threshold, relative to the largest constraint coefficient,
/// below which constraint rows count as linearly dependent.
const RANK_TOLERANCE: f64 = 1e-9;

/// Solve the KKT system with the equalities and the `working` inequality rows.
///
/// Returns `x` and the multipliers of the working rows, or `None` when the
/// system is singular.
fn solve_kkt(problem: &QpProblem<'_>, working: &[usize]) -> Option<(DVector<f64>, DVector<f64>)> {
    let nx = problem.nx();
    let n_eq = problem.n_eq();
    let m = n_eq + working.len();
    let n = nx + m;

    let mut kkt = DMatrix::zeros(n, n);
    let mut rhs = DVector::zeros(n);
    kkt.view_mut((0, 0), (nx, nx)).copy_from(problem.hessian);
    rhs.rows_mut(0, nx).copy_from(&(-problem.linear));

    let rows = (0..n_eq)
        .map(|i| (problem.a_eq.row(i), problem.b_eq[i]))
        .chain(
            working
                .iter()
                .map(|&i| (problem.a_in.row(i), problem.b_in[i])),
        );
    for (k, (row, b)) in rows.enumerate() {
        kkt.view_mut((nx + k, 0), (1, nx)).copy_from(&row);
        kkt.view_mut((0, nx + k), (nx, 1)).copy_from(&row.transpose());
        rhs[nx + k] = b;
    }

    let solution = kkt.lu().solve(&rhs)?;
    let x = solution.rows(0, nx).into_owned();
    let multipliers = solution.rows(nx + n_eq, working.len()).into_owned();
    Some((x, multipliers))
}

impl QpBackend for ActiveSetSolver {
    fn name(&self) -> &'static str {
        "active-set"
    }

    fn solve(
        &mut self,
        problem: &QpProblem<'_>,
        warm_start: Option<&[usize]>,
        deadline: Instant,
    ) -> QpSolution {
        let n_in = problem.n_in();
        // Working rows in insertion order. Seed rows that are out of range or
        // implied by earlier rows are skipped.
        let mut working: Vec<usize> = Vec::new();
        for &row in warm_start.unwrap_or_default() {
            if row < n_in && !working.contains(&row) && is_independent(problem, &working, row) {
                working.push(row);
            }
        }

        for iteration in 1..=self.max_iter {
            if Instant::now() >= deadline {
                return QpSolution::failed(QpStatus::Timeout, iteration - 1);
            }

            let Some((x, multipliers)) = solve_kkt(problem, &working) else {
                // Singular KKT: shed the newest working row and retry.
                if working.pop().is_some() {
                    continue;
                }
                return QpSolution::failed(QpStatus::NumericalFailure, iteration);
            };
            if x.iter().chain(multipliers.iter()).any(|v| !v.is_finite()) {
                return QpSolution::failed(QpStatus::NumericalFailure, iteration);
            }

            let most_negative = multipliers
                .iter()
                .enumerate()
                .filter(|(_, l)| **l < -self.tolerance)
                .min_by(|a, b| a.1.total_cmp(b.1));
            if let Some((pos, _)) = most_negative {
                working.remove(pos);
                continue;
            }

            let slack = problem.a_in * &x - problem.b_in;
            let most_violated = slack
                .iter()
                .enumerate()
                .filter(|(i, s)| {
                    **s > self.tolerance * (1.0 + problem.b_in[*i].abs()) && !working.contains(i)
                })
                .max_by(|a, b| a.1.total_cmp(b.1));
            if let Some((row, _)) = most_violated {
                if is_independent(problem, &working, row) {
                    working.push(row);
                    continue;
                }
                // The violated row is implied by the working set. Release the
                // working row with the smallest multiplier if it is idle.
                let idle = multipliers
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| **l <= self.tolerance)
                    .min_by(|a, b| a.1.total_cmp(b.1));
                if let Some((pos, _)) = idle {
                    working.remove(pos);
                    continue;
                }
                return QpSolution::failed(QpStatus::Infeasible, iteration);
            }

            working.sort_unstable();
            return QpSolution {
                x,
                status: QpStatus::Optimal,
                active_set: Some(working),
                iterations: iteration,
            };
        }

        QpSolution::failed(QpStatus::IterationLimit, self.max_iter)
    }
}

/// Whether inequality row `row` adds rank to the equalities plus `working`.
fn is_independent(problem: &QpProblem<'_>, working: &[usize], row: usize) -> bool {
    let nx = problem.nx();
    let n_eq = problem.n_eq();
    let base = n_eq + working.len();
    let mut rows = DMatrix::zeros(base + 1, nx);
    rows.view_mut((0, 0), (n_eq, nx)).copy_from(problem.a_eq);
    for (k, &i) in working.iter().enumerate() {
        rows.row_mut(n_eq + k).copy_from(&problem.a_in.row(i));
    }
    rows.row_mut(base).copy_from(&problem.a_in.row(row));

    let eps = RANK_TOLERANCE * rows.amax().max(1.0);
    let with_row = rows.rank(eps);
    let without = if base == 0 {
        0
    } else {
        rows.rows(0, base).into_owned().rank(eps)
    };
    with_row > without
}

// ---------------------------------------------------------------------------
// Interior-point backend
// ---------------------------------------------------------------------------

/// Clarabel interior-point solver. Ignores warm starts.
///
/// The reported active set is the inequality rows tight within
/// `active_tolerance` at the solution.
#[derive(Clone, Debug)]
pub struct InteriorPointSolver {
    pub max_iter: u32,
    pub active_tolerance: f64,
}

impl Default for InteriorPointSolver {
    fn default() -> Self {
        Self {
            max_iter: 100,
            active_tolerance: 1e-6,
        }
    }
}

impl QpBackend for InteriorPointSolver {
    fn name(&self) -> &'static str {
        "clarabel"
    }

    fn solve(
        &mut self,
        problem: &QpProblem<'_>,
        _warm_start: Option<&[usize]>,
        deadline: Instant,
    ) -> QpSolution {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return QpSolution::failed(QpStatus::Timeout, 0);
        }

        let nx = problem.nx();
        let n_eq = problem.n_eq();
        let n_in = problem.n_in();

        // Equalities first: Clarabel's zero cone then nonnegative cone.
        // A x + s = b with s >= 0 means A x <= b.
        let mut a_all = DMatrix::zeros(n_eq + n_in, nx);
        a_all.view_mut((0, 0), (n_eq, nx)).copy_from(problem.a_eq);
        a_all.view_mut((n_eq, 0), (n_in, nx)).copy_from(problem.a_in);
        let b_all: Vec<f64> = problem.b_eq.iter().chain(problem.b_in.iter()).copied().collect();
        let q: Vec<f64> = problem.linear.iter().copied().collect();

        let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if n_in > 0 {
            cones.push(NonnegativeConeT(n_in));
        }

        let p_csc = dmatrix_to_csc_upper_tri(problem.hessian);
        let a_csc = dmatrix_to_csc(&a_all);

        let Ok(settings) = DefaultSettingsBuilder::default()
            .max_iter(self.max_iter)
            .verbose(false)
            .time_limit(remaining.as_secs_f64())
            .build()
        else {
            return QpSolution::failed(QpStatus::NumericalFailure, 0);
        };

        let Ok(mut solver) = DefaultSolver::new(&p_csc, &q, &a_csc, &b_all, &cones, settings) else {
            return QpSolution::failed(QpStatus::NumericalFailure, 0);
        };
        solver.solve();
        let sol = &solver.solution;

        let status = match sol.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => QpStatus::Optimal,
            SolverStatus::PrimalInfeasible
            | SolverStatus::DualInfeasible
            | SolverStatus::AlmostPrimalInfeasible
            | SolverStatus::AlmostDualInfeasible => QpStatus::Infeasible,
            SolverStatus::MaxIterations => QpStatus::IterationLimit,
            SolverStatus::MaxTime => QpStatus::Timeout,
            _ => QpStatus::NumericalFailure,
        };
        if status != QpStatus::Optimal {
            return QpSolution::failed(status, 0);
        }

        let x = DVector::from_column_slice(&sol.x);
        let slack = problem.b_in - problem.a_in * &x;
        let active_set = slack
            .iter()
            .enumerate()
            .filter(|(i, s)| **s <= self.active_tolerance * (1.0 + problem.b_in[*i].abs()))
            .map(|(i, _)| i)
            .collect();

        QpSolution {
            x,
            status,
            active_set: Some(active_set),
            iterations: 0,
        }
    }
}

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>` (full matrix).
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert a symmetric nalgebra `DMatrix<f64>` to upper-triangular `CscMatrix<f64>`.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows.min(j + 1) {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
