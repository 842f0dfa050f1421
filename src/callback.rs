//! Per-evaluation reporting hook.

use faer::MatRef;
use tracing::info;

use crate::E;

/// Snapshot handed to the callback after every forward-pass evaluation.
///
/// Trajectories are views into the candidate produced by the evaluation; they
/// must not be retained past the call.
pub struct IterationReport<'a> {
    /// Outer iteration index.
    pub iter: usize,
    /// Candidate state trajectory, `nx × (N + 1)`.
    pub xtrj: MatRef<'a, E>,
    /// Candidate input trajectory, `nu × N`.
    pub utrj: MatRef<'a, E>,
    /// Step size of this evaluation.
    pub alpha: E,
    /// Total cost, normalized by the horizon length.
    pub cost: E,
    /// Shooting gap norm, normalized by the horizon length.
    pub defect_norm: E,
    /// Equality constraint violation, normalized by the horizon length.
    pub constraint_violation: E,
    /// Bound violation, normalized by the horizon length.
    pub bound_violation: E,
    /// Merit function value.
    pub merit: E,
    /// Merit directional derivative at `alpha = 0`.
    pub merit_der: E,
    /// Accumulated `‖α·l_k‖₁` over the horizon.
    pub step_length: E,
    /// Current state-Hessian regularization.
    pub hxx_reg: E,
    /// Current augmented-Lagrangian penalty.
    pub rho: E,
    /// Whether this evaluation satisfied the acceptance test.
    pub accepted: bool,
}

/// Hook invoked once per forward-pass evaluation.
///
/// Returning `false` asks the solver to stop; the request is honored at the
/// end of the current outer iteration and surfaces as
/// [`Status::Interrupted`](crate::Status::Interrupted). The callback must
/// return promptly and must not reenter the solver.
pub trait Callback {
    fn call(&mut self, report: &IterationReport<'_>) -> bool;
}

/// A callback that does nothing. Use when no per-evaluation output is needed.
pub struct NoOpCallback {}

impl Callback for NoOpCallback {
    fn call(&mut self, _report: &IterationReport<'_>) -> bool {
        true
    }
}

/// Logs cost, gap, and violation figures for every evaluation.
pub struct ConvergenceOutput {}

impl Callback for ConvergenceOutput {
    fn call(&mut self, report: &IterationReport<'_>) -> bool {
        info!(
            iter = report.iter,
            alpha = report.alpha,
            cost = report.cost,
            defect = report.defect_norm,
            violation = report.constraint_violation,
            merit = report.merit,
            accepted = report.accepted,
            "forward pass"
        );
        true
    }
}
