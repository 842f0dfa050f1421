//! Constrained multiple-shooting iterative LQR.
//!
//! This crate solves discrete-time optimal control problems of the form:
//!
//! ```text
//!   min   Σ_k ℓ_k(x_k, u_k) + ℓ_N(x_N)
//!   s.t.  x_{k+1} = f_k(x_k, u_k)          (shooting dynamics)
//!         h_k(x_k, u_k) = 0                 (equality constraints)
//!         x_lb <= x <= x_ub                 (bounds, via augmented Lagrangian)
//!         u_lb <= u <= u_ub
//! ```
//!
//! over a fixed horizon of `N` shooting intervals. The solver follows the
//! multiple-shooting Gauss-Newton family of iterative LQR methods: a
//! Riccati-style backward pass folds the linearized equality constraints into
//! the value function through rank-revealing decompositions, a line-searched
//! forward pass closes the shooting gaps proportionally to the accepted step,
//! and an outer augmented-Lagrangian loop enforces bound constraints.
//!
//! Dynamics, costs, and constraints are supplied as plain closures returning
//! their values and derivatives; see [`ocp::DiscreteOcp`]. The engine itself
//! lives in [`ilqr::IterativeLqr`].

pub mod callback;
pub mod ilqr;
pub mod linalg;
pub mod ocp;
pub mod terminators;

#[cfg(test)]
mod tests;

pub use crate::ilqr::{IlqrError, IlqrOptions, IterationRecord, IterativeLqr};
pub use crate::linalg::kkt::KktDecomp;
pub use crate::linalg::rank::ConstraintDecomp;
pub use crate::ocp::DiscreteOcp;

use crate::callback::{Callback, NoOpCallback};
use crate::terminators::{NullTerminator, Terminator};

/// Scalar element type used throughout the solver.
pub type E = f64;
/// Index type used throughout the solver.
pub type I = usize;

/// Status codes for the solver.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// The solver is still running.
    InProgress,
    /// A locally optimal solution was found.
    Optimal,
    /// The solver stopped due to the iteration limit.
    IterationLimit,
    /// The solver stopped due to a time limit.
    TimeLimit,
    /// The solver was interrupted (e.g., by the callback or a signal).
    Interrupted,
    /// The status is unknown or not determined.
    Unknown,
}

/// Hooks consulted during a solve.
///
/// The callback runs once per forward-pass evaluation; the terminator is
/// checked between outer iterations.
pub struct SolverHooks {
    pub callback: Box<dyn Callback>,
    pub terminator: Box<dyn Terminator>,
}

impl Default for SolverHooks {
    fn default() -> Self {
        Self {
            callback: Box::new(NoOpCallback {}),
            terminator: Box::new(NullTerminator {}),
        }
    }
}
