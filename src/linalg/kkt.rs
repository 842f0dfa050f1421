//! Factorization menu for the stage-wise KKT systems.
//!
//! Every backward-pass stage (and the initial-state reconciliation) solves a
//! symmetric saddle-point system of the form:
//!
//! ```text
//! [ H    G^T ] [ primal ]   [ rhs ]
//! [ G   -r I ] [ dual   ] = [ rhs ]
//! ```
//!
//! The factorization is selectable; all variants must agree on well-posed
//! systems. Solves happen in place on a caller-owned right-hand-side buffer,
//! so the only allocation is the factorization's own workspace. A solution
//! containing non-finite entries is reported as an error so the caller can
//! react (the backward pass treats it as an indefinite Hessian and restarts
//! with more regularization).

use derive_more::{Display, Error};
use faer::linalg::solvers::Solve;
use faer::prelude::{Reborrow, ReborrowMut};
use faer::{MatMut, MatRef, Side};

use crate::linalg::mat_all_finite;
use crate::E;

/// Factorization used for the dense KKT solves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KktDecomp {
    /// Partial-pivoting LU.
    #[default]
    Lu,
    /// Householder QR.
    Qr,
    /// Pivoted LDLᵀ (Bunch-Kaufman), suited to symmetric indefinite systems.
    Ldlt,
}

#[derive(Debug, Display, Error, PartialEq)]
pub enum LinalgError {
    #[display("singular value decomposition did not converge")]
    SvdFailed,

    #[display("KKT solution contains non-finite entries")]
    NonFiniteSolution,

    #[display("Hessian regularization grew past {limit:e} without a solvable KKT system")]
    RegularizationExhausted { limit: E },
}

/// Solves `K · X = B` in place with the requested factorization: on entry
/// `rhs` holds `B`, on successful return it holds `X`.
///
/// `rhs` may carry multiple columns; they are all solved from a single
/// factorization.
pub fn solve_kkt_in_place(
    k: MatRef<'_, E>,
    mut rhs: MatMut<'_, E>,
    decomp: KktDecomp,
) -> Result<(), LinalgError> {
    match decomp {
        KktDecomp::Lu => k.partial_piv_lu().solve_in_place(rhs.rb_mut()),
        KktDecomp::Qr => k.qr().solve_in_place(rhs.rb_mut()),
        KktDecomp::Ldlt => k.lblt(Side::Lower).solve_in_place(rhs.rb_mut()),
    }

    if !mat_all_finite(rhs.rb()) {
        return Err(LinalgError::NonFiniteSolution);
    }

    Ok(())
}
