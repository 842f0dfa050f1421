//! Rank-revealing decompositions of the constraint input Jacobian.
//!
//! The backward pass splits the stacked equality constraints
//! `C·Δx + D·Δu + h = 0` into a part that the current stage's input can
//! satisfy and a remainder that must be propagated backward in time. The
//! split is driven by an orthogonal basis of the column space of `D`: with
//! `Q = [Q1 Q2]` and `rank = rank(D)`,
//!
//! ```text
//! Q1^T · (C, D, h)   is solvable in Δu        (feasible rows)
//! Q2^T · (C, h)      has Q2^T·D = 0            (propagated rows)
//! ```
//!
//! Three rank-revealing factorizations are available. They must agree on the
//! optimum for well-separated ranks; they differ in cost and in how the
//! numerical rank is estimated from the factors.

use faer::{Mat, MatRef};

use crate::linalg::kkt::LinalgError;
use crate::E;

/// Rank-revealing factorization used to split the constraint input Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstraintDecomp {
    /// Complete orthogonal decomposition (column-pivoted QR with relative
    /// pivot thresholding). The default.
    #[default]
    Cod,
    /// Column-pivoted QR with a bottom-up scan of the `R` diagonal against
    /// the absolute threshold.
    Qr,
    /// Singular value decomposition. Most robust, slowest.
    Svd,
}

/// Full orthogonal factor of the input Jacobian together with its numerical
/// rank. Columns `0..rank` span the achievable constraint directions.
pub struct OrthogonalSplit {
    pub q: Mat<E>,
    pub rank: usize,
}

/// Computes the orthogonal splitting basis of `d` (shape `n_c × n_u`).
pub fn orthogonal_split(
    d: MatRef<'_, E>,
    decomp: ConstraintDecomp,
    threshold: E,
) -> Result<OrthogonalSplit, LinalgError> {
    let diag_len = usize::min(d.nrows(), d.ncols());

    match decomp {
        ConstraintDecomp::Cod => {
            let qr = d.col_piv_qr();
            let r = qr.R();

            let max_pivot = if diag_len > 0 { r[(0, 0)].abs() } else { 0.0 };
            let mut rank = 0;
            if max_pivot >= threshold {
                for i in 0..diag_len {
                    if r[(i, i)].abs() > threshold * max_pivot {
                        rank += 1;
                    }
                }
            }

            Ok(OrthogonalSplit {
                q: qr.compute_Q(),
                rank,
            })
        }
        ConstraintDecomp::Qr => {
            let qr = d.col_piv_qr();
            let r = qr.R();

            // Pivoting sorts the diagonal by magnitude, so scanning from the
            // bottom up stops at the first entry that clears the threshold.
            let mut rank = diag_len;
            for i in (0..diag_len).rev() {
                if r[(i, i)].abs() < threshold {
                    rank -= 1;
                } else {
                    break;
                }
            }

            Ok(OrthogonalSplit {
                q: qr.compute_Q(),
                rank,
            })
        }
        ConstraintDecomp::Svd => {
            let svd = d.svd().map_err(|_| LinalgError::SvdFailed)?;
            let sv = svd.S().column_vector().to_owned();

            let max_sv = if diag_len > 0 { sv[0] } else { 0.0 };
            let mut rank = 0;
            if max_sv >= threshold {
                for i in 0..diag_len {
                    if sv[i] > threshold * max_sv {
                        rank += 1;
                    }
                }
            }

            Ok(OrthogonalSplit {
                q: svd.U().to_owned(),
                rank,
            })
        }
    }
}
