//! Per-stage data carried across iterations.
//!
//! Every buffer in this module is sized once at solver construction and then
//! written in place; the solve loop itself performs no allocation. Vector
//! quantities that participate in matrix products are stored as single-column
//! matrices so they can be targets of in-place multiplication.

use faer::{Col, Mat};

use crate::E;

/// Linearized dynamics at a stage: `Δx_{k+1} = A·Δx_k + B·Δu_k + d`, where
/// `d = f(x_k, u_k) − x_{k+1}` is the shooting defect.
pub(crate) struct StageDynamicsData {
    pub a: Mat<E>,
    pub b: Mat<E>,
    pub d: Col<E>,
}

impl StageDynamicsData {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            a: Mat::zeros(nx, nx),
            b: Mat::zeros(nx, nu),
            d: Col::zeros(nx),
        }
    }
}

/// Quadratized stage cost around the current trajectory point.
pub(crate) struct StageCostData {
    pub hess_xx: Mat<E>,
    pub hess_uu: Mat<E>,
    pub hess_ux: Mat<E>,
    pub grad_x: Col<E>,
    pub grad_u: Col<E>,
}

impl StageCostData {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            hess_xx: Mat::zeros(nx, nx),
            hess_uu: Mat::zeros(nu, nu),
            hess_ux: Mat::zeros(nu, nx),
            grad_x: Col::zeros(nx),
            grad_u: Col::zeros(nu),
        }
    }
}

/// Linearized stage constraint `C·Δx + D·Δu + h = 0`; `rows == 0` when the
/// stage has no constraint. Sized on first linearization (`m_k` is fixed per
/// stage) and written in place afterwards.
pub(crate) struct StageConstraintData {
    pub c: Mat<E>,
    pub d: Mat<E>,
    pub h: Col<E>,
    pub rows: usize,
}

impl StageConstraintData {
    pub fn empty(nx: usize, nu: usize) -> Self {
        Self {
            c: Mat::zeros(0, nx),
            d: Mat::zeros(0, nu),
            h: Col::zeros(0),
            rows: 0,
        }
    }
}

/// Quadratic cost-to-go `V(Δx) = ½·Δxᵀ·S·Δx + sᵀ·Δx`.
pub(crate) struct ValueFunction {
    pub hess: Mat<E>,
    pub grad: Col<E>,
}

impl ValueFunction {
    pub fn new(nx: usize) -> Self {
        Self {
            hess: Mat::zeros(nx, nx),
            grad: Col::zeros(nx),
        }
    }
}

/// Stage policy from the backward pass: `Δu = gain·Δx + α·ffwd`. The
/// multiplier buffer holds `nc` active rows (at most `n_u`, the feasible rank
/// never exceeds the input dimension).
pub(crate) struct BackwardPassResult {
    pub gain: Mat<E>,
    pub ffwd: Col<E>,
    pub lam: Col<E>,
    pub nc: usize,
}

impl BackwardPassResult {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            gain: Mat::zeros(nu, nx),
            ffwd: Col::zeros(nu),
            lam: Col::zeros(nu),
            nc: 0,
        }
    }
}

/// Candidate trajectory and its metrics from the latest forward pass.
pub(crate) struct ForwardPassResult {
    pub xtrj: Mat<E>,
    pub utrj: Mat<E>,
    pub alpha: E,
    pub cost: E,
    pub defect_norm: E,
    pub constraint_violation: E,
    pub bound_violation: E,
    pub merit: E,
    pub merit_der: E,
    pub step_length: E,
    pub accepted: bool,
}

impl ForwardPassResult {
    pub fn new(nx: usize, nu: usize, n_steps: usize) -> Self {
        Self {
            xtrj: Mat::zeros(nx, n_steps + 1),
            utrj: Mat::zeros(nu, n_steps),
            alpha: 0.0,
            cost: 0.0,
            defect_norm: 0.0,
            constraint_violation: 0.0,
            bound_violation: 0.0,
            merit: 0.0,
            merit_der: 0.0,
            step_length: 0.0,
            accepted: false,
        }
    }
}

/// Owned per-stage scratch, sized once at construction and reused by every
/// backward pass.
///
/// The Hessian/gradient blocks hold the stage value-function components, the
/// `feas_*`/`inf_*` blocks the two halves of the constraint split (feasible
/// rows never exceed `n_u`, propagated rows never exceed the constraint
/// buffer capacity), and the `kkt*` blocks the stage saddle-point system with
/// all right-hand-side columns. `kkt_dim` is the active dimension of the
/// current KKT view.
pub(crate) struct StageWorkspace {
    pub s_plus: Mat<E>,
    pub s_a: Mat<E>,
    pub s_b: Mat<E>,
    pub hx: Mat<E>,
    pub hxx: Mat<E>,
    pub hu: Mat<E>,
    pub huu: Mat<E>,
    pub hux: Mat<E>,

    pub feas_c: Mat<E>,
    pub feas_d: Mat<E>,
    pub feas_h: Mat<E>,
    pub inf_c: Mat<E>,
    pub inf_h: Mat<E>,

    pub kkt: Mat<E>,
    pub kkt_rhs: Mat<E>,
    pub kkt_sol: Mat<E>,
    pub kkt_dim: usize,

    pub tmp_ux: Mat<E>,
    pub tmp_u: Mat<E>,
    pub tmp_x: Mat<E>,
}

impl StageWorkspace {
    pub fn new(nx: usize, nu: usize, capacity: usize) -> Self {
        let kkt_max = 2 * nu;
        Self {
            s_plus: Mat::zeros(nx, 1),
            s_a: Mat::zeros(nx, nx),
            s_b: Mat::zeros(nx, nu),
            hx: Mat::zeros(nx, 1),
            hxx: Mat::zeros(nx, nx),
            hu: Mat::zeros(nu, 1),
            huu: Mat::zeros(nu, nu),
            hux: Mat::zeros(nu, nx),

            feas_c: Mat::zeros(nu, nx),
            feas_d: Mat::zeros(nu, nu),
            feas_h: Mat::zeros(nu, 1),
            inf_c: Mat::zeros(capacity, nx),
            inf_h: Mat::zeros(capacity, 1),

            kkt: Mat::zeros(kkt_max, kkt_max),
            kkt_rhs: Mat::zeros(kkt_max, nx + 1),
            kkt_sol: Mat::zeros(kkt_max, nx + 1),
            kkt_dim: 0,

            tmp_ux: Mat::zeros(nu, nx),
            tmp_u: Mat::zeros(nu, 1),
            tmp_x: Mat::zeros(nx, 1),
        }
    }
}
