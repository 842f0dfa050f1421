//! Augmented-Lagrangian treatment of bound constraints.
//!
//! Inequality bounds never enter the constraint projection machinery; they
//! are enforced by augmenting the stage cost with a penalty-plus-multiplier
//! term. For each violated side with `g > 0` (e.g. `g = x_i − ub_i`):
//!
//! ```text
//! ℓ_aug += μ·g + (ρ/2)·g²
//! ∇ℓ_aug += ±(μ + ρ·g)
//! ∇²ℓ_aug (diag) += ρ
//! ```
//!
//! One-sided multiplier estimates are kept per bound side and node, updated
//! with the clamped rule `μ ← max(0, μ + ρ·g)` whenever the outer loop
//! decides the current solution is accurate enough to be worth tightening.
//! The penalty `ρ` grows monotonically within a solve.

use faer::{Col, ColRef, Mat, MatRef};

use crate::linalg::positive_part;
use crate::E;

pub(crate) struct AuglagState {
    pub rho: E,
    mu_x_lb: Mat<E>,
    mu_x_ub: Mat<E>,
    mu_u_lb: Mat<E>,
    mu_u_ub: Mat<E>,
}

impl AuglagState {
    pub fn new(nx: usize, nu: usize, n_steps: usize, rho_init: E) -> Self {
        Self {
            rho: rho_init,
            mu_x_lb: Mat::zeros(nx, n_steps + 1),
            mu_x_ub: Mat::zeros(nx, n_steps + 1),
            mu_u_lb: Mat::zeros(nu, n_steps),
            mu_u_ub: Mat::zeros(nu, n_steps),
        }
    }

    /// Drops all multiplier estimates and restores the initial penalty.
    pub fn reset(&mut self, rho_init: E) {
        self.rho = rho_init;
        self.mu_x_lb.as_mut().fill(0.0);
        self.mu_x_ub.as_mut().fill(0.0);
        self.mu_u_lb.as_mut().fill(0.0);
        self.mu_u_ub.as_mut().fill(0.0);
    }

    /// Penalty cost of the state column at node `k`.
    pub fn state_penalty(&self, k: usize, x: ColRef<'_, E>, lb: MatRef<'_, E>, ub: MatRef<'_, E>) -> E {
        Self::column_penalty(
            self.rho,
            self.mu_x_lb.as_ref(),
            self.mu_x_ub.as_ref(),
            k,
            x,
            lb,
            ub,
        )
    }

    /// Penalty cost of the input column at node `k`.
    pub fn input_penalty(&self, k: usize, u: ColRef<'_, E>, lb: MatRef<'_, E>, ub: MatRef<'_, E>) -> E {
        Self::column_penalty(
            self.rho,
            self.mu_u_lb.as_ref(),
            self.mu_u_ub.as_ref(),
            k,
            u,
            lb,
            ub,
        )
    }

    /// Adds the penalty gradient and Gauss-Newton Hessian contributions for
    /// the state column at node `k`.
    pub fn add_state_terms(
        &self,
        k: usize,
        x: ColRef<'_, E>,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
        grad: &mut Col<E>,
        hess: &mut Mat<E>,
    ) {
        Self::add_column_terms(
            self.rho,
            self.mu_x_lb.as_ref(),
            self.mu_x_ub.as_ref(),
            k,
            x,
            lb,
            ub,
            grad,
            hess,
        );
    }

    /// Adds the penalty gradient and Gauss-Newton Hessian contributions for
    /// the input column at node `k`.
    pub fn add_input_terms(
        &self,
        k: usize,
        u: ColRef<'_, E>,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
        grad: &mut Col<E>,
        hess: &mut Mat<E>,
    ) {
        Self::add_column_terms(
            self.rho,
            self.mu_u_lb.as_ref(),
            self.mu_u_ub.as_ref(),
            k,
            u,
            lb,
            ub,
            grad,
            hess,
        );
    }

    /// Standard multiplier update at the current trajectory, followed by a
    /// penalty increase. Bounds already handled as exact equalities
    /// (`lb == ub`) contribute nothing here: their violation is zero by the
    /// projection machinery.
    pub fn update(
        &mut self,
        xtrj: MatRef<'_, E>,
        utrj: MatRef<'_, E>,
        x_lb: MatRef<'_, E>,
        x_ub: MatRef<'_, E>,
        u_lb: MatRef<'_, E>,
        u_ub: MatRef<'_, E>,
        rho_growth_factor: E,
    ) {
        Self::update_side(&mut self.mu_x_lb, &mut self.mu_x_ub, self.rho, xtrj, x_lb, x_ub);
        Self::update_side(&mut self.mu_u_lb, &mut self.mu_u_ub, self.rho, utrj, u_lb, u_ub);
        self.rho *= rho_growth_factor;
    }

    fn update_side(
        mu_lb: &mut Mat<E>,
        mu_ub: &mut Mat<E>,
        rho: E,
        trj: MatRef<'_, E>,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
    ) {
        for k in 0..trj.ncols() {
            for i in 0..trj.nrows() {
                if ub[(i, k)].is_finite() {
                    let g = trj[(i, k)] - ub[(i, k)];
                    mu_ub[(i, k)] = positive_part(mu_ub[(i, k)] + rho * g);
                }
                if lb[(i, k)].is_finite() {
                    let g = lb[(i, k)] - trj[(i, k)];
                    mu_lb[(i, k)] = positive_part(mu_lb[(i, k)] + rho * g);
                }
            }
        }
    }

    fn column_penalty(
        rho: E,
        mu_lb: MatRef<'_, E>,
        mu_ub: MatRef<'_, E>,
        k: usize,
        v: ColRef<'_, E>,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
    ) -> E {
        let mut cost = 0.0;
        for i in 0..v.nrows() {
            if ub[(i, k)].is_finite() {
                let g = v[i] - ub[(i, k)];
                if g > 0.0 {
                    cost += mu_ub[(i, k)] * g + 0.5 * rho * g * g;
                }
            }
            if lb[(i, k)].is_finite() {
                let g = lb[(i, k)] - v[i];
                if g > 0.0 {
                    cost += mu_lb[(i, k)] * g + 0.5 * rho * g * g;
                }
            }
        }
        cost
    }

    fn add_column_terms(
        rho: E,
        mu_lb: MatRef<'_, E>,
        mu_ub: MatRef<'_, E>,
        k: usize,
        v: ColRef<'_, E>,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
        grad: &mut Col<E>,
        hess: &mut Mat<E>,
    ) {
        for i in 0..v.nrows() {
            if ub[(i, k)].is_finite() {
                let g = v[i] - ub[(i, k)];
                if g > 0.0 {
                    grad[i] += mu_ub[(i, k)] + rho * g;
                    hess[(i, i)] += rho;
                }
            }
            if lb[(i, k)].is_finite() {
                let g = lb[(i, k)] - v[i];
                if g > 0.0 {
                    grad[i] -= mu_lb[(i, k)] + rho * g;
                    hess[(i, i)] += rho;
                }
            }
        }
    }
}
