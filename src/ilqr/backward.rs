//! Backward Riccati pass with equality-constraint projection.
//!
//! Stages are visited strictly `k = N−1 … 0`. At each stage the pending
//! constraints are propagated through the dynamics, split into a feasible
//! part (solvable by the stage input) and an infeasible remainder, and the
//! feasible rows enter the stage KKT system together with the regularized
//! Hessian blocks:
//!
//! ```text
//! [ H_uu   D_fᵀ ] [ Δu ]   [ −h_u − H_ux·Δx ]
//! [ D_f   −r·I  ] [ λ  ] = [ −h_f − C_f·Δx  ]
//! ```
//!
//! The system is solved for all right-hand-side columns at once, yielding the
//! feedback gain, the feedforward term, and the multipliers. A non-finite
//! solution signals an indefinite Hessian; the whole pass restarts with more
//! regularization (restart-with-bump, never a local per-stage fix). After an
//! accepted step the regularization is reduced by the cube root of the growth
//! factor, floored at the base value.
//!
//! All stage arithmetic writes into the preallocated [`StageWorkspace`]
//! buffers through in-place multiplication; the pass itself allocates
//! nothing, only the factorizations own transient backend workspace.
//!
//! [`StageWorkspace`]: crate::ilqr::data::StageWorkspace

use faer::linalg::matmul::matmul;
use faer::{Accum, Par};
use tracing::{debug, warn};

use crate::ilqr::constraint_to_go::CapacityExceeded;
use crate::ilqr::{IlqrError, IterativeLqr};
use crate::linalg::copy_neg;
use crate::linalg::kkt::{solve_kkt_in_place, LinalgError};
use crate::linalg::rank::orthogonal_split;
use crate::E;

/// Regularization ceiling: growing past this aborts the solve.
const HXX_REG_LIMIT: E = 1e12;

pub(crate) enum BackwardPassError {
    /// The stage KKT solve produced non-finite values; recoverable by
    /// restarting the pass with more regularization.
    Indefinite { stage: usize },
    Fatal(IlqrError),
}

impl From<IlqrError> for BackwardPassError {
    fn from(err: IlqrError) -> Self {
        BackwardPassError::Fatal(err)
    }
}

fn capacity_error(stage: usize, err: CapacityExceeded) -> BackwardPassError {
    BackwardPassError::Fatal(IlqrError::CapacityExceeded {
        stage,
        dim: err.dim,
        capacity: err.capacity,
    })
}

impl IterativeLqr {
    /// Runs the backward pass, bumping the regularization and restarting from
    /// the last stage for as long as a stage KKT system is indefinite.
    pub(crate) fn backward_pass(&mut self) -> Result<(), IlqrError> {
        loop {
            match self.try_backward_pass() {
                Ok(()) => return Ok(()),
                Err(BackwardPassError::Indefinite { stage }) => {
                    self.increase_regularization();
                    if self.opts.verbose {
                        debug!(
                            stage,
                            hxx_reg = self.hxx_reg,
                            "indefinite stage KKT system, restarting backward pass"
                        );
                    }
                    if self.hxx_reg > HXX_REG_LIMIT {
                        return Err(LinalgError::RegularizationExhausted {
                            limit: HXX_REG_LIMIT,
                        }
                        .into());
                    }
                }
                Err(BackwardPassError::Fatal(err)) => return Err(err),
            }
        }
    }

    fn try_backward_pass(&mut self) -> Result<(), BackwardPassError> {
        let (nx, _nu, n) = self.dims();

        // initialize the recursion from the final cost (regularized) ..
        {
            let terminal = &mut self.value[n];
            terminal.hess.as_mut().copy_from(&self.cost[n].hess_xx);
            for i in 0..nx {
                terminal.hess[(i, i)] += self.hxx_reg;
            }
            terminal.grad.as_mut().copy_from(&self.cost[n].grad_x);
        }

        // .. and the constraint-to-go from the final constraint and bounds
        self.ctg.clear();
        if self.constraint[n].rows > 0 {
            self.ctg
                .set(self.constraint[n].c.as_ref(), self.constraint[n].h.as_ref())
                .map_err(|e| capacity_error(n, e))?;
        }
        self.add_bound_rows(n).map_err(|e| capacity_error(n, e))?;

        if self.opts.log {
            debug!(stage = n, rows = self.ctg.dim(), "terminal constraint-to-go");
        }

        for k in (0..n).rev() {
            self.backward_pass_iter(k)?;
        }

        self.optimize_initial_state()?;

        // anything left over could not be reconciled with the initial state
        if self.ctg.dim() > 0 {
            let mut residual_inf = 0.0;
            for i in 0..self.ctg.dim() {
                let mut r = self.ctg.h()[i];
                for j in 0..nx {
                    r += self.ctg.c()[(i, j)] * self.dx0[j];
                }
                residual_inf = E::max(residual_inf, r.abs());
            }
            warn!(
                rows = self.ctg.dim(),
                residual_inf_norm = residual_inf,
                "equality constraints not satisfiable at the initial stage"
            );
        }

        Ok(())
    }

    fn backward_pass_iter(&mut self, k: usize) -> Result<(), BackwardPassError> {
        let (nx, nu, _n) = self.dims();

        // constraint handling: anything the stage input cannot satisfy is
        // queued for the previous stage; the feasible rows land in the stage
        // workspace
        let nc = self.handle_constraints(k)?;

        let (value_head, value_tail) = self.value.split_at_mut(k + 1);
        let value_next = &value_tail[0];
        let dyn_k = &self.dynamics[k];
        let cost_k = &self.cost[k];
        let ws = &mut self.ws[k];

        // components of the next node's value function, expressed in the
        // current stage's variables through the dynamics
        ws.s_plus.as_mut().copy_from(value_next.grad.as_mat());
        matmul(
            ws.s_plus.as_mut(),
            Accum::Add,
            value_next.hess.as_ref(),
            dyn_k.d.as_mat(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.s_a.as_mut(),
            Accum::Replace,
            value_next.hess.as_ref(),
            dyn_k.a.as_ref(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.s_b.as_mut(),
            Accum::Replace,
            value_next.hess.as_ref(),
            dyn_k.b.as_ref(),
            1.0,
            Par::Seq,
        );

        ws.hx.as_mut().copy_from(cost_k.grad_x.as_mat());
        matmul(
            ws.hx.as_mut(),
            Accum::Add,
            dyn_k.a.transpose(),
            ws.s_plus.as_ref(),
            1.0,
            Par::Seq,
        );
        ws.hxx.as_mut().copy_from(&cost_k.hess_xx);
        matmul(
            ws.hxx.as_mut(),
            Accum::Add,
            dyn_k.a.transpose(),
            ws.s_a.as_ref(),
            1.0,
            Par::Seq,
        );
        for i in 0..nx {
            ws.hxx[(i, i)] += self.hxx_reg;
        }

        ws.hu.as_mut().copy_from(cost_k.grad_u.as_mat());
        matmul(
            ws.hu.as_mut(),
            Accum::Add,
            dyn_k.b.transpose(),
            ws.s_plus.as_ref(),
            1.0,
            Par::Seq,
        );
        ws.huu.as_mut().copy_from(&cost_k.hess_uu);
        matmul(
            ws.huu.as_mut(),
            Accum::Add,
            dyn_k.b.transpose(),
            ws.s_b.as_ref(),
            1.0,
            Par::Seq,
        );
        for i in 0..nu {
            ws.huu[(i, i)] += self.opts.huu_reg;
        }
        ws.hux.as_mut().copy_from(&cost_k.hess_ux);
        matmul(
            ws.hux.as_mut(),
            Accum::Add,
            dyn_k.b.transpose(),
            ws.s_a.as_ref(),
            1.0,
            Par::Seq,
        );

        // assemble the stage KKT system into its preallocated block, with all
        // rhs columns at once: the first nx columns parameterize Δx, the last
        // is the constant term
        let nk = nu + nc;
        ws.kkt_dim = nk;
        ws.kkt.as_mut().submatrix_mut(0, 0, nk, nk).fill(0.0);
        ws.kkt.as_mut().submatrix_mut(0, 0, nu, nu).copy_from(&ws.huu);
        if nc > 0 {
            ws.kkt
                .as_mut()
                .submatrix_mut(0, nu, nu, nc)
                .copy_from(ws.feas_d.as_ref().subrows(0, nc).transpose());
            ws.kkt
                .as_mut()
                .submatrix_mut(nu, 0, nc, nu)
                .copy_from(ws.feas_d.as_ref().subrows(0, nc));
            for i in 0..nc {
                ws.kkt[(nu + i, nu + i)] -= self.opts.kkt_reg;
            }
        }

        copy_neg(
            ws.kkt_rhs.as_mut().submatrix_mut(0, 0, nu, nx),
            ws.hux.as_ref(),
        );
        copy_neg(
            ws.kkt_rhs.as_mut().submatrix_mut(0, nx, nu, 1),
            ws.hu.as_ref(),
        );
        if nc > 0 {
            copy_neg(
                ws.kkt_rhs.as_mut().submatrix_mut(nu, 0, nc, nx),
                ws.feas_c.as_ref().subrows(0, nc),
            );
            copy_neg(
                ws.kkt_rhs.as_mut().submatrix_mut(nu, nx, nc, 1),
                ws.feas_h.as_ref().subrows(0, nc),
            );
        }

        ws.kkt_sol
            .as_mut()
            .submatrix_mut(0, 0, nk, nx + 1)
            .copy_from(ws.kkt_rhs.as_ref().submatrix(0, 0, nk, nx + 1));
        match solve_kkt_in_place(
            ws.kkt.as_ref().submatrix(0, 0, nk, nk),
            ws.kkt_sol.as_mut().submatrix_mut(0, 0, nk, nx + 1),
            self.opts.kkt_decomp,
        ) {
            Ok(()) => {}
            Err(LinalgError::NonFiniteSolution) => {
                return Err(BackwardPassError::Indefinite { stage: k });
            }
            Err(err) => return Err(BackwardPassError::Fatal(err.into())),
        }

        // save the policy
        let res = &mut self.bp_res[k];
        res.gain
            .as_mut()
            .copy_from(ws.kkt_sol.as_ref().submatrix(0, 0, nu, nx));
        res.ffwd
            .as_mut()
            .copy_from(ws.kkt_sol.as_ref().submatrix(0, nx, nu, 1).col(0));
        res.lam
            .as_mut()
            .subrows_mut(0, nc)
            .copy_from(ws.kkt_sol.as_ref().submatrix(nu, nx, nc, 1).col(0));
        res.nc = nc;

        // update the value function in place and symmetrize
        ws.tmp_ux.as_mut().copy_from(&ws.hux);
        matmul(
            ws.tmp_ux.as_mut(),
            Accum::Add,
            ws.huu.as_ref(),
            res.gain.as_ref(),
            1.0,
            Par::Seq,
        );

        let value_k = &mut value_head[k];
        value_k.hess.as_mut().copy_from(&ws.hxx);
        matmul(
            value_k.hess.as_mut(),
            Accum::Add,
            res.gain.transpose(),
            ws.tmp_ux.as_ref(),
            1.0,
            Par::Seq,
        );
        matmul(
            value_k.hess.as_mut(),
            Accum::Add,
            ws.hux.transpose(),
            res.gain.as_ref(),
            1.0,
            Par::Seq,
        );
        for i in 0..nx {
            for j in (i + 1)..nx {
                let avg = 0.5 * (value_k.hess[(i, j)] + value_k.hess[(j, i)]);
                value_k.hess[(i, j)] = avg;
                value_k.hess[(j, i)] = avg;
            }
        }

        ws.tmp_u.as_mut().copy_from(&ws.hu);
        matmul(
            ws.tmp_u.as_mut(),
            Accum::Add,
            ws.huu.as_ref(),
            res.ffwd.as_mat(),
            1.0,
            Par::Seq,
        );
        ws.tmp_x.as_mut().copy_from(&ws.hx);
        matmul(
            ws.tmp_x.as_mut(),
            Accum::Add,
            ws.hux.transpose(),
            res.ffwd.as_mat(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.tmp_x.as_mut(),
            Accum::Add,
            res.gain.transpose(),
            ws.tmp_u.as_ref(),
            1.0,
            Par::Seq,
        );
        value_k.grad.as_mut().copy_from(ws.tmp_x.as_ref().col(0));

        if self.opts.log {
            let dim = ws.kkt_dim;
            let kkt = ws.kkt.as_ref().submatrix(0, 0, dim, dim);
            let rhs = ws.kkt_rhs.as_ref().submatrix(0, 0, dim, nx + 1);
            let sol = ws.kkt_sol.as_ref().submatrix(0, 0, dim, nx + 1);
            let kkt_err = (kkt * sol - rhs).norm_max();
            debug!(stage = k, kkt_err, feasible = nc, pending = self.ctg.dim(), "stage KKT solve");
        }

        Ok(())
    }

    /// Propagates the constraint-to-go through the stage dynamics, appends
    /// the stage constraint and pinned bounds, and splits the stack into
    /// feasible rows (written into the stage workspace, count returned) and
    /// the remainder carried to the previous stage.
    fn handle_constraints(&mut self, k: usize) -> Result<usize, BackwardPassError> {
        let (nx, _nu, _n) = self.dims();

        self.ctg.propagate_backwards(
            self.dynamics[k].a.as_ref(),
            self.dynamics[k].b.as_ref(),
            self.dynamics[k].d.as_ref(),
        );

        if self.constraint[k].rows > 0 {
            self.ctg
                .add_stage_rows(
                    self.constraint[k].c.as_ref(),
                    self.constraint[k].d.as_ref(),
                    self.constraint[k].h.as_ref(),
                )
                .map_err(|e| capacity_error(k, e))?;
        }

        self.add_bound_rows(k).map_err(|e| capacity_error(k, e))?;

        let nc = self.ctg.dim();
        if nc == 0 {
            return Ok(0);
        }

        let split = orthogonal_split(self.ctg.d(), self.opts.constr_decomp, self.opts.svd_threshold)
            .map_err(|e| BackwardPassError::Fatal(e.into()))?;
        let rank = split.rank;
        let n_inf = nc - rank;

        let q1 = split.q.as_ref().subcols(0, rank);
        let q2 = split.q.as_ref().subcols(rank, n_inf);

        let ws = &mut self.ws[k];
        matmul(
            ws.feas_c.as_mut().subrows_mut(0, rank),
            Accum::Replace,
            q1.transpose(),
            self.ctg.c(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.feas_d.as_mut().subrows_mut(0, rank),
            Accum::Replace,
            q1.transpose(),
            self.ctg.d(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.feas_h.as_mut().subrows_mut(0, rank),
            Accum::Replace,
            q1.transpose(),
            self.ctg.h().as_mat(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.inf_c.as_mut().subrows_mut(0, n_inf),
            Accum::Replace,
            q2.transpose(),
            self.ctg.c(),
            1.0,
            Par::Seq,
        );
        matmul(
            ws.inf_h.as_mut().subrows_mut(0, n_inf),
            Accum::Replace,
            q2.transpose(),
            self.ctg.h().as_mat(),
            1.0,
            Par::Seq,
        );

        self.ctg.clear();
        for i in 0..n_inf {
            let mut row_max = 0.0;
            for j in 0..nx {
                row_max = E::max(row_max, ws.inf_c[(i, j)].abs());
            }
            // a row of the form 0·Δx = 0 carries no information
            if ws.inf_h[(i, 0)].abs() < self.opts.dependent_constraint_threshold
                && row_max < self.opts.dependent_constraint_threshold
            {
                warn!(stage = k, "removing linearly dependent constraint row");
                continue;
            }
            self.ctg
                .add_row(ws.inf_c.as_ref().row(i), ws.inf_h[(i, 0)])
                .map_err(|e| capacity_error(k, e))?;
        }

        Ok(rank)
    }

    /// Injects `lb == ub` bound components as exact equality rows. State
    /// bounds are skipped at the first node when the initial state is fixed,
    /// input bounds do not exist at the final node.
    fn add_bound_rows(&mut self, k: usize) -> Result<(), CapacityExceeded> {
        let (nx, nu, n) = self.dims();

        if !(k == 0 && self.fixed_initial_state()) {
            for i in 0..nx {
                let lb = self.ocp.x_lb[(i, k)];
                if lb.is_finite() && lb == self.ocp.x_ub[(i, k)] {
                    self.ctg.add_state_equality(i, self.xtrj[(i, k)] - lb)?;
                    if self.opts.log {
                        debug!(stage = k, index = i, value = lb, "state pinned by equal bounds");
                    }
                }
            }
        }

        if k < n {
            for i in 0..nu {
                let lb = self.ocp.u_lb[(i, k)];
                if lb.is_finite() && lb == self.ocp.u_ub[(i, k)] {
                    self.ctg.add_input_equality(i, self.utrj[(i, k)] - lb)?;
                    if self.opts.log {
                        debug!(stage = k, index = i, value = lb, "input pinned by equal bounds");
                    }
                }
            }
        }

        Ok(())
    }

    /// Reconciles the remaining constraint-to-go with the initial value
    /// function, or clamps to the fixed initial state.
    fn optimize_initial_state(&mut self) -> Result<(), BackwardPassError> {
        let (nx, _nu, _n) = self.dims();

        if self.fixed_initial_state() {
            for i in 0..nx {
                self.dx0[i] = self.ocp.x_lb[(i, 0)] - self.xtrj[(i, 0)];
            }
            self.lam0.as_mut().fill(0.0);
            self.lam0_dim = 0;
            return Ok(());
        }

        let nc = self.ctg.dim();
        let nk = nx + nc;

        self.init_kkt.as_mut().submatrix_mut(0, 0, nk, nk).fill(0.0);
        self.init_kkt
            .as_mut()
            .submatrix_mut(0, 0, nx, nx)
            .copy_from(&self.value[0].hess);
        if nc > 0 {
            self.init_kkt
                .as_mut()
                .submatrix_mut(0, nx, nx, nc)
                .copy_from(self.ctg.c().transpose());
            self.init_kkt
                .as_mut()
                .submatrix_mut(nx, 0, nc, nx)
                .copy_from(self.ctg.c());
        }

        copy_neg(
            self.init_rhs.as_mut().submatrix_mut(0, 0, nx, 1),
            self.value[0].grad.as_mat(),
        );
        for i in 0..nc {
            self.init_rhs[(nx + i, 0)] = -self.ctg.h()[i];
        }

        self.init_sol
            .as_mut()
            .submatrix_mut(0, 0, nk, 1)
            .copy_from(self.init_rhs.as_ref().submatrix(0, 0, nk, 1));
        solve_kkt_in_place(
            self.init_kkt.as_ref().submatrix(0, 0, nk, nk),
            self.init_sol.as_mut().submatrix_mut(0, 0, nk, 1),
            self.opts.kkt_decomp,
        )
        .map_err(|e| BackwardPassError::Fatal(e.into()))?;

        self.dx0
            .as_mut()
            .copy_from(self.init_sol.as_ref().submatrix(0, 0, nx, 1).col(0));
        self.lam0
            .as_mut()
            .subrows_mut(0, nc)
            .copy_from(self.init_sol.as_ref().submatrix(nx, 0, nc, 1).col(0));
        self.lam0_dim = nc;

        if self.opts.log {
            let kkt = self.init_kkt.as_ref().submatrix(0, 0, nk, nk);
            let rhs = self.init_rhs.as_ref().submatrix(0, 0, nk, 1);
            let sol = self.init_sol.as_ref().submatrix(0, 0, nk, 1);
            let kkt_err = (kkt * sol - rhs).norm_max();
            debug!(
                kkt_err,
                multiplier_norm = self.lam0.as_ref().subrows(0, self.lam0_dim).norm_max(),
                "initial-state KKT solve"
            );
        }

        // keep only the rows the computed initial step cannot satisfy; the
        // caller reports them as an infeasibility warning
        if nc > 0 {
            for i in 0..nc {
                let mut r = self.ctg.h()[i];
                for j in 0..nx {
                    r += self.ctg.c()[(i, j)] * self.dx0[j];
                }
                self.init_res[(i, 0)] = r;
            }
            self.ctg.discard_satisfied(
                self.init_res.as_ref().submatrix(0, 0, nc, 1),
                self.opts.initial_state_residual_threshold,
            );
        }

        Ok(())
    }

    pub(crate) fn fixed_initial_state(&self) -> bool {
        let (nx, _nu, _n) = self.dims();
        (0..nx).all(|i| {
            let lb = self.ocp.x_lb[(i, 0)];
            lb.is_finite() && lb == self.ocp.x_ub[(i, 0)]
        })
    }

    pub(crate) fn increase_regularization(&mut self) {
        if self.hxx_reg < 1e-6 {
            self.hxx_reg = 1.0;
        }
        self.hxx_reg *= self.opts.hxx_reg_growth_factor;
        if self.hxx_reg < self.opts.hxx_reg_base {
            self.hxx_reg = self.opts.hxx_reg_base;
        }
    }

    pub(crate) fn reduce_regularization(&mut self) {
        self.hxx_reg /= self.opts.hxx_reg_growth_factor.powf(1.0 / 3.0);
        if self.hxx_reg < self.opts.hxx_reg_base {
            self.hxx_reg = self.opts.hxx_reg_base;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ocp::DynamicsFn;
    use crate::{DiscreteOcp, IlqrOptions, IterativeLqr};

    use faer::Mat;

    fn solver_with_base(base: f64) -> IterativeLqr {
        let ocp = DiscreteOcp::new(
            2,
            1,
            3,
            DynamicsFn::new(
                |x, _u| x.to_owned(),
                |_x, _u| (Mat::identity(2, 2), Mat::zeros(2, 1)),
            ),
        )
        .unwrap();
        let opts = IlqrOptions {
            hxx_reg_base: base,
            ..Default::default()
        };
        IterativeLqr::new(ocp, opts).unwrap()
    }

    #[test]
    fn regularization_bump_jumps_from_small_values() {
        let mut solver = solver_with_base(1e-3);
        assert_eq!(solver.hxx_reg, 1e-3);
        solver.increase_regularization();
        // below 1e-6? no: 1e-3 stays, multiplied by 10
        assert!((solver.hxx_reg - 1e-2).abs() < 1e-15);
    }

    #[test]
    fn regularization_bump_restarts_at_one_from_zero() {
        let mut solver = solver_with_base(0.0);
        assert_eq!(solver.hxx_reg, 0.0);
        solver.increase_regularization();
        assert!((solver.hxx_reg - 10.0).abs() < 1e-12);
    }

    #[test]
    fn regularization_reduction_is_floored_at_base() {
        let mut solver = solver_with_base(1e-3);
        solver.hxx_reg = 2e-3;
        solver.reduce_regularization();
        assert!(solver.hxx_reg < 2e-3);
        for _ in 0..10 {
            solver.reduce_regularization();
        }
        assert_eq!(solver.hxx_reg, 1e-3);
    }
}
