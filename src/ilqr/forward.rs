//! Forward pass, merit function, and Armijo line search.
//!
//! The rollout applies the stage policies scaled by the step size `α` and
//! closes the shooting gaps proportionally to it:
//!
//! ```text
//! Δu_k     = α·l_k + L_k·Δx_k
//! Δx_{k+1} = (A_k + B_k·L_k)·Δx_k + B_k·(α·l_k) + α·d_k
//! ```
//!
//! Candidates are judged by the exact-penalty merit function
//! `m(α) = J(α) + μ_f·‖D(α)‖ + μ_c·V(α)` (Nocedal & Wright, 18.2) whose
//! weights dominate the current multiplier estimates with a safety margin.
//! Steps are accepted by the Armijo test; if no step length qualifies, the
//! smallest candidate is taken anyway so the solve can keep making progress.
//!
//! The rollout writes through preallocated single-column scratch buffers; the
//! only allocations on this path are the values returned by the user
//! evaluators themselves.

use faer::linalg::matmul::matmul;
use faer::{Accum, Par};
use tracing::warn;

use crate::ilqr::{IlqrError, IterativeLqr};
use crate::linalg::{col_all_finite, dot, positive_part};
use crate::ocp::{ConfigError, EvaluatorError};
use crate::{SolverHooks, E};

const STEP_REDUCTION_FACTOR: E = 0.5;
const ALPHA_MIN: E = 1e-3;
const ARMIJO_ETA: E = 1e-4;

/// Normalized stop thresholds on the merit slope and the step length.
const MERIT_SLOPE_STOP: E = -1e-9;
const STEP_LENGTH_STOP: E = 1e-9;

impl IterativeLqr {
    /// Evaluates cost, defect, constraint violation, and bound violation of
    /// the *current* trajectory into the forward-pass result. Used to seed
    /// the merit bookkeeping before the first iteration and after an
    /// augmented-Lagrangian update.
    pub(crate) fn evaluate_trajectory_metrics(&mut self) -> Result<(), IlqrError> {
        self.fp_res.xtrj.as_mut().copy_from(self.xtrj.as_ref());
        self.fp_res.utrj.as_mut().copy_from(self.utrj.as_ref());
        self.fp_res.alpha = 0.0;
        self.fp_res.step_length = 0.0;
        self.fp_res.accepted = false;

        self.fp_res.cost = self.compute_cost()?;
        self.fp_res.defect_norm = self.compute_defect()?;
        self.fp_res.constraint_violation = self.compute_violation()?;
        self.fp_res.bound_violation = self.compute_bound_violation();
        Ok(())
    }

    /// Rolls out the candidate trajectory for step size `alpha` and evaluates
    /// its metrics. With `Δu_k = α·l_k + L_k·Δx_k`, the state update below is
    /// the gap-closing rollout written as
    /// `Δx_{k+1} = A_k·Δx_k + B_k·Δu_k + α·d_k`.
    pub(crate) fn forward_pass(&mut self, alpha: E) -> Result<(), IlqrError> {
        let (nx, nu, n) = self.dims();

        self.fp_res.accepted = false;
        self.fp_res.alpha = alpha;
        self.fp_res.step_length = 0.0;

        // the initial-state correction is gap-closing too
        for i in 0..nx {
            self.fp_res.xtrj[(i, 0)] = self.xtrj[(i, 0)] + alpha * self.dx0[i];
        }

        for k in 0..n {
            for i in 0..nx {
                self.fwd_dx[(i, 0)] = self.fp_res.xtrj[(i, k)] - self.xtrj[(i, k)];
            }

            // update the control
            for i in 0..nu {
                self.fwd_u[(i, 0)] = self.utrj[(i, k)] + alpha * self.bp_res[k].ffwd[i];
            }
            matmul(
                self.fwd_u.as_mut(),
                Accum::Add,
                self.bp_res[k].gain.as_ref(),
                self.fwd_dx.as_ref(),
                1.0,
                Par::Seq,
            );
            for i in 0..nu {
                self.fwd_du[(i, 0)] = self.fwd_u[(i, 0)] - self.utrj[(i, k)];
                self.fp_res.utrj[(i, k)] = self.fwd_u[(i, 0)];
                self.fp_res.step_length += (alpha * self.bp_res[k].ffwd[i]).abs();
            }

            // update the next state
            for i in 0..nx {
                self.fwd_x[(i, 0)] = self.xtrj[(i, k + 1)] + alpha * self.dynamics[k].d[i];
            }
            matmul(
                self.fwd_x.as_mut(),
                Accum::Add,
                self.dynamics[k].a.as_ref(),
                self.fwd_dx.as_ref(),
                1.0,
                Par::Seq,
            );
            matmul(
                self.fwd_x.as_mut(),
                Accum::Add,
                self.dynamics[k].b.as_ref(),
                self.fwd_du.as_ref(),
                1.0,
                Par::Seq,
            );
            for i in 0..nx {
                self.fp_res.xtrj[(i, k + 1)] = self.fwd_x[(i, 0)];
            }
        }

        self.fp_res.cost = self.candidate_cost()?;
        self.fp_res.defect_norm = self.candidate_defect()?;
        self.fp_res.constraint_violation = self.candidate_violation()?;
        self.fp_res.bound_violation = self.candidate_bound_violation();
        Ok(())
    }

    /// Backtracking Armijo line search over the candidate rollouts. The
    /// callback is invoked for every evaluation; the returned flag is the
    /// conjunction of its answers.
    pub(crate) fn line_search(
        &mut self,
        iter: usize,
        hooks: &mut SolverHooks,
    ) -> Result<bool, IlqrError> {
        let (mu_f, mu_c) = self.compute_merit_weights();

        // merit of the current trajectory; its metrics were evaluated by the
        // previous accepted pass (or the solve preamble on iteration 0)
        let merit_0 = merit_value(
            mu_f,
            mu_c,
            self.fp_res.cost,
            self.fp_res.defect_norm,
            self.fp_res.constraint_violation,
        );

        let mut keep_going = true;
        if iter == 0 {
            self.fp_res.merit = merit_0;
            keep_going &= self.report(iter, hooks);
        }

        let slope = self.merit_slope(mu_f, mu_c);
        self.fp_res.merit_der = slope;

        let mut alpha = 1.0;
        while alpha >= ALPHA_MIN {
            self.forward_pass(alpha)?;

            self.fp_res.merit = merit_value(
                mu_f,
                mu_c,
                self.fp_res.cost,
                self.fp_res.defect_norm,
                self.fp_res.constraint_violation,
            );

            self.fp_res.accepted = self.fp_res.merit <= merit_0 + ARMIJO_ETA * alpha * slope;
            keep_going &= self.report(iter, hooks);

            if self.fp_res.accepted {
                break;
            }

            alpha *= STEP_REDUCTION_FACTOR;
        }

        // best effort: no step satisfied the sufficient-decrease test, take
        // the last candidate anyway
        if !self.fp_res.accepted {
            warn!(iter, "line search exhausted, accepting smallest step");
            self.fp_res.accepted = true;
            keep_going &= self.report(iter, hooks);
        }

        self.xtrj.as_mut().copy_from(self.fp_res.xtrj.as_ref());
        self.utrj.as_mut().copy_from(self.fp_res.utrj.as_ref());

        Ok(keep_going)
    }

    /// Convergence test on the accepted step: feasibility first, then either
    /// a flat merit slope or a vanishing step length.
    pub(crate) fn should_stop(&self) -> bool {
        let threshold = self.opts.constraint_violation_threshold;

        if self.fp_res.constraint_violation > threshold {
            return false;
        }
        if self.fp_res.defect_norm > threshold {
            return false;
        }
        // with the augmented Lagrangian active, "feasible" includes bounds;
        // stopping earlier would freeze the penalty below its useful range
        if self.opts.enable_auglag && self.fp_res.bound_violation >= threshold {
            return false;
        }

        if self.fp_res.merit_der / self.fp_res.merit > MERIT_SLOPE_STOP {
            return true;
        }
        if self.fp_res.step_length / self.utrj.norm_l2() < STEP_LENGTH_STOP {
            return true;
        }

        false
    }

    /// Merit weights from the current multiplier estimates at `Δx = 0`: the
    /// value gradient plays the role of the dynamics multiplier, the KKT
    /// feedforward column that of the constraint multiplier.
    fn compute_merit_weights(&self) -> (E, E) {
        let (_nx, _nu, n) = self.dims();

        let mut lam_x_max = 0.0;
        let mut lam_g_max = 0.0;
        for k in 0..n {
            lam_x_max = E::max(lam_x_max, self.value[k].grad.norm_max());
            let res = &self.bp_res[k];
            if res.nc > 0 {
                lam_g_max = E::max(lam_g_max, res.lam.as_ref().subrows(0, res.nc).norm_max());
            }
        }

        (
            self.opts.merit_safety_factor * lam_x_max,
            self.opts.merit_safety_factor * lam_g_max,
        )
    }

    /// Directional derivative of the merit function at `α = 0`
    /// (Nocedal & Wright, Theorem 18.2).
    fn merit_slope(&self, mu_f: E, mu_c: E) -> E {
        let (_nx, _nu, n) = self.dims();

        let mut der = 0.0;
        for k in 0..n {
            der += dot(self.bp_res[k].ffwd.as_ref(), self.ws[k].hu.as_ref().col(0));
        }

        der - mu_f * self.fp_res.defect_norm - mu_c * self.fp_res.constraint_violation
    }

    fn compute_cost(&self) -> Result<E, IlqrError> {
        self.trajectory_cost(self.xtrj.as_ref(), self.utrj.as_ref())
    }

    fn candidate_cost(&self) -> Result<E, IlqrError> {
        self.trajectory_cost(self.fp_res.xtrj.as_ref(), self.fp_res.utrj.as_ref())
    }

    fn trajectory_cost(
        &self,
        xtrj: faer::MatRef<'_, E>,
        utrj: faer::MatRef<'_, E>,
    ) -> Result<E, IlqrError> {
        let (_nx, _nu, n) = self.dims();

        let mut cost = 0.0;
        for k in 0..n {
            let value = self.ocp.cost[k].eval(xtrj.col(k), utrj.col(k));
            if !value.is_finite() {
                return Err(EvaluatorError::NonFiniteCost { stage: k }.into());
            }
            cost += value;
            if self.opts.enable_auglag {
                cost += self.auglag.state_penalty(
                    k,
                    xtrj.col(k),
                    self.ocp.x_lb.as_ref(),
                    self.ocp.x_ub.as_ref(),
                );
                cost += self.auglag.input_penalty(
                    k,
                    utrj.col(k),
                    self.ocp.u_lb.as_ref(),
                    self.ocp.u_ub.as_ref(),
                );
            }
        }

        // final node; the input argument is not used by its semantics
        let value = self.ocp.cost[n].eval(xtrj.col(n), utrj.col(n - 1));
        if !value.is_finite() {
            return Err(EvaluatorError::NonFiniteCost { stage: n }.into());
        }
        cost += value;
        if self.opts.enable_auglag {
            cost += self.auglag.state_penalty(
                n,
                xtrj.col(n),
                self.ocp.x_lb.as_ref(),
                self.ocp.x_ub.as_ref(),
            );
        }

        Ok(cost / n as E)
    }

    fn compute_defect(&self) -> Result<E, IlqrError> {
        self.trajectory_defect(self.xtrj.as_ref(), self.utrj.as_ref())
    }

    fn candidate_defect(&self) -> Result<E, IlqrError> {
        self.trajectory_defect(self.fp_res.xtrj.as_ref(), self.fp_res.utrj.as_ref())
    }

    fn trajectory_defect(
        &self,
        xtrj: faer::MatRef<'_, E>,
        utrj: faer::MatRef<'_, E>,
    ) -> Result<E, IlqrError> {
        let (nx, _nu, n) = self.dims();

        let mut defect = 0.0;
        for k in 0..n {
            let fx = self.ocp.dynamics[k].eval(xtrj.col(k), utrj.col(k));
            if fx.nrows() != nx {
                return Err(ConfigError::EvaluatorShape {
                    stage: k,
                    rows: fx.nrows(),
                    cols: 1,
                    expected_rows: nx,
                    expected_cols: 1,
                }
                .into());
            }
            let mut gap = 0.0;
            let mut finite = true;
            for i in 0..nx {
                let g = fx[i] - xtrj[(i, k + 1)];
                if !g.is_finite() {
                    finite = false;
                }
                gap += g.abs();
            }
            if !finite {
                return Err(EvaluatorError::NonFiniteDynamics { stage: k }.into());
            }
            defect += gap;
        }

        Ok(defect / n as E)
    }

    fn compute_violation(&self) -> Result<E, IlqrError> {
        self.trajectory_violation(self.xtrj.as_ref(), self.utrj.as_ref())
    }

    fn candidate_violation(&self) -> Result<E, IlqrError> {
        self.trajectory_violation(self.fp_res.xtrj.as_ref(), self.fp_res.utrj.as_ref())
    }

    fn trajectory_violation(
        &self,
        xtrj: faer::MatRef<'_, E>,
        utrj: faer::MatRef<'_, E>,
    ) -> Result<E, IlqrError> {
        let (_nx, _nu, n) = self.dims();

        let mut violation = 0.0;
        for k in 0..=n {
            let Some(constraint) = &self.ocp.constraint[k] else {
                continue;
            };
            let input_node = usize::min(k, n - 1);
            let h = constraint.eval(xtrj.col(k), utrj.col(input_node));
            if !col_all_finite(h.as_ref()) {
                return Err(EvaluatorError::NonFiniteConstraint { stage: k }.into());
            }
            violation += h.norm_l1();
        }

        Ok(violation / n as E)
    }

    fn compute_bound_violation(&self) -> E {
        self.trajectory_bound_violation(self.xtrj.as_ref(), self.utrj.as_ref())
    }

    fn candidate_bound_violation(&self) -> E {
        self.trajectory_bound_violation(self.fp_res.xtrj.as_ref(), self.fp_res.utrj.as_ref())
    }

    fn trajectory_bound_violation(
        &self,
        xtrj: faer::MatRef<'_, E>,
        utrj: faer::MatRef<'_, E>,
    ) -> E {
        let (nx, nu, n) = self.dims();

        let mut violation = 0.0;
        for k in 0..=n {
            for i in 0..nx {
                violation += positive_part(xtrj[(i, k)] - self.ocp.x_ub[(i, k)]);
                violation += positive_part(self.ocp.x_lb[(i, k)] - xtrj[(i, k)]);
            }
        }
        for k in 0..n {
            for i in 0..nu {
                violation += positive_part(utrj[(i, k)] - self.ocp.u_ub[(i, k)]);
                violation += positive_part(self.ocp.u_lb[(i, k)] - utrj[(i, k)]);
            }
        }

        violation / n as E
    }
}

fn merit_value(mu_f: E, mu_c: E, cost: E, defect_norm: E, constr_viol: E) -> E {
    cost + mu_f * defect_norm + mu_c * constr_viol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merit_combines_cost_and_feasibility() {
        assert!((merit_value(2.0, 3.0, 1.0, 0.5, 0.25) - 2.75).abs() < 1e-15);
    }
}
