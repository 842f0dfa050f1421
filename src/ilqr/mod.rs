//! Constrained multiple-shooting iterative LQR engine.
//!
//! One outer iteration performs:
//!
//! 1. linearize the dynamics and constraints and quadratize the cost around
//!    the current trajectory (augmented with the bound penalty when enabled);
//! 2. a backward Riccati pass that folds the equality constraints into the
//!    value function stage by stage, restarting with more regularization if a
//!    stage KKT system turns out indefinite;
//! 3. a line-searched forward pass that closes the shooting gaps
//!    proportionally to the accepted step and is judged by an exact-penalty
//!    merit function;
//! 4. convergence, augmented-Lagrangian, and regularization bookkeeping.
//!
//! The engine owns all stage arrays and the trajectories; problem evaluators
//! are shared immutably through the [`DiscreteOcp`].

mod auglag;
mod backward;
mod constraint_to_go;
mod data;
mod forward;

use derive_more::{Display, Error};
use faer::{Col, ColRef, Mat, MatRef};
use tracing::info;

use crate::callback::IterationReport;
use crate::ilqr::auglag::AuglagState;
use crate::ilqr::constraint_to_go::ConstraintToGo;
use crate::ilqr::data::{
    BackwardPassResult, ForwardPassResult, StageConstraintData, StageCostData, StageDynamicsData,
    StageWorkspace, ValueFunction,
};
use crate::linalg::kkt::{KktDecomp, LinalgError};
use crate::linalg::rank::ConstraintDecomp;
use crate::linalg::{col_all_finite, mat_all_finite};
use crate::ocp::{ConfigError, DiscreteOcp, EvaluatorError};
use crate::{SolverHooks, Status, E};

/// Top-level error type for the solver.
#[derive(Debug, Display, Error, PartialEq)]
pub enum IlqrError {
    #[display("configuration error: {_0}")]
    Config(ConfigError),

    #[display("evaluator failure: {_0}")]
    Evaluator(EvaluatorError),

    #[display("linear algebra failure: {_0}")]
    Linalg(LinalgError),

    #[display("constraint buffer overflow at stage {stage}: {dim} rows exceed capacity {capacity}")]
    CapacityExceeded {
        stage: usize,
        dim: usize,
        capacity: usize,
    },
}

impl From<ConfigError> for IlqrError {
    fn from(err: ConfigError) -> Self {
        IlqrError::Config(err)
    }
}

impl From<EvaluatorError> for IlqrError {
    fn from(err: EvaluatorError) -> Self {
        IlqrError::Evaluator(err)
    }
}

impl From<LinalgError> for IlqrError {
    fn from(err: LinalgError) -> Self {
        IlqrError::Linalg(err)
    }
}

/// Engine options. All fields have workable defaults.
#[derive(Debug, Clone, Copy)]
pub struct IlqrOptions {
    /// Upper bound on outer iterations.
    pub max_iter: usize,
    /// Factorization for the stage and initial-state KKT systems.
    pub kkt_decomp: KktDecomp,
    /// Rank-revealing factorization for the constraint input Jacobian.
    pub constr_decomp: ConstraintDecomp,
    /// Rank cutoff for the constraint decomposition.
    pub svd_threshold: E,
    /// Base state-Hessian regularization.
    pub hxx_reg_base: E,
    /// Multiplier applied on indefiniteness; its cube root is the reduction
    /// divisor after an accepted step.
    pub hxx_reg_growth_factor: E,
    /// Fixed input-Hessian regularization.
    pub huu_reg: E,
    /// Diagonal regularization on the multiplier block of the KKT system.
    pub kkt_reg: E,
    /// Enables the augmented-Lagrangian treatment of bound inequalities.
    pub enable_auglag: bool,
    /// Initial augmented-Lagrangian penalty.
    pub rho_init: E,
    /// Penalty growth factor `γ_ρ`.
    pub rho_growth_factor: E,
    /// Safety factor on the merit weights (2 leaves margin over the
    /// theoretical multiplier dominance requirement).
    pub merit_safety_factor: E,
    /// Merit-derivative gate `τ_md` for the augmented-Lagrangian update.
    pub merit_der_threshold: E,
    /// Feasibility threshold used by the stop test and the
    /// augmented-Lagrangian gate.
    pub constraint_violation_threshold: E,
    /// Residual threshold for the initial-state feasibility check.
    pub initial_state_residual_threshold: E,
    /// Rows of the propagated constraint with sup-norm below this value are
    /// dropped as linearly dependent.
    pub dependent_constraint_threshold: E,
    /// Emits an iteration summary per accepted step.
    pub verbose: bool,
    /// Emits detailed per-stage diagnostics.
    pub log: bool,
}

impl Default for IlqrOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            kkt_decomp: KktDecomp::default(),
            constr_decomp: ConstraintDecomp::default(),
            svd_threshold: 1e-9,
            hxx_reg_base: 1e-3,
            hxx_reg_growth_factor: 10.0,
            huu_reg: 0.0,
            kkt_reg: 0.0,
            enable_auglag: false,
            rho_init: 1.0,
            rho_growth_factor: 10.0,
            merit_safety_factor: 2.0,
            merit_der_threshold: 1e-3,
            constraint_violation_threshold: 1e-6,
            initial_state_residual_threshold: 1e-8,
            dependent_constraint_threshold: 1e-9,
            verbose: false,
            log: false,
        }
    }
}

impl IlqrOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.hxx_reg_growth_factor <= 1.0 {
            return Err(ConfigError::InvalidOption {
                name: "hxx_reg_growth_factor",
            });
        }
        if self.rho_growth_factor <= 1.0 {
            return Err(ConfigError::InvalidOption {
                name: "rho_growth_factor",
            });
        }
        if self.hxx_reg_base < 0.0 || self.huu_reg < 0.0 || self.kkt_reg < 0.0 {
            return Err(ConfigError::InvalidOption { name: "regularization" });
        }
        if self.svd_threshold <= 0.0 {
            return Err(ConfigError::InvalidOption { name: "svd_threshold" });
        }
        if self.rho_init <= 0.0 {
            return Err(ConfigError::InvalidOption { name: "rho_init" });
        }
        if self.merit_safety_factor < 1.0 {
            return Err(ConfigError::InvalidOption {
                name: "merit_safety_factor",
            });
        }
        if self.constraint_violation_threshold <= 0.0
            || self.initial_state_residual_threshold <= 0.0
            || self.dependent_constraint_threshold <= 0.0
            || self.merit_der_threshold <= 0.0
        {
            return Err(ConfigError::InvalidOption { name: "threshold" });
        }
        Ok(())
    }
}

/// Per-iteration statistics of an accepted step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iter: usize,
    pub alpha: E,
    pub cost: E,
    pub defect_norm: E,
    pub constraint_violation: E,
    pub bound_violation: E,
    pub merit: E,
    pub merit_der: E,
    pub step_length: E,
    pub hxx_reg: E,
    pub rho: E,
    pub accepted: bool,
}

/// Multiple-shooting iterative LQR solver.
///
/// Construct with a [`DiscreteOcp`] and [`IlqrOptions`], then call
/// [`solve`](IterativeLqr::solve). The trajectories persist across solves, so
/// a warm start is simply a second call.
pub struct IterativeLqr {
    pub(crate) ocp: DiscreteOcp,
    pub(crate) opts: IlqrOptions,

    nx: usize,
    nu: usize,
    n_steps: usize,

    pub(crate) dynamics: Vec<StageDynamicsData>,
    pub(crate) cost: Vec<StageCostData>,
    pub(crate) constraint: Vec<StageConstraintData>,
    pub(crate) value: Vec<ValueFunction>,
    pub(crate) bp_res: Vec<BackwardPassResult>,
    pub(crate) ws: Vec<StageWorkspace>,
    pub(crate) ctg: ConstraintToGo,
    pub(crate) fp_res: ForwardPassResult,
    pub(crate) auglag: AuglagState,

    pub(crate) dx0: Col<E>,
    pub(crate) lam0: Col<E>,
    pub(crate) lam0_dim: usize,

    pub(crate) xtrj: Mat<E>,
    pub(crate) utrj: Mat<E>,

    // single-column rollout scratch, written in place every forward pass
    pub(crate) fwd_dx: Mat<E>,
    pub(crate) fwd_du: Mat<E>,
    pub(crate) fwd_u: Mat<E>,
    pub(crate) fwd_x: Mat<E>,

    // initial-state KKT buffers, sized for the full constraint capacity
    pub(crate) init_kkt: Mat<E>,
    pub(crate) init_rhs: Mat<E>,
    pub(crate) init_sol: Mat<E>,
    pub(crate) init_res: Mat<E>,

    pub(crate) hxx_reg: E,
    records: Vec<IterationRecord>,
}

impl IterativeLqr {
    pub fn new(ocp: DiscreteOcp, opts: IlqrOptions) -> Result<Self, IlqrError> {
        opts.validate()?;

        let nx = ocp.nx;
        let nu = ocp.nu;
        let n = ocp.n_steps;

        let mut xtrj = Mat::zeros(nx, n + 1);
        xtrj.col_mut(0).copy_from(&ocp.x0);

        let ctg = ConstraintToGo::new(nx, nu);
        let capacity = ctg.capacity();

        Ok(Self {
            nx,
            nu,
            n_steps: n,
            dynamics: (0..n).map(|_| StageDynamicsData::new(nx, nu)).collect(),
            cost: (0..=n).map(|_| StageCostData::new(nx, nu)).collect(),
            constraint: (0..=n).map(|_| StageConstraintData::empty(nx, nu)).collect(),
            value: (0..=n).map(|_| ValueFunction::new(nx)).collect(),
            bp_res: (0..n).map(|_| BackwardPassResult::new(nx, nu)).collect(),
            ws: (0..n).map(|_| StageWorkspace::new(nx, nu, capacity)).collect(),
            ctg,
            fp_res: ForwardPassResult::new(nx, nu, n),
            auglag: AuglagState::new(nx, nu, n, opts.rho_init),
            dx0: Col::zeros(nx),
            lam0: Col::zeros(capacity),
            lam0_dim: 0,
            xtrj,
            utrj: Mat::zeros(nu, n),
            fwd_dx: Mat::zeros(nx, 1),
            fwd_du: Mat::zeros(nu, 1),
            fwd_u: Mat::zeros(nu, 1),
            fwd_x: Mat::zeros(nx, 1),
            init_kkt: Mat::zeros(nx + capacity, nx + capacity),
            init_rhs: Mat::zeros(nx + capacity, 1),
            init_sol: Mat::zeros(nx + capacity, 1),
            init_res: Mat::zeros(capacity, 1),
            hxx_reg: opts.hxx_reg_base,
            records: Vec::new(),
            ocp,
            opts,
        })
    }

    /// Number of shooting intervals.
    pub fn horizon(&self) -> usize {
        self.n_steps
    }

    /// State trajectory, `nx × (N + 1)`.
    pub fn state_trajectory(&self) -> MatRef<'_, E> {
        self.xtrj.as_ref()
    }

    /// Input trajectory, `nu × N`.
    pub fn input_trajectory(&self) -> MatRef<'_, E> {
        self.utrj.as_ref()
    }

    /// State at node `k`.
    pub fn state(&self, k: usize) -> ColRef<'_, E> {
        self.xtrj.col(k)
    }

    /// Input at node `k`.
    pub fn input(&self, k: usize) -> ColRef<'_, E> {
        self.utrj.col(k)
    }

    /// Statistics of the accepted iterations of the last solve.
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Overrides the initial trajectory guess.
    pub fn set_initial_trajectory(
        &mut self,
        xtrj: MatRef<'_, E>,
        utrj: MatRef<'_, E>,
    ) -> Result<(), IlqrError> {
        if xtrj.nrows() != self.nx || xtrj.ncols() != self.n_steps + 1 {
            return Err(ConfigError::DimensionMismatch {
                expected: self.nx * (self.n_steps + 1),
                got: xtrj.nrows() * xtrj.ncols(),
            }
            .into());
        }
        if utrj.nrows() != self.nu || utrj.ncols() != self.n_steps {
            return Err(ConfigError::DimensionMismatch {
                expected: self.nu * self.n_steps,
                got: utrj.nrows() * utrj.ncols(),
            }
            .into());
        }
        self.xtrj.as_mut().copy_from(xtrj);
        self.utrj.as_mut().copy_from(utrj);
        Ok(())
    }

    /// Runs the solver until convergence, an error, a hook-requested stop, or
    /// the iteration limit.
    pub fn solve(&mut self, hooks: &mut SolverHooks) -> Result<Status, IlqrError> {
        self.records.clear();
        self.auglag.reset(self.opts.rho_init);
        hooks.terminator.initialize();

        self.evaluate_trajectory_metrics()?;

        for iter in 0..self.opts.max_iter {
            self.linearize_quadratize()?;
            self.backward_pass()?;
            let keep_going = self.line_search(iter, hooks)?;
            self.push_record(iter);

            if self.opts.verbose {
                info!(
                    iter,
                    cost = self.fp_res.cost,
                    defect = self.fp_res.defect_norm,
                    violation = self.fp_res.constraint_violation,
                    alpha = self.fp_res.alpha,
                    hxx_reg = self.hxx_reg,
                    "accepted iteration"
                );
            }

            if !keep_going {
                return Ok(Status::Interrupted);
            }
            if self.should_stop() {
                return Ok(Status::Optimal);
            }
            self.auglag_update()?;
            self.reduce_regularization();

            if let Some(record) = self.records.last() {
                if let Some(status) = hooks.terminator.terminate(record) {
                    return Ok(status);
                }
            }
        }

        Ok(Status::IterationLimit)
    }

    /// Linearizes dynamics and constraints and quadratizes the cost around
    /// the current trajectory. Runs once per outer iteration, before the
    /// backward pass.
    pub(crate) fn linearize_quadratize(&mut self) -> Result<(), IlqrError> {
        let n = self.n_steps;

        for k in 0..n {
            let x = self.xtrj.col(k);
            let u = self.utrj.col(k);
            let x_next = self.xtrj.col(k + 1);

            // dynamics
            let (a, b) = self.ocp.dynamics[k].jacobians(x, u);
            check_shape(k, a.as_ref(), self.nx, self.nx)?;
            check_shape(k, b.as_ref(), self.nx, self.nu)?;
            let fx = self.ocp.dynamics[k].eval(x, u);
            if fx.nrows() != self.nx {
                return Err(ConfigError::EvaluatorShape {
                    stage: k,
                    rows: fx.nrows(),
                    cols: 1,
                    expected_rows: self.nx,
                    expected_cols: 1,
                }
                .into());
            }
            if !mat_all_finite(a.as_ref()) || !mat_all_finite(b.as_ref()) {
                return Err(EvaluatorError::NonFiniteDynamics { stage: k }.into());
            }
            let slot = &mut self.dynamics[k];
            slot.a.as_mut().copy_from(&a);
            slot.b.as_mut().copy_from(&b);
            let mut finite = true;
            for i in 0..fx.nrows() {
                slot.d[i] = fx[i] - x_next[i];
                if !slot.d[i].is_finite() {
                    finite = false;
                }
            }
            if !finite {
                return Err(EvaluatorError::NonFiniteDynamics { stage: k }.into());
            }

            self.quadratize_cost(k, k)?;
            self.linearize_constraint(k, k)?;
        }

        // final node: cost and constraint are functions of the state only,
        // but the evaluators still receive the last input column
        self.quadratize_cost(n, n - 1)?;
        self.linearize_constraint(n, n - 1)?;

        Ok(())
    }

    fn quadratize_cost(&mut self, k: usize, input_node: usize) -> Result<(), IlqrError> {
        let x = self.xtrj.col(k);
        let u = self.utrj.col(input_node);
        let (grad_x, grad_u) = self.ocp.cost[k].gradient(x, u);
        let (hess_xx, hess_uu, hess_ux) = self.ocp.cost[k].hessian(x, u);

        if grad_x.nrows() != self.nx || grad_u.nrows() != self.nu {
            return Err(ConfigError::EvaluatorShape {
                stage: k,
                rows: usize::max(grad_x.nrows(), grad_u.nrows()),
                cols: 1,
                expected_rows: usize::max(self.nx, self.nu),
                expected_cols: 1,
            }
            .into());
        }
        check_shape(k, hess_xx.as_ref(), self.nx, self.nx)?;
        check_shape(k, hess_uu.as_ref(), self.nu, self.nu)?;
        check_shape(k, hess_ux.as_ref(), self.nu, self.nx)?;

        let slot = &mut self.cost[k];
        slot.grad_x.as_mut().copy_from(&grad_x);
        slot.grad_u.as_mut().copy_from(&grad_u);
        slot.hess_xx.as_mut().copy_from(&hess_xx);
        slot.hess_uu.as_mut().copy_from(&hess_uu);
        slot.hess_ux.as_mut().copy_from(&hess_ux);

        if self.opts.enable_auglag {
            self.auglag.add_state_terms(
                k,
                x,
                self.ocp.x_lb.as_ref(),
                self.ocp.x_ub.as_ref(),
                &mut slot.grad_x,
                &mut slot.hess_xx,
            );
            if k < self.n_steps {
                self.auglag.add_input_terms(
                    k,
                    u,
                    self.ocp.u_lb.as_ref(),
                    self.ocp.u_ub.as_ref(),
                    &mut slot.grad_u,
                    &mut slot.hess_uu,
                );
            }
        }

        if !col_all_finite(slot.grad_x.as_ref())
            || !col_all_finite(slot.grad_u.as_ref())
            || !mat_all_finite(slot.hess_xx.as_ref())
            || !mat_all_finite(slot.hess_uu.as_ref())
            || !mat_all_finite(slot.hess_ux.as_ref())
        {
            return Err(EvaluatorError::NonFiniteCost { stage: k }.into());
        }

        Ok(())
    }

    fn linearize_constraint(&mut self, k: usize, input_node: usize) -> Result<(), IlqrError> {
        let Some(constraint) = &self.ocp.constraint[k] else {
            self.constraint[k].rows = 0;
            return Ok(());
        };

        let x = self.xtrj.col(k);
        let u = self.utrj.col(input_node);
        let h = constraint.eval(x, u);
        let (c, d) = constraint.jacobians(x, u);
        let rows = h.nrows();
        if c.nrows() != rows || d.nrows() != rows {
            return Err(ConfigError::EvaluatorShape {
                stage: k,
                rows: usize::max(c.nrows(), d.nrows()),
                cols: c.ncols(),
                expected_rows: rows,
                expected_cols: self.nx,
            }
            .into());
        }
        if c.ncols() != self.nx || d.ncols() != self.nu {
            return Err(ConfigError::EvaluatorShape {
                stage: k,
                rows,
                cols: usize::max(c.ncols(), d.ncols()),
                expected_rows: rows,
                expected_cols: self.nx,
            }
            .into());
        }
        if !col_all_finite(h.as_ref()) || !mat_all_finite(c.as_ref()) || !mat_all_finite(d.as_ref()) {
            return Err(EvaluatorError::NonFiniteConstraint { stage: k }.into());
        }

        // the row count is fixed per stage, so the cache is sized on the
        // first linearization and written in place afterwards
        let slot = &mut self.constraint[k];
        if slot.h.nrows() != rows {
            slot.c = c;
            slot.d = d;
            slot.h = h;
        } else {
            slot.c.as_mut().copy_from(&c);
            slot.d.as_mut().copy_from(&d);
            slot.h.as_mut().copy_from(&h);
        }
        slot.rows = rows;
        Ok(())
    }

    fn auglag_update(&mut self) -> Result<(), IlqrError> {
        if !self.opts.enable_auglag {
            return Ok(());
        }
        // current solution too coarse based on the merit derivative
        if self.fp_res.merit_der.abs() > self.opts.merit_der_threshold * (1.0 + self.fp_res.merit) {
            return Ok(());
        }
        // bounds already satisfied, no need to tighten
        if self.fp_res.bound_violation < self.opts.constraint_violation_threshold {
            return Ok(());
        }

        self.auglag.update(
            self.xtrj.as_ref(),
            self.utrj.as_ref(),
            self.ocp.x_lb.as_ref(),
            self.ocp.x_ub.as_ref(),
            self.ocp.u_lb.as_ref(),
            self.ocp.u_ub.as_ref(),
            self.opts.rho_growth_factor,
        );
        info!(rho = self.auglag.rho, "augmented-Lagrangian update");

        // the penalty changed under the current trajectory
        self.evaluate_trajectory_metrics()
    }

    fn push_record(&mut self, iter: usize) {
        self.records.push(IterationRecord {
            iter,
            alpha: self.fp_res.alpha,
            cost: self.fp_res.cost,
            defect_norm: self.fp_res.defect_norm,
            constraint_violation: self.fp_res.constraint_violation,
            bound_violation: self.fp_res.bound_violation,
            merit: self.fp_res.merit,
            merit_der: self.fp_res.merit_der,
            step_length: self.fp_res.step_length,
            hxx_reg: self.hxx_reg,
            rho: self.auglag.rho,
            accepted: self.fp_res.accepted,
        });
    }

    pub(crate) fn report(&self, iter: usize, hooks: &mut SolverHooks) -> bool {
        hooks.callback.call(&IterationReport {
            iter,
            xtrj: self.fp_res.xtrj.as_ref(),
            utrj: self.fp_res.utrj.as_ref(),
            alpha: self.fp_res.alpha,
            cost: self.fp_res.cost,
            defect_norm: self.fp_res.defect_norm,
            constraint_violation: self.fp_res.constraint_violation,
            bound_violation: self.fp_res.bound_violation,
            merit: self.fp_res.merit,
            merit_der: self.fp_res.merit_der,
            step_length: self.fp_res.step_length,
            hxx_reg: self.hxx_reg,
            rho: self.auglag.rho,
            accepted: self.fp_res.accepted,
        })
    }

    pub(crate) fn dims(&self) -> (usize, usize, usize) {
        (self.nx, self.nu, self.n_steps)
    }
}

fn check_shape(stage: usize, m: MatRef<'_, E>, rows: usize, cols: usize) -> Result<(), ConfigError> {
    if m.nrows() != rows || m.ncols() != cols {
        return Err(ConfigError::EvaluatorShape {
            stage,
            rows: m.nrows(),
            cols: m.ncols(),
            expected_rows: rows,
            expected_cols: cols,
        });
    }
    Ok(())
}
