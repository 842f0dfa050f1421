//! Discrete-time optimal control problem container.
//!
//! A [`DiscreteOcp`] bundles the horizon dimensions with the user-supplied
//! evaluators for dynamics, stage costs, and equality constraints, plus the
//! bound arrays. Evaluators are plain boxed closures returning values and
//! derivatives; the solver never differentiates anything itself, so any
//! source of derivatives works (hand-written, dual numbers, codegen).
//!
//! Evaluators must be pure and deterministic. They are shared between stages
//! with [`Rc`] and are only ever called from the solve thread.

use std::rc::Rc;

use derive_more::{Display, Error};
use faer::{Col, ColRef, Mat, MatRef};

use crate::E;

/// Dynamics evaluator for one shooting interval.
///
/// `f` maps `(x, u)` to the integrated next state; `jac` returns the
/// Jacobians `(A, B) = (∂f/∂x, ∂f/∂u)`.
pub struct DynamicsFn {
    f: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> Col<E>>,
    jac: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>)>,
}

impl DynamicsFn {
    pub fn new(
        f: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> Col<E> + 'static,
        jac: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>) + 'static,
    ) -> Self {
        Self {
            f: Box::new(f),
            jac: Box::new(jac),
        }
    }

    pub(crate) fn eval(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> Col<E> {
        (self.f)(x, u)
    }

    pub(crate) fn jacobians(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> (Mat<E>, Mat<E>) {
        (self.jac)(x, u)
    }
}

/// Stage cost evaluator.
///
/// `value` is the scalar cost, `grad` returns `(q, r) = (∇_x ℓ, ∇_u ℓ)`, and
/// `hess` returns `(Q, R, P)` with `P = ∂²ℓ/∂u∂x`. A Gauss-Newton
/// approximation of the Hessian blocks is acceptable.
pub struct CostFn {
    value: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> E>,
    grad: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Col<E>, Col<E>)>,
    hess: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>, Mat<E>)>,
}

impl CostFn {
    pub fn new(
        value: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> E + 'static,
        grad: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Col<E>, Col<E>) + 'static,
        hess: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>, Mat<E>) + 'static,
    ) -> Self {
        Self {
            value: Box::new(value),
            grad: Box::new(grad),
            hess: Box::new(hess),
        }
    }

    pub(crate) fn eval(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> E {
        (self.value)(x, u)
    }

    pub(crate) fn gradient(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> (Col<E>, Col<E>) {
        (self.grad)(x, u)
    }

    pub(crate) fn hessian(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> (Mat<E>, Mat<E>, Mat<E>) {
        (self.hess)(x, u)
    }
}

/// Equality constraint evaluator, `h(x, u) = 0` with `m` rows.
///
/// `jac` returns `(C, D) = (∂h/∂x, ∂h/∂u)`.
pub struct ConstraintFn {
    value: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> Col<E>>,
    jac: Box<dyn Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>)>,
}

impl ConstraintFn {
    pub fn new(
        value: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> Col<E> + 'static,
        jac: impl Fn(ColRef<'_, E>, ColRef<'_, E>) -> (Mat<E>, Mat<E>) + 'static,
    ) -> Self {
        Self {
            value: Box::new(value),
            jac: Box::new(jac),
        }
    }

    pub(crate) fn eval(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> Col<E> {
        (self.value)(x, u)
    }

    pub(crate) fn jacobians(&self, x: ColRef<'_, E>, u: ColRef<'_, E>) -> (Mat<E>, Mat<E>) {
        (self.jac)(x, u)
    }
}

#[derive(Debug, Display, Error, PartialEq)]
pub enum ConfigError {
    #[display("state, input, and horizon dimensions must all be positive")]
    InvalidDimensions,

    #[display("expected {expected} stage entries, got {got}")]
    WrongStageCount { expected: usize, got: usize },

    #[display("stage index {index} out of range for horizon {horizon}")]
    StageOutOfRange { index: usize, horizon: usize },

    #[display("vector or matrix of size {got} does not match expected size {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[display("lower bound exceeds upper bound at entry ({row}, {col})")]
    BoundOrdering { row: usize, col: usize },

    #[display("evaluator at stage {stage} returned shape {rows}x{cols}, expected {expected_rows}x{expected_cols}")]
    EvaluatorShape {
        stage: usize,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[display("option {name} is invalid")]
    InvalidOption { name: &'static str },
}

#[derive(Debug, Display, Error, PartialEq)]
pub enum EvaluatorError {
    #[display("dynamics evaluation produced non-finite values at stage {stage}")]
    NonFiniteDynamics { stage: usize },

    #[display("cost evaluation produced non-finite values at stage {stage}")]
    NonFiniteCost { stage: usize },

    #[display("constraint evaluation produced non-finite values at stage {stage}")]
    NonFiniteConstraint { stage: usize },
}

/// A discrete-time optimal control problem over `n_steps` shooting intervals.
///
/// States live at nodes `0..=n_steps`, inputs at nodes `0..n_steps`. A
/// default cost (`½‖u‖²` on intermediate nodes, `½‖x‖²` on the final node) is
/// installed at construction so a freshly built problem is solvable out of
/// the box.
pub struct DiscreteOcp {
    pub(crate) nx: usize,
    pub(crate) nu: usize,
    pub(crate) n_steps: usize,

    pub(crate) dynamics: Vec<Rc<DynamicsFn>>,
    pub(crate) cost: Vec<Rc<CostFn>>,
    pub(crate) constraint: Vec<Option<Rc<ConstraintFn>>>,

    pub(crate) x0: Col<E>,
    pub(crate) x_lb: Mat<E>,
    pub(crate) x_ub: Mat<E>,
    pub(crate) u_lb: Mat<E>,
    pub(crate) u_ub: Mat<E>,
}

impl DiscreteOcp {
    /// Creates a problem with the given dimensions, the default cost, and
    /// unbounded variables. The dynamics evaluator is required.
    pub fn new(
        nx: usize,
        nu: usize,
        n_steps: usize,
        dynamics: DynamicsFn,
    ) -> Result<Self, ConfigError> {
        if nx == 0 || nu == 0 || n_steps == 0 {
            return Err(ConfigError::InvalidDimensions);
        }

        let default_inter = {
            let nx = nx;
            let nu = nu;
            Rc::new(CostFn::new(
                |_x, u| 0.5 * u.norm_l2() * u.norm_l2(),
                move |_x, u| (Col::zeros(nx), u.to_owned()),
                move |_x, _u| {
                    (
                        Mat::zeros(nx, nx),
                        Mat::identity(nu, nu),
                        Mat::zeros(nu, nx),
                    )
                },
            ))
        };
        let default_final = {
            let nx = nx;
            let nu = nu;
            Rc::new(CostFn::new(
                |x, _u| 0.5 * x.norm_l2() * x.norm_l2(),
                move |x, _u| (x.to_owned(), Col::zeros(nu)),
                move |_x, _u| {
                    (
                        Mat::identity(nx, nx),
                        Mat::zeros(nu, nu),
                        Mat::zeros(nu, nx),
                    )
                },
            ))
        };

        let mut cost: Vec<Rc<CostFn>> = vec![default_inter; n_steps];
        cost.push(default_final);

        let shared = Rc::new(dynamics);

        Ok(Self {
            nx,
            nu,
            n_steps,
            dynamics: vec![shared; n_steps],
            cost,
            constraint: vec![None; n_steps + 1],
            x0: Col::zeros(nx),
            x_lb: Mat::from_fn(nx, n_steps + 1, |_, _| E::NEG_INFINITY),
            x_ub: Mat::from_fn(nx, n_steps + 1, |_, _| E::INFINITY),
            u_lb: Mat::from_fn(nu, n_steps, |_, _| E::NEG_INFINITY),
            u_ub: Mat::from_fn(nu, n_steps, |_, _| E::INFINITY),
        })
    }

    /// Number of shooting intervals.
    pub fn horizon(&self) -> usize {
        self.n_steps
    }

    /// State dimension.
    pub fn state_dim(&self) -> usize {
        self.nx
    }

    /// Input dimension.
    pub fn input_dim(&self) -> usize {
        self.nu
    }

    /// Replaces the dynamics of a single shooting interval.
    pub fn set_stage_dynamics(&mut self, k: usize, dynamics: DynamicsFn) -> Result<(), ConfigError> {
        if k >= self.n_steps {
            return Err(ConfigError::StageOutOfRange {
                index: k,
                horizon: self.n_steps,
            });
        }
        self.dynamics[k] = Rc::new(dynamics);
        Ok(())
    }

    /// Sets the cost term of the `k`-th intermediate node.
    pub fn set_intermediate_cost(&mut self, k: usize, cost: CostFn) -> Result<(), ConfigError> {
        if k >= self.n_steps {
            return Err(ConfigError::StageOutOfRange {
                index: k,
                horizon: self.n_steps,
            });
        }
        self.cost[k] = Rc::new(cost);
        Ok(())
    }

    /// Sets one cost term per intermediate node. The vector must have exactly
    /// `n_steps` entries.
    pub fn set_intermediate_costs(&mut self, costs: Vec<CostFn>) -> Result<(), ConfigError> {
        if costs.len() != self.n_steps {
            return Err(ConfigError::WrongStageCount {
                expected: self.n_steps,
                got: costs.len(),
            });
        }
        for (k, cost) in costs.into_iter().enumerate() {
            self.cost[k] = Rc::new(cost);
        }
        Ok(())
    }

    /// Sets the final cost. The input argument passed to it is ignored by the
    /// solver semantics but still supplied (the last input column).
    pub fn set_final_cost(&mut self, cost: CostFn) {
        let n = self.n_steps;
        self.cost[n] = Rc::new(cost);
    }

    /// Sets the equality constraint of the `k`-th intermediate node.
    pub fn set_intermediate_constraint(
        &mut self,
        k: usize,
        constraint: ConstraintFn,
    ) -> Result<(), ConfigError> {
        if k >= self.n_steps {
            return Err(ConfigError::StageOutOfRange {
                index: k,
                horizon: self.n_steps,
            });
        }
        self.constraint[k] = Some(Rc::new(constraint));
        Ok(())
    }

    /// Sets the final (terminal) equality constraint; its input Jacobian is
    /// ignored.
    pub fn set_final_constraint(&mut self, constraint: ConstraintFn) {
        let n = self.n_steps;
        self.constraint[n] = Some(Rc::new(constraint));
    }

    /// Fixes the initial state: stores it and pins the first bound column,
    /// which the solver treats as a degenerate equality.
    pub fn set_initial_state(&mut self, x0: ColRef<'_, E>) -> Result<(), ConfigError> {
        if x0.nrows() != self.nx {
            return Err(ConfigError::DimensionMismatch {
                expected: self.nx,
                got: x0.nrows(),
            });
        }
        self.x0 = x0.to_owned();
        for i in 0..self.nx {
            self.x_lb[(i, 0)] = x0[i];
            self.x_ub[(i, 0)] = x0[i];
        }
        Ok(())
    }

    /// Sets elementwise state bounds, `nx × (n_steps + 1)`.
    pub fn set_state_bounds(&mut self, lb: MatRef<'_, E>, ub: MatRef<'_, E>) -> Result<(), ConfigError> {
        Self::check_bounds(self.nx, self.n_steps + 1, lb, ub)?;
        self.x_lb = lb.to_owned();
        self.x_ub = ub.to_owned();
        Ok(())
    }

    /// Sets elementwise input bounds, `nu × n_steps`.
    pub fn set_input_bounds(&mut self, lb: MatRef<'_, E>, ub: MatRef<'_, E>) -> Result<(), ConfigError> {
        Self::check_bounds(self.nu, self.n_steps, lb, ub)?;
        self.u_lb = lb.to_owned();
        self.u_ub = ub.to_owned();
        Ok(())
    }

    fn check_bounds(
        rows: usize,
        cols: usize,
        lb: MatRef<'_, E>,
        ub: MatRef<'_, E>,
    ) -> Result<(), ConfigError> {
        if lb.nrows() != rows || ub.nrows() != rows {
            return Err(ConfigError::DimensionMismatch {
                expected: rows,
                got: usize::max(lb.nrows(), ub.nrows()),
            });
        }
        if lb.ncols() != cols || ub.ncols() != cols {
            return Err(ConfigError::DimensionMismatch {
                expected: cols,
                got: usize::max(lb.ncols(), ub.ncols()),
            });
        }
        for j in 0..cols {
            for i in 0..rows {
                if lb[(i, j)] > ub[(i, j)] {
                    return Err(ConfigError::BoundOrdering { row: i, col: j });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_dynamics(nx: usize, nu: usize) -> DynamicsFn {
        DynamicsFn::new(
            move |x, _u| x.to_owned(),
            move |_x, _u| (Mat::identity(nx, nx), Mat::zeros(nx, nu)),
        )
    }

    fn quadratic_cost(nx: usize, nu: usize) -> CostFn {
        CostFn::new(
            |x, u| 0.5 * (x.norm_l2() * x.norm_l2() + u.norm_l2() * u.norm_l2()),
            move |x, u| (x.to_owned(), u.to_owned()),
            move |_x, _u| {
                (
                    Mat::identity(nx, nx),
                    Mat::identity(nu, nu),
                    Mat::zeros(nu, nx),
                )
            },
        )
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert_eq!(
            DiscreteOcp::new(0, 1, 5, unit_dynamics(0, 1)).err(),
            Some(ConfigError::InvalidDimensions)
        );
    }

    #[test]
    fn rejects_wrong_intermediate_cost_length() {
        let mut ocp = DiscreteOcp::new(2, 1, 5, unit_dynamics(2, 1)).unwrap();
        let costs = vec![quadratic_cost(2, 1), quadratic_cost(2, 1)];
        assert_eq!(
            ocp.set_intermediate_costs(costs).err(),
            Some(ConfigError::WrongStageCount {
                expected: 5,
                got: 2
            })
        );
    }

    #[test]
    fn rejects_out_of_range_stage() {
        let mut ocp = DiscreteOcp::new(2, 1, 5, unit_dynamics(2, 1)).unwrap();
        assert_eq!(
            ocp.set_intermediate_cost(5, quadratic_cost(2, 1)).err(),
            Some(ConfigError::StageOutOfRange {
                index: 5,
                horizon: 5
            })
        );
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut ocp = DiscreteOcp::new(2, 1, 3, unit_dynamics(2, 1)).unwrap();
        let lb = Mat::from_fn(1, 3, |_, _| 1.0);
        let ub = Mat::from_fn(1, 3, |_, _| -1.0);
        assert_eq!(
            ocp.set_input_bounds(lb.as_ref(), ub.as_ref()).err(),
            Some(ConfigError::BoundOrdering { row: 0, col: 0 })
        );
    }

    #[test]
    fn initial_state_pins_first_bound_column() {
        let mut ocp = DiscreteOcp::new(2, 1, 3, unit_dynamics(2, 1)).unwrap();
        let x0: Col<E> = vec![1.0, -2.0].into_iter().collect();
        ocp.set_initial_state(x0.as_ref()).unwrap();
        assert_eq!(ocp.x_lb[(0, 0)], 1.0);
        assert_eq!(ocp.x_ub[(1, 0)], -2.0);
        assert_eq!(ocp.x_lb[(0, 1)], E::NEG_INFINITY);
    }

    #[test]
    fn rejects_mismatched_initial_state() {
        let mut ocp = DiscreteOcp::new(2, 1, 3, unit_dynamics(2, 1)).unwrap();
        let x0: Col<E> = vec![1.0].into_iter().collect();
        assert_eq!(
            ocp.set_initial_state(x0.as_ref()).err(),
            Some(ConfigError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        );
    }
}
