//! End-to-end solver tests.

mod scenarios;

use faer::{Col, Mat};

use crate::ocp::{ConstraintFn, CostFn, DiscreteOcp, DynamicsFn};
use crate::{ConstraintDecomp, IlqrOptions, KktDecomp, E};

/// Double integrator `x⁺ = [[1, 1], [0, 1]]·x + [0.5, 1]·u` with quadratic
/// cost `½(xᵀx + uᵀu)` and terminal cost `½xᵀx`, starting at `[1, 0]`.
pub(crate) fn double_integrator(n_steps: usize) -> DiscreteOcp {
    let dynamics = DynamicsFn::new(
        |x, u| {
            let mut next: Col<E> = Col::zeros(2);
            next[0] = x[0] + x[1] + 0.5 * u[0];
            next[1] = x[1] + u[0];
            next
        },
        |_x, _u| {
            let a = Mat::from_fn(2, 2, |i, j| if i <= j { 1.0 } else { 0.0 });
            let b = Mat::from_fn(2, 1, |i, _| if i == 0 { 0.5 } else { 1.0 });
            (a, b)
        },
    );

    let mut ocp = DiscreteOcp::new(2, 1, n_steps, dynamics).unwrap();

    let stage_cost = || {
        CostFn::new(
            |x, u| 0.5 * (x.norm_l2() * x.norm_l2() + u.norm_l2() * u.norm_l2()),
            |x, u| (x.to_owned(), u.to_owned()),
            |_x, _u| (Mat::identity(2, 2), Mat::identity(1, 1), Mat::zeros(1, 2)),
        )
    };
    let costs = (0..n_steps).map(|_| stage_cost()).collect();
    ocp.set_intermediate_costs(costs).unwrap();
    ocp.set_final_cost(CostFn::new(
        |x, _u| 0.5 * x.norm_l2() * x.norm_l2(),
        |x, _u| (x.to_owned(), Col::zeros(1)),
        |_x, _u| (Mat::identity(2, 2), Mat::zeros(1, 1), Mat::zeros(1, 2)),
    ));

    let x0: Col<E> = vec![1.0, 0.0].into_iter().collect();
    ocp.set_initial_state(x0.as_ref()).unwrap();

    ocp
}

/// Terminal equality `x_N = target` as a constraint evaluator.
pub(crate) fn terminal_target(target: [E; 2]) -> ConstraintFn {
    ConstraintFn::new(
        move |x, _u| {
            let mut h: Col<E> = Col::zeros(2);
            h[0] = x[0] - target[0];
            h[1] = x[1] - target[1];
            h
        },
        |_x, _u| (Mat::identity(2, 2), Mat::zeros(2, 1)),
    )
}

pub(crate) fn options_with(kkt: KktDecomp, constr: ConstraintDecomp) -> IlqrOptions {
    IlqrOptions {
        kkt_decomp: kkt,
        constr_decomp: constr,
        ..Default::default()
    }
}
