//! End-to-end solve scenarios.

use std::f64::consts::PI;

use faer::{Col, Mat};
use rstest::rstest;
use rstest_reuse::{apply, template};

use crate::callback::{Callback, IterationReport};
use crate::ocp::{ConstraintFn, CostFn, DiscreteOcp, DynamicsFn};
use crate::terminators::TimeOutTerminator;
use crate::tests::{double_integrator, options_with, terminal_target};
use crate::{
    ConstraintDecomp, IlqrOptions, IterativeLqr, KktDecomp, SolverHooks, Status, E,
};

#[template]
#[rstest]
fn decomposition_matrix(
    #[values(KktDecomp::Lu, KktDecomp::Qr, KktDecomp::Ldlt)] kkt: KktDecomp,
    #[values(ConstraintDecomp::Cod, ConstraintDecomp::Qr, ConstraintDecomp::Svd)]
    constr: ConstraintDecomp,
) {
}

fn solve(solver: &mut IterativeLqr) -> Status {
    let mut hooks = SolverHooks::default();
    solver.solve(&mut hooks).unwrap()
}

#[test]
fn lqr_converges_in_one_iteration() {
    let opts = IlqrOptions {
        hxx_reg_base: 0.0,
        ..Default::default()
    };
    let mut solver = IterativeLqr::new(double_integrator(20), opts).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    // one productive iteration plus the stationarity check
    assert!(solver.records().len() <= 3);

    let first = solver.records()[0];
    assert!(first.accepted);
    assert!((first.alpha - 1.0).abs() < 1e-15);
    assert!(first.defect_norm < 1e-12);
}

#[test]
fn lqr_matches_closed_form_riccati_rollout() {
    let opts = IlqrOptions {
        hxx_reg_base: 0.0,
        ..Default::default()
    };
    let n = 20;
    let mut solver = IterativeLqr::new(double_integrator(n), opts).unwrap();
    solve(&mut solver);

    // closed-form discrete Riccati recursion for the same system
    let a = Mat::from_fn(2, 2, |i, j| if i <= j { 1.0 } else { 0.0 });
    let b = Mat::from_fn(2, 1, |i, _| if i == 0 { 0.5 } else { 1.0 });
    let q = Mat::<E>::identity(2, 2);

    let mut p = Mat::<E>::identity(2, 2);
    let mut gains: Vec<Mat<E>> = Vec::new();
    for _ in 0..n {
        let btpb = (b.transpose() * &p * &b)[(0, 0)] + 1.0; // R = 1
        let btpa = b.transpose() * &p * &a;
        let gain = (1.0 / btpb) * &btpa;
        p = &q + a.transpose() * &p * &a - (1.0 / btpb) * (btpa.transpose() * &btpa);
        p = 0.5 * (&p + p.transpose());
        gains.push(gain);
    }
    gains.reverse();

    // rollout under the optimal policy u_k = -K_k·x_k
    let mut x: Col<E> = vec![1.0, 0.0].into_iter().collect();
    for k in 0..n {
        let u = -(&gains[k] * &x)[0];
        assert!(
            (solver.input(k)[0] - u).abs() < 1e-8,
            "input mismatch at stage {k}"
        );
        assert!(
            (solver.state(k) - x.as_ref()).norm_max() < 1e-8,
            "state mismatch at stage {k}"
        );
        let mut next: Col<E> = Col::zeros(2);
        next[0] = x[0] + x[1] + 0.5 * u;
        next[1] = x[1] + u;
        x = next;
    }
    assert!((solver.state(n) - x.as_ref()).norm_max() < 1e-8);
}

#[test]
fn resolving_an_optimal_trajectory_stops_immediately() {
    let mut solver = IterativeLqr::new(double_integrator(20), IlqrOptions::default()).unwrap();
    assert_eq!(solve(&mut solver), Status::Optimal);

    let status = solve(&mut solver);
    assert_eq!(status, Status::Optimal);
    assert_eq!(solver.records().len(), 1);

    let record = solver.records()[0];
    let input_scale = 1.0 + solver.input_trajectory().norm_l2();
    assert!(record.step_length / input_scale < 1e-9);
}

#[apply(decomposition_matrix)]
fn terminal_equality_converges(kkt: KktDecomp, constr: ConstraintDecomp) {
    let mut ocp = double_integrator(20);
    ocp.set_final_constraint(terminal_target([0.0, 0.0]));

    let mut solver = IterativeLqr::new(ocp, options_with(kkt, constr)).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    assert!(solver.records().len() <= 5);

    let last = solver.records().last().unwrap();
    assert!(last.defect_norm < 1e-6);
    assert!(last.constraint_violation < 1e-6);
    assert!(solver.state(20).norm_max() < 1e-6);
}

#[apply(decomposition_matrix)]
fn fully_determined_control_follows_the_constraint(kkt: KktDecomp, constr: ConstraintDecomp) {
    let n = 10;
    let mut ocp = double_integrator(n);
    for k in 0..n {
        // u_k = 0.5, one row per input: no nullspace left to optimize
        ocp.set_intermediate_constraint(
            k,
            ConstraintFn::new(
                |_x, u| {
                    let mut h: Col<E> = Col::zeros(1);
                    h[0] = u[0] - 0.5;
                    h
                },
                |_x, _u| (Mat::zeros(1, 2), Mat::identity(1, 1)),
            ),
        )
        .unwrap();
    }

    let mut solver = IterativeLqr::new(ocp, options_with(kkt, constr)).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    for k in 0..n {
        assert!((solver.input(k)[0] - 0.5).abs() < 1e-6, "stage {k}");
    }
}

#[test]
fn decomposition_choices_agree_on_the_optimum() {
    let reference = {
        let mut ocp = double_integrator(20);
        ocp.set_final_constraint(terminal_target([0.0, 0.0]));
        let mut solver =
            IterativeLqr::new(ocp, options_with(KktDecomp::Lu, ConstraintDecomp::Cod)).unwrap();
        solve(&mut solver);
        (
            solver.state_trajectory().to_owned(),
            solver.input_trajectory().to_owned(),
        )
    };

    for constr in [ConstraintDecomp::Qr, ConstraintDecomp::Svd] {
        let mut ocp = double_integrator(20);
        ocp.set_final_constraint(terminal_target([0.0, 0.0]));
        let mut solver = IterativeLqr::new(ocp, options_with(KktDecomp::Lu, constr)).unwrap();
        solve(&mut solver);

        assert!((solver.state_trajectory() - reference.0.as_ref()).norm_max() < 1e-6);
        assert!((solver.input_trajectory() - reference.1.as_ref()).norm_max() < 1e-6);
    }
}

#[test]
fn fixed_initial_state_is_never_moved() {
    let mut ocp = double_integrator(20);
    ocp.set_final_constraint(terminal_target([0.0, 0.0]));
    let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();
    solve(&mut solver);

    assert_eq!(solver.state(0)[0], 1.0);
    assert_eq!(solver.state(0)[1], 0.0);
}

#[test]
fn pendulum_swing_up_respects_input_bounds() {
    let n = 50;
    let dt = 0.05;

    let dynamics = DynamicsFn::new(
        move |x, u| {
            let mut next: Col<E> = Col::zeros(2);
            next[0] = x[0] + dt * x[1];
            next[1] = x[1] + dt * (x[0].sin() + u[0]);
            next
        },
        move |x, _u| {
            let mut a = Mat::<E>::identity(2, 2);
            a[(0, 1)] = dt;
            a[(1, 0)] = dt * x[0].cos();
            let mut b = Mat::<E>::zeros(2, 1);
            b[(1, 0)] = dt;
            (a, b)
        },
    );

    let mut ocp = DiscreteOcp::new(2, 1, n, dynamics).unwrap();

    let goal = [PI, 0.0];
    let costs = (0..n)
        .map(|_| {
            CostFn::new(
                |_x, u| 0.5 * 1e-2 * u.norm_l2() * u.norm_l2(),
                |_x, u| (Col::zeros(2), 1e-2 * u),
                |_x, _u| (Mat::zeros(2, 2), 1e-2 * Mat::<E>::identity(1, 1), Mat::zeros(1, 2)),
            )
        })
        .collect();
    ocp.set_intermediate_costs(costs).unwrap();
    ocp.set_final_cost(CostFn::new(
        move |x, _u| 0.5 * 1e-2 * ((x[0] - goal[0]).powi(2) + (x[1] - goal[1]).powi(2)),
        move |x, _u| {
            let mut g: Col<E> = Col::zeros(2);
            g[0] = 1e-2 * (x[0] - goal[0]);
            g[1] = 1e-2 * (x[1] - goal[1]);
            (g, Col::zeros(1))
        },
        |_x, _u| (1e-2 * Mat::<E>::identity(2, 2), Mat::zeros(1, 1), Mat::zeros(1, 2)),
    ));
    ocp.set_final_constraint(terminal_target(goal));

    let x0: Col<E> = Col::zeros(2);
    ocp.set_initial_state(x0.as_ref()).unwrap();

    let u_lb = Mat::from_fn(1, n, |_, _| -5.0);
    let u_ub = Mat::from_fn(1, n, |_, _| 5.0);
    ocp.set_input_bounds(u_lb.as_ref(), u_ub.as_ref()).unwrap();

    let opts = IlqrOptions {
        max_iter: 500,
        enable_auglag: true,
        ..Default::default()
    };
    let mut solver = IterativeLqr::new(ocp, opts).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    let last = solver.records().last().unwrap();
    assert!(last.defect_norm < 1e-6);
    assert!(last.constraint_violation < 1e-6);
    assert!(last.bound_violation < 1e-6);

    let xn = solver.state(n);
    assert!((xn[0] - goal[0]).abs() < 0.05);
    assert!((xn[1] - goal[1]).abs() < 0.05);
    assert!(solver.input_trajectory().norm_max() <= 5.0 + 1e-4);
}

#[test]
fn singular_input_curvature_is_recovered_by_regularization() {
    let n = 5;
    let mut ocp = double_integrator(n);

    // zero input-cost curvature and a zero terminal cost: the first stage
    // KKT system of the first pass is exactly singular
    let costs = (0..n)
        .map(|_| {
            CostFn::new(
                |x, _u| 0.5 * x.norm_l2() * x.norm_l2(),
                |x, _u| (x.to_owned(), Col::zeros(1)),
                |_x, _u| (Mat::identity(2, 2), Mat::zeros(1, 1), Mat::zeros(1, 2)),
            )
        })
        .collect();
    ocp.set_intermediate_costs(costs).unwrap();
    ocp.set_final_cost(CostFn::new(
        |_x, _u| 0.0,
        |_x, _u| (Col::zeros(2), Col::zeros(1)),
        |_x, _u| (Mat::zeros(2, 2), Mat::zeros(1, 1), Mat::zeros(1, 2)),
    ));

    let opts = IlqrOptions {
        hxx_reg_base: 0.0,
        ..Default::default()
    };
    let mut solver = IterativeLqr::new(ocp, opts).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    // the first backward pass must have bumped the regularization once
    assert!((solver.records()[0].hxx_reg - 10.0).abs() < 1e-12);
}

#[test]
fn unreachable_terminal_target_returns_best_effort() {
    // one interval, one control dof: a two-dimensional target is generally
    // out of reach and the leftover rows surface as a warning
    let mut ocp = double_integrator(1);
    ocp.set_final_constraint(terminal_target([10.0, 10.0]));

    let opts = IlqrOptions {
        max_iter: 5,
        ..Default::default()
    };
    let mut solver = IterativeLqr::new(ocp, opts).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::IterationLimit);
    let last = solver.records().last().unwrap();
    assert!(last.constraint_violation > 1e-3);
    assert!(crate::linalg::mat_all_finite(solver.state_trajectory()));
    assert!(crate::linalg::mat_all_finite(solver.input_trajectory()));
}

#[test]
fn duplicated_constraint_row_is_dropped_without_changing_the_solution() {
    let single = {
        let mut ocp = double_integrator(20);
        ocp.set_final_constraint(terminal_target([0.0, 0.0]));
        let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();
        solve(&mut solver);
        (
            solver.state_trajectory().to_owned(),
            solver.input_trajectory().to_owned(),
        )
    };

    let mut ocp = double_integrator(20);
    ocp.set_final_constraint(ConstraintFn::new(
        |x, _u| {
            let mut h: Col<E> = Col::zeros(4);
            h[0] = x[0];
            h[1] = x[1];
            h[2] = x[0];
            h[3] = x[1];
            h
        },
        |_x, _u| {
            let c = Mat::from_fn(4, 2, |i, j| if i % 2 == j { 1.0 } else { 0.0 });
            (c, Mat::zeros(4, 1))
        },
    ));
    let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();
    let status = solve(&mut solver);

    assert_eq!(status, Status::Optimal);
    assert!((solver.state_trajectory() - single.0.as_ref()).norm_max() < 1e-8);
    assert!((solver.input_trajectory() - single.1.as_ref()).norm_max() < 1e-8);
}

#[test]
fn non_finite_dynamics_abort_the_solve() {
    let dynamics = DynamicsFn::new(
        |_x, _u| {
            let mut next: Col<E> = Col::zeros(2);
            next[0] = E::NAN;
            next
        },
        |_x, _u| (Mat::identity(2, 2), Mat::zeros(2, 1)),
    );
    let ocp = DiscreteOcp::new(2, 1, 3, dynamics).unwrap();
    let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();

    let mut hooks = SolverHooks::default();
    assert!(solver.solve(&mut hooks).is_err());
}

struct CountingCallback {
    calls: usize,
    stop_after: usize,
}

impl Callback for CountingCallback {
    fn call(&mut self, _report: &IterationReport<'_>) -> bool {
        self.calls += 1;
        self.calls < self.stop_after
    }
}

#[test]
fn callback_runs_per_evaluation_and_can_stop_the_solve() {
    let mut ocp = double_integrator(20);
    ocp.set_final_constraint(terminal_target([0.0, 0.0]));
    let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();

    let mut hooks = SolverHooks {
        callback: Box::new(CountingCallback {
            calls: 0,
            stop_after: 1,
        }),
        ..Default::default()
    };
    let status = solver.solve(&mut hooks).unwrap();

    assert_eq!(status, Status::Interrupted);
    assert_eq!(solver.records().len(), 1);
}

#[test]
fn terminator_is_consulted_between_iterations() {
    let mut ocp = double_integrator(20);
    ocp.set_final_constraint(terminal_target([0.0, 0.0]));
    let mut solver = IterativeLqr::new(ocp, IlqrOptions::default()).unwrap();

    let mut hooks = SolverHooks {
        terminator: Box::new(TimeOutTerminator::new(std::time::Duration::from_secs(0))),
        ..Default::default()
    };
    let status = solver.solve(&mut hooks).unwrap();

    assert!(matches!(status, Status::TimeLimit | Status::Optimal));
}
