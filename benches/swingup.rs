use criterion::{criterion_group, criterion_main, Criterion};
use faer::{Col, Mat};

use gnms::ocp::{ConstraintFn, CostFn, DiscreteOcp, DynamicsFn};
use gnms::{IlqrOptions, IterativeLqr, SolverHooks, E};

fn pendulum_ocp(n: usize, dt: E) -> DiscreteOcp {
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

    let goal = std::f64::consts::PI;
    ocp.set_final_constraint(ConstraintFn::new(
        move |x, _u| {
            let mut h: Col<E> = Col::zeros(2);
            h[0] = x[0] - goal;
            h[1] = x[1];
            h
        },
        |_x, _u| (Mat::identity(2, 2), Mat::zeros(2, 1)),
    ));

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
        |_x, _u| 0.0,
        |_x, _u| (Col::zeros(2), Col::zeros(1)),
        |_x, _u| (Mat::zeros(2, 2), Mat::zeros(1, 1), Mat::zeros(1, 2)),
    ));

    let x0: Col<E> = Col::zeros(2);
    ocp.set_initial_state(x0.as_ref()).unwrap();

    ocp
}

fn swingup_benchmark(c: &mut Criterion) {
    c.bench_function("pendulum swing-up N=50", |bencher| {
        bencher.iter(|| {
            let opts = IlqrOptions {
                max_iter: 50,
                ..Default::default()
            };
            let mut solver = IterativeLqr::new(pendulum_ocp(50, 0.05), opts).unwrap();
            let mut hooks = SolverHooks::default();
            solver.solve(&mut hooks).unwrap()
        });
    });
}

criterion_group!(benches, swingup_benchmark);
criterion_main!(benches);
