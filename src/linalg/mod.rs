//! Dense linear-algebra helpers shared by the solver components.

pub mod kkt;
pub mod rank;

use faer::{unzip, zip, ColRef, MatMut, MatRef};

use crate::E;

/// Inner product of two column vectors.
pub(crate) fn dot(x1: ColRef<'_, E>, x2: ColRef<'_, E>) -> E {
    let mut acc = E::from(0.);

    zip!(x1, x2).for_each(|unzip!(x1, x2)| acc += *x1 * *x2);

    acc
}

/// Writes `dst = -src` elementwise, without allocating.
pub(crate) fn copy_neg(dst: MatMut<'_, E>, src: MatRef<'_, E>) {
    zip!(dst, src).for_each(|unzip!(dst, src)| *dst = -*src);
}

/// Returns the positive part `max(v, 0)`.
pub(crate) fn positive_part(v: E) -> E {
    if v > 0. { v } else { 0. }
}

pub(crate) fn mat_all_finite(m: MatRef<'_, E>) -> bool {
    let mut finite = true;

    zip!(m).for_each(|unzip!(v)| {
        if !v.is_finite() {
            finite = false;
        }
    });

    finite
}

pub(crate) fn col_all_finite(c: ColRef<'_, E>) -> bool {
    let mut finite = true;

    zip!(c).for_each(|unzip!(v)| {
        if !v.is_finite() {
            finite = false;
        }
    });

    finite
}

#[cfg(test)]
mod tests {
    use faer::Col;

    use super::*;

    #[test]
    fn dot_matches_manual_sum() {
        let a: Col<E> = vec![1.0, -2.0, 3.0].into_iter().collect();
        let b: Col<E> = vec![4.0, 0.5, -1.0].into_iter().collect();
        assert!((dot(a.as_ref(), b.as_ref()) - 0.0).abs() < 1e-15);
    }

    #[test]
    fn finiteness_scans_detect_nan() {
        let mut c: Col<E> = Col::zeros(3);
        assert!(col_all_finite(c.as_ref()));
        c[1] = E::NAN;
        assert!(!col_all_finite(c.as_ref()));
    }

    #[test]
    fn positive_part_clamps() {
        assert_eq!(positive_part(1.5), 1.5);
        assert_eq!(positive_part(-0.1), 0.0);
    }

    #[test]
    fn copy_neg_negates_elementwise() {
        let src = faer::Mat::from_fn(2, 2, |i, j| (i * 2 + j) as E);
        let mut dst = faer::Mat::<E>::zeros(2, 2);
        copy_neg(dst.as_mut(), src.as_ref());
        assert_eq!(dst[(1, 0)], -2.0);
        assert_eq!(dst[(0, 0)], 0.0);
    }
}
