//! Rolling buffer of linearized equality constraints.
//!
//! During the backward pass, equality constraints that cannot be satisfied by
//! the inputs of later stages are carried backward in time. At the start of
//! the iteration for stage `k`, the buffer holds rows expressed in
//! `Δx_{k+1}`; [`ConstraintToGo::propagate_backwards`] rewrites them in the
//! current stage's variables through the linearized dynamics:
//!
//! ```text
//! Δx_{k+1} = A·Δx_k + B·Δu_k + d   ⇒   (C, h) ↦ (C·A, C·B, h − C·d)
//! ```
//!
//! Storage (including the propagation scratch) is preallocated for `10·n_x`
//! rows and mutated in place; exceeding the capacity is a hard error surfaced
//! by the caller.

use faer::linalg::matmul::matmul;
use faer::{Accum, Col, ColRef, Mat, MatRef, Par, RowRef};

use crate::E;

/// Capacity headroom per state dimension.
const ROWS_PER_STATE: usize = 10;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CapacityExceeded {
    pub dim: usize,
    pub capacity: usize,
}

pub(crate) struct ConstraintToGo {
    c: Mat<E>,
    d: Mat<E>,
    h: Col<E>,
    dim: usize,
    capacity: usize,
    nx: usize,
    nu: usize,

    prop_c: Mat<E>,
    prop_d: Mat<E>,
    prop_h: Mat<E>,
}

impl ConstraintToGo {
    pub fn new(nx: usize, nu: usize) -> Self {
        let capacity = ROWS_PER_STATE * nx;
        Self {
            c: Mat::zeros(capacity, nx),
            d: Mat::zeros(capacity, nu),
            h: Col::zeros(capacity),
            dim: 0,
            capacity,
            nx,
            nu,
            prop_c: Mat::zeros(capacity, nx),
            prop_d: Mat::zeros(capacity, nu),
            prop_h: Mat::zeros(capacity, 1),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.dim = 0;
    }

    /// State Jacobian block of the active rows.
    pub fn c(&self) -> MatRef<'_, E> {
        self.c.as_ref().subrows(0, self.dim)
    }

    /// Input Jacobian block of the active rows.
    pub fn d(&self) -> MatRef<'_, E> {
        self.d.as_ref().subrows(0, self.dim)
    }

    /// Constraint value block of the active rows.
    pub fn h(&self) -> ColRef<'_, E> {
        self.h.as_ref().subrows(0, self.dim)
    }

    /// Replaces the contents with state-only rows (input block zeroed).
    pub fn set(&mut self, c: MatRef<'_, E>, h: ColRef<'_, E>) -> Result<(), CapacityExceeded> {
        let rows = h.nrows();
        if rows > self.capacity {
            return Err(CapacityExceeded {
                dim: rows,
                capacity: self.capacity,
            });
        }
        self.dim = rows;
        self.c.as_mut().subrows_mut(0, rows).copy_from(c);
        self.d.as_mut().subrows_mut(0, rows).fill(0.0);
        self.h.as_mut().subrows_mut(0, rows).copy_from(h);
        Ok(())
    }

    /// Appends one state-only row.
    pub fn add_row(&mut self, c_row: RowRef<'_, E>, h_val: E) -> Result<(), CapacityExceeded> {
        self.reserve(1)?;
        let at = self.dim;
        for j in 0..self.nx {
            self.c[(at, j)] = c_row[j];
        }
        for j in 0..self.nu {
            self.d[(at, j)] = 0.0;
        }
        self.h[at] = h_val;
        self.dim += 1;
        Ok(())
    }

    /// Appends the unit-row equality `x[index] + h = target` used for pinned
    /// state bounds.
    pub fn add_state_equality(&mut self, index: usize, h_val: E) -> Result<(), CapacityExceeded> {
        self.reserve(1)?;
        let at = self.dim;
        for j in 0..self.nx {
            self.c[(at, j)] = if j == index { 1.0 } else { 0.0 };
        }
        for j in 0..self.nu {
            self.d[(at, j)] = 0.0;
        }
        self.h[at] = h_val;
        self.dim += 1;
        Ok(())
    }

    /// Appends the unit-row equality on an input component used for pinned
    /// input bounds.
    pub fn add_input_equality(&mut self, index: usize, h_val: E) -> Result<(), CapacityExceeded> {
        self.reserve(1)?;
        let at = self.dim;
        for j in 0..self.nx {
            self.c[(at, j)] = 0.0;
        }
        for j in 0..self.nu {
            self.d[(at, j)] = if j == index { 1.0 } else { 0.0 };
        }
        self.h[at] = h_val;
        self.dim += 1;
        Ok(())
    }

    /// Appends a full block of stage-constraint rows with both Jacobians.
    pub fn add_stage_rows(
        &mut self,
        c: MatRef<'_, E>,
        d: MatRef<'_, E>,
        h: ColRef<'_, E>,
    ) -> Result<(), CapacityExceeded> {
        let rows = h.nrows();
        self.reserve(rows)?;
        let at = self.dim;
        self.c.as_mut().subrows_mut(at, rows).copy_from(c);
        self.d.as_mut().subrows_mut(at, rows).copy_from(d);
        self.h.as_mut().subrows_mut(at, rows).copy_from(h);
        self.dim += rows;
        Ok(())
    }

    /// Rewrites the active rows from `Δx_{k+1}` into `(Δx_k, Δu_k)` through
    /// the linearized dynamics. Products land in the preallocated scratch
    /// block before being copied back.
    pub fn propagate_backwards(&mut self, a: MatRef<'_, E>, b: MatRef<'_, E>, defect: ColRef<'_, E>) {
        let rows = self.dim;
        if rows == 0 {
            return;
        }

        matmul(
            self.prop_c.as_mut().subrows_mut(0, rows),
            Accum::Replace,
            self.c.as_ref().subrows(0, rows),
            a,
            1.0,
            Par::Seq,
        );
        matmul(
            self.prop_d.as_mut().subrows_mut(0, rows),
            Accum::Replace,
            self.c.as_ref().subrows(0, rows),
            b,
            1.0,
            Par::Seq,
        );
        matmul(
            self.prop_h.as_mut().subrows_mut(0, rows),
            Accum::Replace,
            self.c.as_ref().subrows(0, rows),
            defect.as_mat(),
            1.0,
            Par::Seq,
        );

        self.c
            .as_mut()
            .subrows_mut(0, rows)
            .copy_from(self.prop_c.as_ref().subrows(0, rows));
        self.d
            .as_mut()
            .subrows_mut(0, rows)
            .copy_from(self.prop_d.as_ref().subrows(0, rows));
        for i in 0..rows {
            self.h[i] -= self.prop_h[(i, 0)];
        }
    }

    /// Drops every row whose residual entry is below the threshold,
    /// compacting the remaining rows in place.
    pub fn discard_satisfied(&mut self, residual: MatRef<'_, E>, threshold: E) {
        let rows = self.dim;
        let mut kept = 0;
        for i in 0..rows {
            if residual[(i, 0)].abs() < threshold {
                continue;
            }
            if kept != i {
                for j in 0..self.nx {
                    self.c[(kept, j)] = self.c[(i, j)];
                }
                for j in 0..self.nu {
                    self.d[(kept, j)] = self.d[(i, j)];
                }
                self.h[kept] = self.h[i];
            }
            kept += 1;
        }
        self.dim = kept;
    }

    fn reserve(&mut self, rows: usize) -> Result<(), CapacityExceeded> {
        if self.dim + rows > self.capacity {
            return Err(CapacityExceeded {
                dim: self.dim + rows,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
