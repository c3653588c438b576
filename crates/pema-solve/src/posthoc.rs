// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::correlation::correlation_matrix;
use crate::matrix::Matrix;
use pema_core::{EmaProfile, PemaError};

/// Normalized reconstruction coefficients: one weight per source profile
/// per target profile. Every target column sums to exactly 1, which makes
/// the reconstruction an affine combination of source models rather than
/// an arbitrary linear one.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients {
    matrix: Matrix,
}

impl Coefficients {
    pub fn n_sources(&self) -> usize {
        self.matrix.rows()
    }

    pub fn n_targets(&self) -> usize {
        self.matrix.cols()
    }

    /// Weight of `source` in the reconstruction of `target`.
    pub fn get(&self, source: usize, target: usize) -> f64 {
        self.matrix.get(source, target)
    }

    /// All source weights for one target, in source order.
    pub fn for_target(&self, target: usize) -> Vec<f64> {
        self.matrix.column(target)
    }
}

/// Solves for the coefficients that reconstruct each target EMA profile as
/// a weighted average of the source profiles.
///
/// Builds `A` (source/source correlations) and `B` (source/target
/// correlations), solves `A X = B` by dense LU with partial pivoting, and
/// normalizes each target column of `X` to sum to 1. Degenerate sources
/// (duplicate (offset, std) pairs) make `A` singular and fail the solve.
pub fn solve_posthoc_coefficients(
    sources: &[EmaProfile],
    targets: &[EmaProfile],
) -> Result<Coefficients, PemaError> {
    if sources.is_empty() {
        return Err(PemaError::invalid_input(
            "posthoc solve requires at least one source profile",
        ));
    }
    if targets.is_empty() {
        return Err(PemaError::invalid_input(
            "posthoc solve requires at least one target profile",
        ));
    }

    let a = correlation_matrix(sources, sources)?;
    let b = correlation_matrix(sources, targets)?;
    let mut x = solve_linear(a, b)?;

    for target in 0..x.cols() {
        let sum: f64 = (0..x.rows()).map(|source| x.get(source, target)).sum();
        if !sum.is_finite() || sum == 0.0 {
            return Err(PemaError::numerical_issue(format!(
                "coefficient column {target} sums to {sum}; cannot normalize to an affine combination"
            )));
        }
        for source in 0..x.rows() {
            let value = x.get(source, target) / sum;
            x.set(source, target, value);
        }
    }

    Ok(Coefficients { matrix: x })
}

/// Dense `A X = B` solve, Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Matrix, mut b: Matrix) -> Result<Matrix, PemaError> {
    let n = a.rows();
    if a.cols() != n {
        return Err(PemaError::invalid_input(format!(
            "linear solve requires a square matrix; got {}x{}",
            a.rows(),
            a.cols()
        )));
    }
    if b.rows() != n {
        return Err(PemaError::invalid_input(format!(
            "right-hand side row count mismatch: got {}, expected {n}",
            b.rows()
        )));
    }

    let scale = a
        .as_slice()
        .iter()
        .fold(0.0_f64, |acc, &value| acc.max(value.abs()));
    let pivot_floor = scale * f64::EPSILON * n as f64;

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_mag = a.get(col, col).abs();
        for row in col + 1..n {
            let mag = a.get(row, col).abs();
            if mag > pivot_mag {
                pivot_row = row;
                pivot_mag = mag;
            }
        }
        if !pivot_mag.is_finite() || pivot_mag <= pivot_floor {
            return Err(PemaError::numerical_issue(format!(
                "correlation matrix is singular at pivot {col} (magnitude {pivot_mag}); \
                 source profiles are degenerate or duplicated"
            )));
        }
        a.swap_rows(col, pivot_row);
        b.swap_rows(col, pivot_row);

        let pivot = a.get(col, col);
        for row in col + 1..n {
            let factor = a.get(row, col) / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                let value = a.get(row, k) - factor * a.get(col, k);
                a.set(row, k, value);
            }
            for k in 0..b.cols() {
                let value = b.get(row, k) - factor * b.get(col, k);
                b.set(row, k, value);
            }
        }
    }

    let mut x = Matrix::zeros(n, b.cols())?;
    for target in 0..b.cols() {
        for row in (0..n).rev() {
            let mut sum = b.get(row, target);
            for k in row + 1..n {
                sum -= a.get(row, k) * x.get(k, target);
            }
            x.set(row, target, sum / a.get(row, row));
        }
    }
    Ok(x)
}
