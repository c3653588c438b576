// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::exponent::std_to_exponent;
use crate::matrix::Matrix;
use pema_core::{EmaProfile, PemaError};

/// Closed-form expected correlation between two power-function EMA
/// averaging processes.
///
/// The ratio exponent deliberately depends on which offset is larger:
/// `b_exp` when `a` precedes `b`, `-a_exp` otherwise (including equal
/// offsets). The asymmetry models causal precedence between older and
/// newer checkpoints and must not be "fixed".
pub fn correlation(a: EmaProfile, b: EmaProfile) -> Result<f64, PemaError> {
    let a_exp = std_to_exponent(a.std())?;
    let b_exp = std_to_exponent(b.std())?;
    correlation_from_exponents(a.offset(), a_exp, b.offset(), b_exp)
}

fn correlation_from_exponents(
    a_ofs: f64,
    a_exp: f64,
    b_ofs: f64,
    b_exp: f64,
) -> Result<f64, PemaError> {
    let ratio = a_ofs / b_ofs;
    let ratio_exp = if a_ofs < b_ofs { b_exp } else { -a_exp };
    let max_ofs = a_ofs.max(b_ofs);
    let value = (a_exp + 1.0) * (b_exp + 1.0) * ratio.powf(ratio_exp)
        / ((a_exp + b_exp + 1.0) * max_ofs);
    if !value.is_finite() {
        return Err(PemaError::numerical_issue(format!(
            "non-finite correlation for offsets ({a_ofs}, {b_ofs}) and exponents ({a_exp}, {b_exp})"
        )));
    }
    Ok(value)
}

/// Full correlation matrix between every row profile and every column
/// profile (outer-product broadcasting). Exponents are derived once per
/// profile, not once per matrix entry.
pub fn correlation_matrix(
    rows: &[EmaProfile],
    cols: &[EmaProfile],
) -> Result<Matrix, PemaError> {
    if rows.is_empty() || cols.is_empty() {
        return Err(PemaError::invalid_input(
            "correlation matrix requires at least one row and one column profile",
        ));
    }
    let row_exps = rows
        .iter()
        .map(|profile| std_to_exponent(profile.std()))
        .collect::<Result<Vec<_>, _>>()?;
    let col_exps = cols
        .iter()
        .map(|profile| std_to_exponent(profile.std()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Matrix::zeros(rows.len(), cols.len())?;
    for (i, (row, &row_exp)) in rows.iter().zip(row_exps.iter()).enumerate() {
        for (j, (col, &col_exp)) in cols.iter().zip(col_exps.iter()).enumerate() {
            out.set(
                i,
                j,
                correlation_from_exponents(row.offset(), row_exp, col.offset(), col_exp)?,
            );
        }
    }
    Ok(out)
}
