// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::{PemaError, STD_LOWER_BOUND, STD_UPPER_BOUND};

/// Converts a relative standard deviation into the exponent of the
/// power-function averaging kernel.
///
/// With `t = std^-2`, the exponent is the largest real root of
/// `x^3 + 7x^2 + (16 - t)x + (12 - t)`. The cubic comes from inverting
/// `std^2 = (g + 1) / ((g + 2)^2 (g + 3))`, the relative variance of a
/// power-function EMA with exponent `g`.
pub fn std_to_exponent(std: f64) -> Result<f64, PemaError> {
    if !std.is_finite() || std <= STD_LOWER_BOUND || std >= STD_UPPER_BOUND {
        return Err(PemaError::invalid_input(format!(
            "relative standard deviation must be in ({STD_LOWER_BOUND}, {STD_UPPER_BOUND}); got {std}"
        )));
    }
    let t = std.powi(-2);
    let exponent = max_real_root(7.0, 16.0 - t, 12.0 - t);
    if !exponent.is_finite() {
        return Err(PemaError::numerical_issue(format!(
            "non-finite EMA exponent for std={std}"
        )));
    }
    Ok(exponent)
}

/// Elementwise [`std_to_exponent`] over a slice.
pub fn std_to_exponent_slice(stds: &[f64]) -> Result<Vec<f64>, PemaError> {
    stds.iter().copied().map(std_to_exponent).collect()
}

/// Largest real root of the monic cubic `x^3 + b x^2 + c x + d`.
///
/// Closed-form depressed-cubic solution; complex conjugate pairs are
/// discarded, matching taking the maximum real part of the root set.
fn max_real_root(b: f64, c: f64, d: f64) -> f64 {
    let p = c - b * b / 3.0;
    let q = 2.0 * b.powi(3) / 27.0 - b * c / 3.0 + d;
    let shift = -b / 3.0;

    let discriminant = (q / 2.0).powi(2) + (p / 3.0).powi(3);
    if discriminant > 0.0 {
        // One real root (Cardano); the other two are complex conjugates.
        let sq = discriminant.sqrt();
        let y = (-q / 2.0 + sq).cbrt() + (-q / 2.0 - sq).cbrt();
        return y + shift;
    }

    if p == 0.0 {
        // Triple root.
        return shift;
    }

    // Three real roots (trigonometric form). The k = 0 branch has the
    // largest cosine argument and therefore the largest root.
    let m = 2.0 * (-p / 3.0).sqrt();
    let arg = (3.0 * q / (p * m)).clamp(-1.0, 1.0);
    m * (arg.acos() / 3.0).cos() + shift
}

#[cfg(test)]
mod tests {
    use super::{std_to_exponent, std_to_exponent_slice};

    // Reference values from the root set of x^3 + 7x^2 + (16-t)x + (12-t).
    const KNOWN_EXPONENTS: &[(f64, f64)] = &[
        (0.01, 96.99489782370983),
        (0.05, 16.97219860230345),
        (0.08, 9.452254965670825),
        (0.10, 6.937203937601806),
        (0.15, 3.557868774899467),
        (0.25, 0.7198239580007084),
        (0.288, 0.01393743611015319),
    ];

    #[test]
    fn matches_reference_roots() {
        for &(std, expected) in KNOWN_EXPONENTS {
            let exponent = std_to_exponent(std).expect("std is in range");
            assert!(
                (exponent - expected).abs() < 1e-9 * expected.max(1.0),
                "std={std}: got {exponent}, expected {expected}"
            );
        }
    }

    #[test]
    fn exponent_satisfies_defining_cubic() {
        for std in [0.02f64, 0.07, 0.13, 0.21, 0.27] {
            let t = std.powi(-2);
            let x = std_to_exponent(std).expect("std is in range");
            let residual = x.powi(3) + 7.0 * x.powi(2) + (16.0 - t) * x + (12.0 - t);
            assert!(residual.abs() < 1e-6 * t, "std={std}: residual {residual}");
        }
    }

    #[test]
    fn strictly_positive_and_monotonically_decreasing() {
        let mut previous = f64::INFINITY;
        let mut std = 0.005;
        while std < 0.289 {
            let exponent = std_to_exponent(std).expect("std is in range");
            assert!(exponent > 0.0, "std={std}: exponent {exponent} <= 0");
            assert!(
                exponent < previous,
                "std={std}: exponent {exponent} not decreasing (previous {previous})"
            );
            previous = exponent;
            std += 0.001;
        }
    }

    #[test]
    fn slice_maps_elementwise() {
        let exponents = std_to_exponent_slice(&[0.05, 0.10]).expect("stds are in range");
        assert_eq!(exponents.len(), 2);
        assert!((exponents[0] - 16.97219860230345).abs() < 1e-8);
        assert!((exponents[1] - 6.937203937601806).abs() < 1e-8);
    }

    #[test]
    fn out_of_range_std_rejected() {
        for std in [0.0, -0.1, 0.289, 1.0, f64::NAN] {
            assert!(std_to_exponent(std).is_err(), "std={std} should be rejected");
        }
    }
}
