// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Numerical core of posthoc EMA reconstruction: the power-function
//! exponent model, the analytic cross-correlation between two EMA
//! averaging processes, and the linear solve that turns a sparse set of
//! source checkpoints into normalized reconstruction coefficients.

mod correlation;
mod exponent;
mod matrix;
mod posthoc;

pub use correlation::{correlation, correlation_matrix};
pub use exponent::{std_to_exponent, std_to_exponent_slice};
pub use matrix::Matrix;
pub use posthoc::{Coefficients, solve_posthoc_coefficients};
