// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::PemaError;

pub const DEFAULT_LENGTH_SCALE: f64 = 0.05;
pub const DEFAULT_VARIANCE: f64 = 1.0;
pub const DEFAULT_ALPHA: f64 = 1.0e-3;

const CHOLESKY_ATTEMPTS: usize = 6;

/// Kernel family for the GP surrogate over the std axis.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum GpKernel {
    /// Squared-exponential kernel.
    Rbf { length_scale: f64, variance: f64 },
    /// Matern 3/2 kernel.
    Matern32 { length_scale: f64, variance: f64 },
}

impl Default for GpKernel {
    fn default() -> Self {
        Self::Rbf {
            length_scale: DEFAULT_LENGTH_SCALE,
            variance: DEFAULT_VARIANCE,
        }
    }
}

impl GpKernel {
    pub fn validate(&self) -> Result<(), PemaError> {
        let (length_scale, variance) = match self {
            Self::Rbf {
                length_scale,
                variance,
            }
            | Self::Matern32 {
                length_scale,
                variance,
            } => (*length_scale, *variance),
        };

        if !length_scale.is_finite() || length_scale <= 0.0 {
            return Err(PemaError::invalid_input(format!(
                "GP kernel length_scale must be finite and > 0; got {length_scale}"
            )));
        }
        if !variance.is_finite() || variance <= 0.0 {
            return Err(PemaError::invalid_input(format!(
                "GP kernel variance must be finite and > 0; got {variance}"
            )));
        }
        Ok(())
    }

    fn covariance(&self, distance: f64) -> f64 {
        let x = distance.abs();
        match self {
            Self::Rbf {
                length_scale,
                variance,
            } => {
                let z = x / *length_scale;
                *variance * (-0.5 * z * z).exp()
            }
            Self::Matern32 {
                length_scale,
                variance,
            } => {
                let root3 = 3.0_f64.sqrt();
                let z = root3 * x / *length_scale;
                *variance * (1.0 + z) * (-z).exp()
            }
        }
    }

    fn prior_variance(&self) -> f64 {
        match self {
            Self::Rbf { variance, .. } | Self::Matern32 { variance, .. } => *variance,
        }
    }
}

/// Gaussian-process surrogate fitted on scalar (input, target) pairs.
///
/// Targets are mean-centered before the fit; the posterior at a query point
/// is the usual `(mean, std)` pair under observation noise `alpha`.
#[derive(Clone, Debug)]
pub struct GpSurrogate {
    kernel: GpKernel,
    alpha: f64,
    xs: Vec<f64>,
    y_mean: f64,
    /// Lower-triangular Cholesky factor of K + alpha*I, row-major.
    chol: Vec<f64>,
    /// (K + alpha*I)^-1 (y - y_mean).
    weights: Vec<f64>,
}

impl GpSurrogate {
    /// Fits the surrogate, retrying the Cholesky factorization with
    /// escalating diagonal jitter when the covariance is numerically
    /// indefinite.
    pub fn fit(kernel: GpKernel, alpha: f64, xs: &[f64], ys: &[f64]) -> Result<Self, PemaError> {
        kernel.validate()?;
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(PemaError::invalid_input(format!(
                "GP observation noise alpha must be finite and > 0; got {alpha}"
            )));
        }
        if xs.is_empty() {
            return Err(PemaError::invalid_input(
                "GP fit requires at least one observation",
            ));
        }
        if xs.len() != ys.len() {
            return Err(PemaError::invalid_input(format!(
                "GP fit input/target length mismatch: {} inputs, {} targets",
                xs.len(),
                ys.len()
            )));
        }
        for &value in xs.iter().chain(ys.iter()) {
            if !value.is_finite() {
                return Err(PemaError::numerical_issue(format!(
                    "GP fit requires finite observations; got {value}"
                )));
            }
        }

        let n = xs.len();
        let y_mean = ys.iter().sum::<f64>() / n as f64;
        let centered: Vec<f64> = ys.iter().map(|&y| y - y_mean).collect();

        let mut base = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut cov = kernel.covariance(xs[i] - xs[j]);
                if i == j {
                    cov += alpha;
                }
                base[i * n + j] = cov;
                base[j * n + i] = cov;
            }
        }

        let mut jitter = 0.0;
        let base_jitter = (alpha * 1.0e-6).max(1.0e-10);
        for _attempt in 0..CHOLESKY_ATTEMPTS {
            let mut cov = base.clone();
            if jitter > 0.0 {
                for i in 0..n {
                    cov[i * n + i] += jitter;
                }
            }
            if cholesky_in_place(cov.as_mut_slice(), n).is_ok() {
                let weights = cholesky_solve(cov.as_slice(), centered.as_slice(), n);
                return Ok(Self {
                    kernel,
                    alpha,
                    xs: xs.to_vec(),
                    y_mean,
                    chol: cov,
                    weights,
                });
            }
            jitter = if jitter == 0.0 {
                base_jitter
            } else {
                jitter * 10.0
            };
        }

        Err(PemaError::numerical_issue(format!(
            "failed GP Cholesky decomposition on {n} observations even after jitter retries"
        )))
    }

    pub fn n_observations(&self) -> usize {
        self.xs.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Posterior `(mean, std)` at a query point.
    pub fn predict(&self, x: f64) -> Result<(f64, f64), PemaError> {
        if !x.is_finite() {
            return Err(PemaError::invalid_input(format!(
                "GP prediction point must be finite; got {x}"
            )));
        }
        let n = self.xs.len();
        let k_star: Vec<f64> = self
            .xs
            .iter()
            .map(|&x_i| self.kernel.covariance(x - x_i))
            .collect();

        let mean = self.y_mean
            + k_star
                .iter()
                .zip(self.weights.iter())
                .map(|(lhs, rhs)| lhs * rhs)
                .sum::<f64>();

        // v = L^-1 k*, so var = k(x,x) - v^T v.
        let mut v = vec![0.0; n];
        for i in 0..n {
            let mut sum = k_star[i];
            for k in 0..i {
                sum -= self.chol[i * n + k] * v[k];
            }
            v[i] = sum / self.chol[i * n + i];
        }
        let explained = v.iter().map(|value| value * value).sum::<f64>();
        // Latent-function variance: alpha enters the fit covariance only,
        // not the query.
        let variance = (self.kernel.prior_variance() - explained).max(0.0);

        if !mean.is_finite() || !variance.is_finite() {
            return Err(PemaError::numerical_issue(
                "non-finite GP posterior prediction",
            ));
        }
        Ok((mean, variance.sqrt()))
    }
}

fn cholesky_in_place(matrix: &mut [f64], n: usize) -> Result<(), PemaError> {
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i * n + j];
            for k in 0..j {
                sum -= matrix[i * n + k] * matrix[j * n + k];
            }

            if i == j {
                if !sum.is_finite() || sum <= 0.0 {
                    return Err(PemaError::numerical_issue(
                        "covariance is not positive definite",
                    ));
                }
                matrix[i * n + i] = sum.sqrt();
            } else {
                matrix[i * n + j] = sum / matrix[j * n + j];
            }
        }

        for j in i + 1..n {
            matrix[i * n + j] = 0.0;
        }
    }
    Ok(())
}

/// Solves (L L^T) x = rhs given the lower Cholesky factor.
fn cholesky_solve(chol: &[f64], rhs: &[f64], n: usize) -> Vec<f64> {
    let mut z = vec![0.0; n];
    for i in 0..n {
        let mut sum = rhs[i];
        for k in 0..i {
            sum -= chol[i * n + k] * z[k];
        }
        z[i] = sum / chol[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in i + 1..n {
            sum -= chol[k * n + i] * x[k];
        }
        x[i] = sum / chol[i * n + i];
    }
    x
}
