// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::PemaError;

/// Exclusive lower bound for relative standard deviations.
pub const STD_LOWER_BOUND: f64 = 0.0;
/// Exclusive upper bound for relative standard deviations.
///
/// The power-function exponent crosses zero at 1/sqrt(12) ~= 0.2887; above
/// that the correlation integrals no longer converge.
pub const STD_UPPER_BOUND: f64 = 0.289;
/// Tolerance on the implied point count of an ellipsis expansion.
pub const ELLIPSIS_TOLERANCE: f64 = 1e-4;

const ELLIPSIS_TOKEN: &str = "...";

/// Ordered, deduplicated set of relative standard deviations in
/// (0, 0.289). Built once from user input and immutable afterward.
#[derive(Clone, Debug, PartialEq)]
pub struct StdSpec {
    values: Vec<f64>,
}

impl StdSpec {
    /// Parses a comma-separated std list, expanding `a,b,...,c` ellipsis
    /// shorthand into the evenly spaced arithmetic progression it implies.
    pub fn parse(raw: &str) -> Result<Self, PemaError> {
        let tokens = raw
            .split(',')
            .map(|token| parse_token(token.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        let expanded = expand_ellipsis(tokens.as_slice())?;
        Self::from_values(expanded)
    }

    /// Validates an already-expanded value list. Sorting and deduplication
    /// make this idempotent: feeding a spec's own values back reproduces it.
    pub fn from_values(values: impl Into<Vec<f64>>) -> Result<Self, PemaError> {
        let mut values = values.into();
        if values.is_empty() {
            return Err(PemaError::invalid_input(
                "std list must contain at least one value",
            ));
        }
        for &value in &values {
            if !value.is_finite() || value <= STD_LOWER_BOUND || value >= STD_UPPER_BOUND {
                return Err(PemaError::invalid_input(format!(
                    "relative standard deviation must be positive and less than {STD_UPPER_BOUND}; got {value}"
                )));
            }
        }
        values.sort_by(f64::total_cmp);
        values.dedup();
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        self.values.as_slice()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, std: f64) -> bool {
        self.values.iter().any(|&value| value == std)
    }
}

/// One raw token of a std list: a literal float or the ellipsis marker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StdToken {
    Literal(f64),
    Ellipsis,
}

fn parse_token(token: &str) -> Result<StdToken, PemaError> {
    if token == ELLIPSIS_TOKEN {
        return Ok(StdToken::Ellipsis);
    }
    token
        .parse::<f64>()
        .map(StdToken::Literal)
        .map_err(|_| PemaError::invalid_input(format!("invalid std token '{token}'")))
}

/// Expands ellipsis tokens into explicit arithmetic progressions.
///
/// `a,b,...,c` stands for a whole number of additional steps of size `b - a`
/// such that continuing the progression lands exactly on `c`. Range
/// validation happens later, in [`StdSpec::from_values`].
pub fn expand_ellipsis(tokens: &[StdToken]) -> Result<Vec<f64>, PemaError> {
    let mut out = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        if let StdToken::Literal(value) = token {
            out.push(*value);
            continue;
        }

        let (prev2, prev1) = match (i.checked_sub(2), i.checked_sub(1)) {
            (Some(a), Some(b)) => match (tokens[a], tokens[b]) {
                (StdToken::Literal(prev2), StdToken::Literal(prev1)) => (prev2, prev1),
                _ => {
                    return Err(PemaError::invalid_input(
                        "'...' must be preceded by at least two floats",
                    ));
                }
            },
            _ => {
                return Err(PemaError::invalid_input(
                    "'...' must be preceded by at least two floats",
                ));
            }
        };
        let next = match tokens.get(i + 1) {
            Some(StdToken::Literal(next)) => *next,
            _ => {
                return Err(PemaError::invalid_input(
                    "'...' must be followed by at least one float",
                ));
            }
        };
        if prev2 == prev1 {
            return Err(PemaError::invalid_input(
                "the floats preceding '...' must not be equal",
            ));
        }

        let step = prev1 - prev2;
        let approx_count = (next - prev1) / step - 1.0;
        let count = approx_count.round();
        if count <= 0.0 {
            return Err(PemaError::invalid_input(
                "'...' must correspond to a non-empty interval",
            ));
        }
        if (count - approx_count).abs() > ELLIPSIS_TOLERANCE {
            return Err(PemaError::invalid_input(
                "'...' must correspond to an evenly spaced interval",
            ));
        }
        for j in 0..count as usize {
            out.push(prev1 + step * (j + 1) as f64);
        }
    }
    Ok(out)
}
