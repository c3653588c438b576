// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::{PemaError, STD_LOWER_BOUND, STD_UPPER_BOUND, TensorMap};
use serde::{Deserialize, Serialize};

/// Persisted EMA state: one averaged model variant per relative standard
/// deviation, in std-list order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub stds: Vec<f64>,
    pub variants: Vec<TensorMap>,
}

impl EmaState {
    pub fn validate(&self) -> Result<(), PemaError> {
        if self.stds.is_empty() {
            return Err(PemaError::invalid_input(
                "EMA state must cover at least one std",
            ));
        }
        if self.stds.len() != self.variants.len() {
            return Err(PemaError::invalid_input(format!(
                "EMA state std/variant count mismatch: {} stds, {} variants",
                self.stds.len(),
                self.variants.len()
            )));
        }
        for &std in &self.stds {
            if !std.is_finite() || std <= STD_LOWER_BOUND || std >= STD_UPPER_BOUND {
                return Err(PemaError::invalid_input(format!(
                    "EMA state std must be in ({STD_LOWER_BOUND}, {STD_UPPER_BOUND}); got {std}"
                )));
            }
        }
        for variant in &self.variants {
            variant.validate()?;
        }
        Ok(())
    }
}

/// Holds the live EMA state and resolves averaged-model variants by
/// position or by exact std value.
#[derive(Clone, Debug, Default)]
pub struct EmaHolder {
    state: Option<EmaState>,
}

impl EmaHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_state(&mut self, state: EmaState) -> Result<(), PemaError> {
        state.validate()?;
        self.state = Some(state);
        Ok(())
    }

    pub fn stds(&self) -> Result<&[f64], PemaError> {
        Ok(self.state()?.stds.as_slice())
    }

    pub fn variants(&self) -> Result<&[TensorMap], PemaError> {
        Ok(self.state()?.variants.as_slice())
    }

    pub fn variant(&self, idx: usize) -> Result<&TensorMap, PemaError> {
        let state = self.state()?;
        state.variants.get(idx).ok_or_else(|| {
            PemaError::invalid_input(format!(
                "EMA variant index {idx} out of range (holder covers {} stds)",
                state.stds.len()
            ))
        })
    }

    pub fn variant_mut(&mut self, idx: usize) -> Result<&mut TensorMap, PemaError> {
        let state = self.state.as_mut().ok_or_else(empty_holder_error)?;
        let count = state.stds.len();
        state.variants.get_mut(idx).ok_or_else(|| {
            PemaError::invalid_input(format!(
                "EMA variant index {idx} out of range (holder covers {count} stds)"
            ))
        })
    }

    /// Resolves the variant accumulated at exactly `std`. Absence is a
    /// state-consistency failure, not a retryable condition.
    pub fn variant_for_std(&self, std: f64) -> Result<&TensorMap, PemaError> {
        let state = self.state()?;
        let idx = state
            .stds
            .iter()
            .position(|&value| value == std)
            .ok_or_else(|| {
                PemaError::invalid_input(format!(
                    "std {std} is not present in the EMA holder's std list {:?}",
                    state.stds
                ))
            })?;
        Ok(&state.variants[idx])
    }

    fn state(&self) -> Result<&EmaState, PemaError> {
        self.state.as_ref().ok_or_else(empty_holder_error)
    }
}

fn empty_holder_error() -> PemaError {
    PemaError::invalid_input("EMA holder has no loaded state")
}
