// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::PemaError;
use crate::stds::{STD_LOWER_BOUND, STD_UPPER_BOUND};

/// One power-function EMA averaging process: a positive time coordinate
/// (the training step the profile is anchored at) and a relative standard
/// deviation controlling the width of the averaging kernel.
///
/// The std range keeps the derived power-function exponent strictly
/// positive, which the correlation integrals require to converge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmaProfile {
    offset: f64,
    std: f64,
}

impl EmaProfile {
    pub fn new(offset: f64, std: f64) -> Result<Self, PemaError> {
        if !offset.is_finite() || offset <= 0.0 {
            return Err(PemaError::invalid_input(format!(
                "EMA profile offset must be finite and > 0; got {offset}"
            )));
        }
        if !std.is_finite() || std <= STD_LOWER_BOUND || std >= STD_UPPER_BOUND {
            return Err(PemaError::invalid_input(format!(
                "EMA profile std must be in ({STD_LOWER_BOUND}, {STD_UPPER_BOUND}); got {std}"
            )));
        }
        Ok(Self { offset, std })
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn std(&self) -> f64 {
        self.std
    }
}

#[cfg(test)]
mod tests {
    use super::EmaProfile;

    #[test]
    fn valid_profile_constructs() {
        let profile = EmaProfile::new(500.0, 0.08).expect("profile should be valid");
        assert_eq!(profile.offset(), 500.0);
        assert_eq!(profile.std(), 0.08);
    }

    #[test]
    fn non_positive_offset_rejected() {
        assert!(EmaProfile::new(0.0, 0.08).is_err());
        assert!(EmaProfile::new(-10.0, 0.08).is_err());
        assert!(EmaProfile::new(f64::NAN, 0.08).is_err());
    }

    #[test]
    fn out_of_range_std_rejected() {
        assert!(EmaProfile::new(100.0, 0.0).is_err());
        assert!(EmaProfile::new(100.0, 0.289).is_err());
        assert!(EmaProfile::new(100.0, 0.4).is_err());
    }
}
