// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Core shared types for the pema workspace: the workspace error type,
//! relative-standard-deviation grids, EMA profiles, model tensor
//! containers and the experiment tracker seam.

mod error;
mod profile;
mod stds;
mod tensor;
mod tracker;

pub use error::PemaError;
pub use profile::EmaProfile;
pub use stds::{
    ELLIPSIS_TOLERANCE, STD_LOWER_BOUND, STD_UPPER_BOUND, StdSpec, StdToken, expand_ellipsis,
};
pub use tensor::{ModelTensors, Tensor, TensorKind, TensorMap, accumulate_scaled};
pub use tracker::{ExperimentTracker, JsonlTracker, NullTracker};
