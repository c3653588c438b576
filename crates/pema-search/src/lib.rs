// SPDX-License-Identifier: MIT OR Apache-2.0

//! Black-box search over the EMA std axis: a Gaussian-process surrogate
//! with an upper-confidence-bound acquisition, driven one blocking
//! objective evaluation at a time.

#![forbid(unsafe_code)]

pub mod gp;
pub mod search;

pub use gp::{DEFAULT_ALPHA, GpKernel, GpSurrogate};
pub use search::{
    DEFAULT_GRID_SIZE, DEFAULT_INIT_POINTS, DEFAULT_KAPPA, DEFAULT_N_ITER, DEFAULT_SEED,
    Observation, SearchBounds, SearchConfig, SearchOutcome, SearchState, maximize,
};
