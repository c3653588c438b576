// SPDX-License-Identifier: MIT OR Apache-2.0

//! Benchmark-only crate; see `benches/`.

#![forbid(unsafe_code)]
