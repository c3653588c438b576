// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::gp::{DEFAULT_ALPHA, GpKernel, GpSurrogate};
use pema_core::PemaError;

pub const DEFAULT_LOWER_BOUND: f64 = 0.01;
pub const DEFAULT_UPPER_BOUND: f64 = 0.25;
pub const DEFAULT_INIT_POINTS: usize = 3;
pub const DEFAULT_N_ITER: usize = 10;
pub const DEFAULT_KAPPA: f64 = 8.0;
pub const DEFAULT_GRID_SIZE: usize = 256;
pub const DEFAULT_SEED: u64 = 0x5eed;

/// Inclusive search interval on the std axis.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for SearchBounds {
    fn default() -> Self {
        Self {
            lower: DEFAULT_LOWER_BOUND,
            upper: DEFAULT_UPPER_BOUND,
        }
    }
}

impl SearchBounds {
    pub fn validate(&self) -> Result<(), PemaError> {
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return Err(PemaError::invalid_input(format!(
                "search bounds must be finite; got [{}, {}]",
                self.lower, self.upper
            )));
        }
        if self.lower >= self.upper {
            return Err(PemaError::invalid_input(format!(
                "search lower bound must be < upper bound; got [{}, {}]",
                self.lower, self.upper
            )));
        }
        Ok(())
    }

    fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Configuration for [`maximize`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SearchConfig {
    pub bounds: SearchBounds,
    pub init_points: usize,
    pub n_iter: usize,
    pub kappa: f64,
    pub alpha: f64,
    pub kernel: GpKernel,
    pub grid_size: usize,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            bounds: SearchBounds::default(),
            init_points: DEFAULT_INIT_POINTS,
            n_iter: DEFAULT_N_ITER,
            kappa: DEFAULT_KAPPA,
            alpha: DEFAULT_ALPHA,
            kernel: GpKernel::default(),
            grid_size: DEFAULT_GRID_SIZE,
            seed: DEFAULT_SEED,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), PemaError> {
        self.bounds.validate()?;
        self.kernel.validate()?;
        if self.init_points == 0 {
            return Err(PemaError::invalid_input(
                "SearchConfig.init_points must be >= 1; got 0",
            ));
        }
        if !self.kappa.is_finite() || self.kappa < 0.0 {
            return Err(PemaError::invalid_input(format!(
                "SearchConfig.kappa must be finite and >= 0; got {}",
                self.kappa
            )));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(PemaError::invalid_input(format!(
                "SearchConfig.alpha must be finite and > 0; got {}",
                self.alpha
            )));
        }
        if self.grid_size < 2 {
            return Err(PemaError::invalid_input(format!(
                "SearchConfig.grid_size must be >= 2; got {}",
                self.grid_size
            )));
        }
        Ok(())
    }
}

/// One completed objective evaluation.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub std: f64,
    pub score: f64,
}

/// Append-only record of every evaluation made by a search.
#[derive(Clone, Debug, Default)]
pub struct SearchState {
    observations: Vec<Observation>,
}

impl SearchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Highest-scoring observation; the earliest wins a tie.
    pub fn best(&self) -> Option<Observation> {
        let mut best: Option<Observation> = None;
        for &observation in &self.observations {
            let replace = match best {
                None => true,
                Some(current) => observation.score > current.score,
            };
            if replace {
                best = Some(observation);
            }
        }
        best
    }
}

/// Result of a completed search.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub best: Observation,
    pub history: Vec<Observation>,
}

// Splitmix64; deterministic across platforms.
struct StableRng {
    state: u64,
}

impl StableRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9e3779b97f4a7c15),
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform draw in [0, 1).
    fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Upper-confidence-bound acquisition: `mean + kappa * std`, maximized
/// over a uniform candidate grid with a lowest-candidate tie-break.
fn argmax_ucb(
    gp: &GpSurrogate,
    bounds: &SearchBounds,
    kappa: f64,
    grid_size: usize,
) -> Result<f64, PemaError> {
    let step = bounds.width() / (grid_size - 1) as f64;
    let mut best_candidate = bounds.lower;
    let mut best_value = f64::NEG_INFINITY;
    for idx in 0..grid_size {
        let candidate = if idx + 1 == grid_size {
            bounds.upper
        } else {
            bounds.lower + idx as f64 * step
        };
        let (mean, std) = gp.predict(candidate)?;
        let value = mean + kappa * std;
        if value > best_value {
            best_value = value;
            best_candidate = candidate;
        }
    }
    if !best_value.is_finite() {
        return Err(PemaError::numerical_issue(
            "acquisition maximization produced no finite value",
        ));
    }
    Ok(best_candidate)
}

/// Maximizes a black-box objective over the std interval: `init_points`
/// seeded uniform probes, then `n_iter` acquisition-guided evaluations.
/// Each step blocks on exactly one objective call; an objective error
/// aborts the whole search.
pub fn maximize<F>(mut objective: F, config: &SearchConfig) -> Result<SearchOutcome, PemaError>
where
    F: FnMut(f64) -> Result<f64, PemaError>,
{
    config.validate()?;

    let mut rng = StableRng::new(config.seed);
    let mut state = SearchState::new();

    for _ in 0..config.init_points {
        let std = config.bounds.lower + rng.next_unit() * config.bounds.width();
        let score = observe(&mut objective, std)?;
        state.push(Observation { std, score });
    }

    for _ in 0..config.n_iter {
        let xs: Vec<f64> = state.observations().iter().map(|obs| obs.std).collect();
        let ys: Vec<f64> = state.observations().iter().map(|obs| obs.score).collect();
        let gp = GpSurrogate::fit(
            config.kernel.clone(),
            config.alpha,
            xs.as_slice(),
            ys.as_slice(),
        )?;
        let std = argmax_ucb(&gp, &config.bounds, config.kappa, config.grid_size)?;
        let score = observe(&mut objective, std)?;
        state.push(Observation { std, score });
    }

    let best = state
        .best()
        .ok_or_else(|| PemaError::invalid_input("search completed without observations"))?;
    Ok(SearchOutcome {
        best,
        history: state.observations().to_vec(),
    })
}

fn observe<F>(objective: &mut F, std: f64) -> Result<f64, PemaError>
where
    F: FnMut(f64) -> Result<f64, PemaError>,
{
    let score = objective(std)?;
    if !score.is_finite() {
        return Err(PemaError::numerical_issue(format!(
            "objective returned non-finite score {score} at std {std}"
        )));
    }
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::{Observation, SearchConfig, SearchState, maximize};
    use pema_core::PemaError;

    fn unimodal(std: f64) -> Result<f64, PemaError> {
        // Smooth single peak at std = 0.12.
        let delta = std - 0.12;
        Ok(1.0 - 40.0 * delta * delta)
    }

    #[test]
    fn search_finds_unimodal_peak() {
        let config = SearchConfig {
            n_iter: 20,
            ..SearchConfig::default()
        };
        let outcome = maximize(unimodal, &config).expect("search should succeed");
        assert_eq!(outcome.history.len(), config.init_points + config.n_iter);
        assert!(
            (outcome.best.std - 0.12).abs() < 0.03,
            "best std {} should be near the peak",
            outcome.best.std
        );
    }

    #[test]
    fn search_is_deterministic_for_a_seed() {
        let config = SearchConfig::default();
        let first = maximize(unimodal, &config).expect("first run");
        let second = maximize(unimodal, &config).expect("second run");
        assert_eq!(first.history, second.history);
    }

    #[test]
    fn candidates_stay_within_bounds() {
        let config = SearchConfig::default();
        let outcome = maximize(unimodal, &config).expect("search should succeed");
        for observation in &outcome.history {
            assert!(
                (config.bounds.lower..=config.bounds.upper).contains(&observation.std),
                "std {} escaped the bounds",
                observation.std
            );
        }
    }

    #[test]
    fn objective_error_aborts_search() {
        let mut calls = 0usize;
        let objective = |_std: f64| -> Result<f64, PemaError> {
            calls += 1;
            if calls >= 2 {
                Err(PemaError::resource_limit("rollout backend unavailable"))
            } else {
                Ok(0.0)
            }
        };
        let err = maximize(objective, &SearchConfig::default())
            .expect_err("objective failure must abort");
        assert!(err.to_string().contains("rollout backend"), "{err}");
    }

    #[test]
    fn non_finite_score_rejected() {
        let err = maximize(|_| Ok(f64::NAN), &SearchConfig::default())
            .expect_err("NaN score must abort");
        assert!(err.to_string().contains("non-finite"), "{err}");
    }

    #[test]
    fn best_prefers_earliest_on_ties() {
        let mut state = SearchState::new();
        state.push(Observation {
            std: 0.05,
            score: 1.0,
        });
        state.push(Observation {
            std: 0.10,
            score: 1.0,
        });
        let best = state.best().expect("state has observations");
        assert_eq!(best.std, 0.05);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = SearchConfig {
            init_points: 0,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SearchConfig {
            grid_size: 1,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
