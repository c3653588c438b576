// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::checkpoint::{CheckpointRecord, CheckpointScan, load_checkpoint, scan_checkpoint_dir};
use crate::evaluator::{EvaluatorRegistry, MEAN_SCORE_METRIC, RolloutEvaluator};
use crate::holder::{EmaHolder, EmaState};
use pema_core::{EmaProfile, ExperimentTracker, PemaError, TensorMap, accumulate_scaled};
use pema_solve::solve_posthoc_coefficients;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Metric series prefix used for every reconstruction evaluation batch.
pub const METRIC_SERIES_PREFIX: &str = "ema/";
/// Step metric the `ema/` series is indexed by.
pub const STD_STEP_METRIC: &str = "std";

/// Drives one full posthoc reconstruction per candidate std: solve
/// coefficients against every recorded checkpoint snapshot, accumulate the
/// weighted combination, install it into the holder and score it with the
/// rollout evaluator.
pub struct ReconRunner {
    records: Vec<CheckpointRecord>,
    latest_step: u64,
    checkpoint_dir: PathBuf,
    reference_model: TensorMap,
    holder: EmaHolder,
    evaluator: Box<dyn RolloutEvaluator>,
    tracker: Box<dyn ExperimentTracker>,
}

impl ReconRunner {
    /// Builds a runner from a checkpoint directory, resolving the rollout
    /// evaluator from the latest checkpoint's configuration snapshot.
    pub fn from_checkpoint_dir(
        checkpoint_dir: &Path,
        registry: &EvaluatorRegistry,
        tracker: Box<dyn ExperimentTracker>,
    ) -> Result<Self, PemaError> {
        let scan = scan_checkpoint_dir(checkpoint_dir)?;
        let evaluator = registry.build(&scan.latest_config.task.evaluator)?;
        Self::new(checkpoint_dir, scan, evaluator, tracker)
    }

    pub fn new(
        checkpoint_dir: &Path,
        scan: CheckpointScan,
        evaluator: Box<dyn RolloutEvaluator>,
        mut tracker: Box<dyn ExperimentTracker>,
    ) -> Result<Self, PemaError> {
        if scan.records.is_empty() {
            return Err(PemaError::invalid_input(
                "checkpoint scan produced no source records",
            ));
        }
        let latest = load_checkpoint(
            checkpoint_dir
                .join(crate::checkpoint::LATEST_CHECKPOINT_FILE)
                .as_path(),
        )?;
        tracker.define_step_metric(METRIC_SERIES_PREFIX, STD_STEP_METRIC)?;
        Ok(Self {
            records: scan.records,
            latest_step: scan.latest_step,
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            reference_model: latest.model,
            holder: EmaHolder::new(),
            evaluator,
            tracker,
        })
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn latest_step(&self) -> u64 {
        self.latest_step
    }

    pub fn holder(&self) -> &EmaHolder {
        &self.holder
    }

    /// Reconstructs the EMA variant for `target_std` and returns its
    /// rollout score (`test/mean_score`). Every failure is fatal; there is
    /// no retry or partial-result path.
    pub fn evaluate(&mut self, target_std: f64) -> Result<f64, PemaError> {
        self.reconstruct(target_std)?;

        let policy = self.holder.variant_for_std(target_std)?;
        let raw_metrics = self.evaluator.run(policy)?;

        let mut batch = BTreeMap::new();
        for (key, value) in &raw_metrics {
            let normalized = format!("{METRIC_SERIES_PREFIX}{}", key.replace('/', "_"));
            batch.insert(normalized, *value);
        }
        batch.insert(STD_STEP_METRIC.to_string(), target_std);
        self.tracker.log(&batch)?;

        raw_metrics.get(MEAN_SCORE_METRIC).copied().ok_or_else(|| {
            PemaError::invalid_input(format!(
                "evaluator metrics lack required '{MEAN_SCORE_METRIC}' (got keys {:?})",
                raw_metrics.keys().collect::<Vec<_>>()
            ))
        })
    }

    /// Solves the posthoc coefficients for `target_std` and accumulates the
    /// weighted combination into the holder, loading one checkpoint at a
    /// time so peak memory stays at one payload plus the accumulator.
    pub fn reconstruct(&mut self, target_std: f64) -> Result<(), PemaError> {
        let target = EmaProfile::new(self.latest_step as f64, target_std)?;
        let sources = self
            .records
            .iter()
            .map(|record| EmaProfile::new(record.step as f64, record.std))
            .collect::<Result<Vec<_>, _>>()?;
        let coefficients = solve_posthoc_coefficients(sources.as_slice(), &[target])?;
        let weights = coefficients.for_target(0);

        let mut accumulator = self.reference_model.zeros_like();
        for (record, &coefficient) in self.records.iter().zip(weights.iter()) {
            if coefficient == 0.0 {
                continue;
            }
            let checkpoint =
                load_checkpoint(self.checkpoint_dir.join(record.file.as_str()).as_path())?;
            let variant_idx = checkpoint
                .config
                .ema
                .stds
                .iter()
                .position(|&std| std == record.std)
                .ok_or_else(|| {
                    PemaError::invalid_input(format!(
                        "checkpoint '{}' does not cover std {} (stds: {:?})",
                        record.file, record.std, checkpoint.config.ema.stds
                    ))
                })?;
            accumulate_scaled(
                &mut accumulator,
                &checkpoint.ema.variants[variant_idx],
                coefficient,
            )?;
        }

        // Downstream storage expects the two-slot layout, so the
        // reconstruction fills both with the same variant.
        self.holder.load_state(EmaState {
            stds: vec![target_std; 2],
            variants: vec![accumulator.clone(), accumulator],
        })?;
        let installed = self.holder.variant_mut(0)?;
        installed.copy_buffers_from(&self.reference_model)?;
        Ok(())
    }
}
