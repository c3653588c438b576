// SPDX-License-Identifier: MIT OR Apache-2.0

//! Posthoc EMA reconstruction: checkpoint scanning and persistence, the
//! EMA state holder, rollout evaluation and the reconstruction runner.

#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod evaluator;
pub mod holder;
pub mod runner;

pub use checkpoint::{
    CheckpointEnvelope, CheckpointRecord, CheckpointScan, ConfigSnapshot, EmaConfigSnapshot,
    LATEST_CHECKPOINT_FILE, PayloadCodec, TaskConfigSnapshot, TrainingCheckpoint, load_checkpoint,
    load_envelope, parse_epoch_file_name, save_checkpoint, scan_checkpoint_dir,
};
pub use evaluator::{
    CommandEvaluator, ConstantEvaluator, EvaluatorConfig, EvaluatorRegistry, MEAN_SCORE_METRIC,
    RolloutEvaluator,
};
pub use holder::{EmaHolder, EmaState};
pub use runner::{METRIC_SERIES_PREFIX, ReconRunner, STD_STEP_METRIC};
