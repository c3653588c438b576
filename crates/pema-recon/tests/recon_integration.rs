// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::{NullTracker, Tensor, TensorKind, TensorMap};
use pema_recon::{
    ConfigSnapshot, EmaConfigSnapshot, EvaluatorConfig, EvaluatorRegistry, PayloadCodec,
    ReconRunner, TaskConfigSnapshot, TrainingCheckpoint, save_checkpoint, scan_checkpoint_dir,
};
use pema_recon::{EmaState, RolloutEvaluator};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

fn unique_temp_dir(stem: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("{stem}-{}-{seq}", process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn model(param_value: f64, buffer_value: f64) -> TensorMap {
    TensorMap::new(vec![
        Tensor::new(
            "layer.weight",
            TensorKind::Parameter,
            vec![2, 2],
            vec![param_value; 4],
        )
        .expect("parameter tensor should be valid"),
        Tensor::new(
            "norm.running_mean",
            TensorKind::Buffer,
            vec![2],
            vec![buffer_value; 2],
        )
        .expect("buffer tensor should be valid"),
    ])
    .expect("tensor map should be valid")
}

fn checkpoint(step: u64, stds: &[f64], values: &[f64], buffer_value: f64) -> TrainingCheckpoint {
    assert_eq!(stds.len(), values.len());
    TrainingCheckpoint {
        global_step: step,
        config: ConfigSnapshot {
            ema: EmaConfigSnapshot {
                stds: stds.to_vec(),
            },
            task: TaskConfigSnapshot {
                evaluator: EvaluatorConfig {
                    tag: "constant".to_string(),
                    options: serde_json::json!({ "score": 0.75 }),
                },
            },
        },
        model: model(buffer_value, buffer_value),
        ema: EmaState {
            stds: stds.to_vec(),
            variants: values
                .iter()
                .map(|&value| model(value, buffer_value))
                .collect(),
        },
    }
}

/// Evaluator that reports the mean parameter value of the policy it is
/// handed, so the test can observe the reconstructed weights directly.
struct ParamMeanEvaluator;

impl RolloutEvaluator for ParamMeanEvaluator {
    fn run(&mut self, policy: &TensorMap) -> Result<BTreeMap<String, f64>, pema_core::PemaError> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for tensor in policy.parameters() {
            sum += tensor.data.iter().sum::<f64>();
            count += tensor.data.len();
        }
        let mut metrics = BTreeMap::new();
        metrics.insert(
            pema_recon::MEAN_SCORE_METRIC.to_string(),
            sum / count as f64,
        );
        Ok(metrics)
    }
}

/// Three sources: (step 100, std 0.05) = 1.0, (step 100, std 0.15) = 2.0,
/// (step 500, std 0.10) = 3.0, target (step 500, std 0.08). The solved
/// weights put essentially all mass on the third source, so the
/// reconstructed parameters land just above 3.
#[test]
fn reconstruction_matches_solved_weighted_sum() {
    let dir = unique_temp_dir("pema-recon-weighted");
    save_checkpoint(
        dir.join("epoch_0100.ckpt").as_path(),
        &checkpoint(100, &[0.05, 0.15], &[1.0, 2.0], 10.0),
        PayloadCodec::Bincode,
    )
    .expect("epoch checkpoint save");
    save_checkpoint(
        dir.join("latest.ckpt").as_path(),
        &checkpoint(500, &[0.10], &[3.0], 10.0),
        PayloadCodec::Bincode,
    )
    .expect("latest checkpoint save");

    let scan = scan_checkpoint_dir(dir.as_path()).expect("scan should succeed");
    assert_eq!(scan.latest_step, 500);
    assert_eq!(scan.records.len(), 3);

    let mut runner = ReconRunner::new(
        dir.as_path(),
        scan,
        Box::new(ParamMeanEvaluator),
        Box::new(NullTracker),
    )
    .expect("runner construction should succeed");

    let score = runner.evaluate(0.08).expect("evaluation should succeed");
    // Reference combination of [1.0, 2.0, 3.0] under the solved
    // affine weights for this scenario.
    let expected = 3.000003837891492;
    assert!(
        (score - expected).abs() < 1e-6,
        "score {score} vs expected {expected}"
    );

    // Buffers come from the live reference model, not the accumulation.
    let variant = runner
        .holder()
        .variant_for_std(0.08)
        .expect("installed variant should resolve");
    let buffer = variant
        .buffers()
        .next()
        .expect("variant should carry the buffer tensor");
    assert_eq!(buffer.data, vec![10.0; 2]);

    let _ = std::fs::remove_dir_all(&dir);
}

/// A target std already covered at the latest step reconstructs that
/// variant exactly (unit coefficient on the matching source).
#[test]
fn exact_std_match_reproduces_stored_variant() {
    let dir = unique_temp_dir("pema-recon-exact");
    save_checkpoint(
        dir.join("epoch_0100.ckpt").as_path(),
        &checkpoint(100, &[0.05], &[1.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("epoch checkpoint save");
    save_checkpoint(
        dir.join("latest.ckpt").as_path(),
        &checkpoint(500, &[0.10], &[3.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("latest checkpoint save");

    let scan = scan_checkpoint_dir(dir.as_path()).expect("scan should succeed");
    let mut runner = ReconRunner::new(
        dir.as_path(),
        scan,
        Box::new(ParamMeanEvaluator),
        Box::new(NullTracker),
    )
    .expect("runner construction should succeed");

    let score = runner.evaluate(0.10).expect("evaluation should succeed");
    assert!((score - 3.0).abs() < 1e-9, "score {score}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn evaluator_resolved_from_latest_config() {
    let dir = unique_temp_dir("pema-recon-registry");
    save_checkpoint(
        dir.join("latest.ckpt").as_path(),
        &checkpoint(500, &[0.10], &[3.0], 0.0),
        PayloadCodec::Json,
    )
    .expect("latest checkpoint save");

    let registry = EvaluatorRegistry::with_builtins();
    let mut runner =
        ReconRunner::from_checkpoint_dir(dir.as_path(), &registry, Box::new(NullTracker))
            .expect("runner construction should succeed");

    // The constant evaluator configured in the snapshot always reports 0.75.
    let score = runner.evaluate(0.10).expect("evaluation should succeed");
    assert!((score - 0.75).abs() < 1e-12, "score {score}");

    let _ = std::fs::remove_dir_all(&dir);
}

/// A source record whose checkpoint no longer covers the recorded std
/// (the file changed between scan and load) is a state-consistency
/// failure and must abort the reconstruction.
#[test]
fn checkpoint_missing_recorded_std_is_fatal() {
    let dir = unique_temp_dir("pema-recon-stdgap");
    save_checkpoint(
        dir.join("epoch_0100.ckpt").as_path(),
        &checkpoint(100, &[0.05], &[1.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("epoch checkpoint save");
    save_checkpoint(
        dir.join("latest.ckpt").as_path(),
        &checkpoint(500, &[0.10], &[3.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("latest checkpoint save");

    let scan = scan_checkpoint_dir(dir.as_path()).expect("scan should succeed");
    let mut runner = ReconRunner::new(
        dir.as_path(),
        scan,
        Box::new(ParamMeanEvaluator),
        Box::new(NullTracker),
    )
    .expect("runner construction should succeed");

    // The epoch checkpoint is rewritten with a different std list after
    // the scan recorded (100, 0.05).
    save_checkpoint(
        dir.join("epoch_0100.ckpt").as_path(),
        &checkpoint(100, &[0.15], &[1.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("epoch checkpoint rewrite");

    let err = runner
        .evaluate(0.08)
        .expect_err("missing recorded std must be fatal");
    assert!(err.to_string().contains("does not cover std"), "{err}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_checkpoint_file_is_fatal() {
    let dir = unique_temp_dir("pema-recon-missing");
    save_checkpoint(
        dir.join("latest.ckpt").as_path(),
        &checkpoint(500, &[0.10], &[3.0], 0.0),
        PayloadCodec::Bincode,
    )
    .expect("latest checkpoint save");

    let mut scan = scan_checkpoint_dir(dir.as_path()).expect("scan should succeed");
    // Point a record at a file that no longer exists.
    scan.records.push(pema_recon::CheckpointRecord {
        step: 100,
        std: 0.05,
        file: "epoch_0100.ckpt".to_string(),
    });
    scan.records.sort_by(|a, b| {
        a.step
            .cmp(&b.step)
            .then_with(|| a.std.total_cmp(&b.std))
    });

    let mut runner = ReconRunner::new(
        dir.as_path(),
        scan,
        Box::new(ParamMeanEvaluator),
        Box::new(NullTracker),
    )
    .expect("runner construction should succeed");

    let err = runner
        .evaluate(0.08)
        .expect_err("missing checkpoint file must be fatal");
    assert!(err.to_string().contains("failed reading checkpoint"), "{err}");

    let _ = std::fs::remove_dir_all(&dir);
}
