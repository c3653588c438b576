// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::evaluator::EvaluatorConfig;
use crate::holder::EmaState;
use pema_core::{PemaError, StdSpec, TensorMap};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current checkpoint payload schema version emitted by writers.
pub const CURRENT_CHECKPOINT_SCHEMA_VERSION: u32 = 1;
/// Minimum checkpoint payload schema version accepted by readers.
pub const MIN_SUPPORTED_CHECKPOINT_SCHEMA_VERSION: u32 = 1;
/// File name of the synthetic most-recent checkpoint.
pub const LATEST_CHECKPOINT_FILE: &str = "latest.ckpt";

const EPOCH_FILE_PREFIX: &str = "epoch_";
const CHECKPOINT_FILE_SUFFIX: &str = ".ckpt";

/// Supported codec for checkpoint payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCodec {
    Json,
    Bincode,
}

/// Serialized envelope wrapping a [`TrainingCheckpoint`] payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub state_schema_version: u32,
    pub engine_fingerprint: String,
    pub created_at_ns: i64,
    pub payload_crc32: u32,
    pub payload_codec: PayloadCodec,
    pub payload: Vec<u8>,
}

impl CheckpointEnvelope {
    fn validate_metadata(&self) -> Result<(), PemaError> {
        if self.engine_fingerprint.trim().is_empty() {
            return Err(PemaError::invalid_input(
                "checkpoint engine_fingerprint must be non-empty",
            ));
        }
        if self.created_at_ns < 0 {
            return Err(PemaError::invalid_input(format!(
                "checkpoint created_at_ns must be >= 0; got {}",
                self.created_at_ns
            )));
        }
        validate_checkpoint_schema_version(self.state_schema_version)
    }

    fn verify_payload_crc32(&self) -> Result<(), PemaError> {
        let observed = crc32fast::hash(&self.payload);
        if observed != self.payload_crc32 {
            return Err(PemaError::invalid_input(format!(
                "checkpoint payload crc32 mismatch: expected=0x{:08x}, observed=0x{:08x}",
                self.payload_crc32, observed
            )));
        }
        Ok(())
    }
}

/// EMA-specific slice of the run configuration snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmaConfigSnapshot {
    /// Exactly the std values this checkpoint's EMA buffers cover.
    pub stds: Vec<f64>,
}

/// Task-specific slice of the run configuration snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfigSnapshot {
    pub evaluator: EvaluatorConfig,
}

/// Configuration snapshot stored alongside the model state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub ema: EmaConfigSnapshot,
    pub task: TaskConfigSnapshot,
}

/// Full checkpoint payload: step counter, configuration snapshot, the raw
/// training model and the accumulated EMA state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    pub global_step: u64,
    pub config: ConfigSnapshot,
    pub model: TensorMap,
    pub ema: EmaState,
}

impl TrainingCheckpoint {
    pub fn validate(&self) -> Result<(), PemaError> {
        StdSpec::from_values(self.config.ema.stds.clone())?;
        self.model.validate()?;
        self.ema.validate()?;
        if self.config.ema.stds != self.ema.stds {
            return Err(PemaError::invalid_input(format!(
                "checkpoint config stds {:?} disagree with stored EMA stds {:?}",
                self.config.ema.stds, self.ema.stds
            )));
        }
        Ok(())
    }
}

/// One (step, std, file) source the posthoc solver can draw from. A single
/// checkpoint file typically yields one record per std it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRecord {
    pub step: u64,
    pub std: f64,
    pub file: String,
}

/// Result of scanning a checkpoint directory: every (step, std, file)
/// source record, sorted by (step, std), plus the latest checkpoint's step
/// and configuration snapshot.
#[derive(Clone, Debug)]
pub struct CheckpointScan {
    pub records: Vec<CheckpointRecord>,
    pub latest_step: u64,
    pub latest_config: ConfigSnapshot,
}

fn engine_fingerprint() -> String {
    format!(
        "pema-recon/{}/{}-{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn now_unix_ns() -> Result<i64, PemaError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| {
            PemaError::resource_limit(format!(
                "system clock before UNIX epoch; cannot timestamp checkpoint: {err}"
            ))
        })?;
    i64::try_from(elapsed.as_nanos()).map_err(|_| {
        PemaError::resource_limit("system timestamp overflow while constructing checkpoint")
    })
}

fn io_resource_error(action: &str, path: &Path, err: std::io::Error) -> PemaError {
    PemaError::resource_limit(format!("{action} '{}': {err}", path.display()))
}

/// Validates checkpoint schema version compatibility.
pub fn validate_checkpoint_schema_version(version: u32) -> Result<(), PemaError> {
    if (MIN_SUPPORTED_CHECKPOINT_SCHEMA_VERSION..=CURRENT_CHECKPOINT_SCHEMA_VERSION)
        .contains(&version)
    {
        return Ok(());
    }
    Err(PemaError::invalid_input(format!(
        "checkpoint state_schema_version={version} is unsupported; supported versions are {}..={}",
        MIN_SUPPORTED_CHECKPOINT_SCHEMA_VERSION, CURRENT_CHECKPOINT_SCHEMA_VERSION
    )))
}

/// Serializes and writes a checkpoint atomically (temp file + rename).
pub fn save_checkpoint(
    path: &Path,
    checkpoint: &TrainingCheckpoint,
    payload_codec: PayloadCodec,
) -> Result<(), PemaError> {
    checkpoint.validate()?;

    let payload = match payload_codec {
        PayloadCodec::Json => serde_json::to_vec(checkpoint).map_err(|err| {
            PemaError::invalid_input(format!(
                "checkpoint payload serialization failed (codec=json): {err}"
            ))
        })?,
        PayloadCodec::Bincode => bincode::serialize(checkpoint).map_err(|err| {
            PemaError::invalid_input(format!(
                "checkpoint payload serialization failed (codec=bincode): {err}"
            ))
        })?,
    };

    let envelope = CheckpointEnvelope {
        state_schema_version: CURRENT_CHECKPOINT_SCHEMA_VERSION,
        engine_fingerprint: engine_fingerprint(),
        created_at_ns: now_unix_ns()?,
        payload_crc32: crc32fast::hash(&payload),
        payload_codec,
        payload,
    };
    envelope.validate_metadata()?;

    let encoded = bincode::serialize(&envelope).map_err(|err| {
        PemaError::invalid_input(format!("checkpoint envelope serialization failed: {err}"))
    })?;
    write_checkpoint_file_atomic(path, encoded.as_slice())
}

/// Reads and verifies a checkpoint envelope without decoding its payload.
pub fn load_envelope(path: &Path) -> Result<CheckpointEnvelope, PemaError> {
    let encoded = std::fs::read(path)
        .map_err(|err| io_resource_error("failed reading checkpoint", path, err))?;
    let envelope: CheckpointEnvelope = bincode::deserialize(encoded.as_slice()).map_err(|err| {
        PemaError::invalid_input(format!(
            "checkpoint envelope parse failed for '{}': {err}",
            path.display()
        ))
    })?;
    envelope.validate_metadata()?;
    envelope.verify_payload_crc32()?;
    Ok(envelope)
}

/// Reads, verifies and deserializes one checkpoint. Missing or unreadable
/// files are fatal; nothing here retries.
pub fn load_checkpoint(path: &Path) -> Result<TrainingCheckpoint, PemaError> {
    let envelope = load_envelope(path)?;

    let checkpoint: TrainingCheckpoint = match envelope.payload_codec {
        PayloadCodec::Json => {
            serde_json::from_slice(envelope.payload.as_slice()).map_err(|err| {
                PemaError::invalid_input(format!(
                    "checkpoint payload deserialization failed (codec=json) for '{}': {err}",
                    path.display()
                ))
            })?
        }
        PayloadCodec::Bincode => {
            bincode::deserialize(envelope.payload.as_slice()).map_err(|err| {
                PemaError::invalid_input(format!(
                    "checkpoint payload deserialization failed (codec=bincode) for '{}': {err}",
                    path.display()
                ))
            })?
        }
    };
    checkpoint.validate()?;
    Ok(checkpoint)
}

fn write_checkpoint_file_atomic(path: &Path, encoded: &[u8]) -> Result<(), PemaError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            PemaError::invalid_input(format!(
                "checkpoint path '{}' must include a non-empty file name",
                path.display()
            ))
        })?;

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let temp_path = parent.join(format!("{file_name}.tmp-{}-{suffix}", process::id()));

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|err| io_resource_error("failed creating checkpoint temp file", &temp_path, err))?;

    if let Err(err) = file.write_all(encoded) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_resource_error(
            "failed writing checkpoint temp file",
            &temp_path,
            err,
        ));
    }
    if let Err(err) = file.sync_all() {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_resource_error(
            "failed fsync on checkpoint temp file",
            &temp_path,
            err,
        ));
    }
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_resource_error(
            "failed renaming checkpoint temp file",
            path,
            err,
        ));
    }
    Ok(())
}

/// Extracts the epoch number from an `epoch_<N>.ckpt` file name.
pub fn parse_epoch_file_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(EPOCH_FILE_PREFIX)?
        .strip_suffix(CHECKPOINT_FILE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Discovers every source record under a checkpoint directory.
///
/// `latest.ckpt` is required and contributes both the synthetic latest
/// records and the authoritative configuration snapshot; every
/// `epoch_<N>.ckpt` file contributes one record per std it covers.
/// Checkpoints are loaded one at a time and dropped before the next read.
pub fn scan_checkpoint_dir(checkpoint_dir: &Path) -> Result<CheckpointScan, PemaError> {
    let latest_path = checkpoint_dir.join(LATEST_CHECKPOINT_FILE);
    if !latest_path.exists() {
        return Err(PemaError::invalid_input(format!(
            "checkpoint '{}' does not exist",
            latest_path.display()
        )));
    }

    let mut records = Vec::new();
    let entries = std::fs::read_dir(checkpoint_dir)
        .map_err(|err| io_resource_error("failed reading checkpoint directory", checkpoint_dir, err))?;
    let mut epoch_files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            io_resource_error("failed reading checkpoint directory entry", checkpoint_dir, err)
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if parse_epoch_file_name(name.as_str()).is_some() {
            epoch_files.push(name);
        }
    }
    epoch_files.sort();

    for name in epoch_files {
        let checkpoint = load_checkpoint(checkpoint_dir.join(name.as_str()).as_path())?;
        for &std in &checkpoint.config.ema.stds {
            records.push(CheckpointRecord {
                step: checkpoint.global_step,
                std,
                file: name.clone(),
            });
        }
    }

    let latest = load_checkpoint(latest_path.as_path())?;
    for &std in &latest.config.ema.stds {
        records.push(CheckpointRecord {
            step: latest.global_step,
            std,
            file: LATEST_CHECKPOINT_FILE.to_string(),
        });
    }

    records.sort_by(|a, b| {
        a.step
            .cmp(&b.step)
            .then_with(|| a.std.total_cmp(&b.std))
            .then_with(|| a.file.cmp(&b.file))
    });

    Ok(CheckpointScan {
        records,
        latest_step: latest.global_step,
        latest_config: latest.config,
    })
}
