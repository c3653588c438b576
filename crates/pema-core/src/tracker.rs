// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::PemaError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sink for flat scalar metric batches, one batch per evaluation.
///
/// A tracker may be told once that a metric series is indexed by a named
/// step metric (e.g. every `ema/*` series is plotted against `std`), before
/// any batch is logged.
pub trait ExperimentTracker {
    fn define_step_metric(&mut self, series_prefix: &str, step_metric: &str)
    -> Result<(), PemaError>;

    fn log(&mut self, metrics: &BTreeMap<String, f64>) -> Result<(), PemaError>;
}

/// Tracker that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTracker;

impl ExperimentTracker for NullTracker {
    fn define_step_metric(&mut self, _: &str, _: &str) -> Result<(), PemaError> {
        Ok(())
    }

    fn log(&mut self, _: &BTreeMap<String, f64>) -> Result<(), PemaError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct DefineLine<'a> {
    record: &'static str,
    series_prefix: &'a str,
    step_metric: &'a str,
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    record: &'static str,
    metrics: &'a BTreeMap<String, f64>,
}

/// Appends one JSON object per record to a local file.
#[derive(Debug)]
pub struct JsonlTracker {
    path: PathBuf,
    file: File,
}

impl JsonlTracker {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PemaError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_resource_error("failed opening tracker file", &path, err))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn write_line(&mut self, line: &impl Serialize) -> Result<(), PemaError> {
        let encoded = serde_json::to_string(line).map_err(|err| {
            PemaError::invalid_input(format!("tracker record serialization failed: {err}"))
        })?;
        writeln!(self.file, "{encoded}")
            .map_err(|err| io_resource_error("failed writing tracker record", &self.path, err))
    }
}

impl ExperimentTracker for JsonlTracker {
    fn define_step_metric(
        &mut self,
        series_prefix: &str,
        step_metric: &str,
    ) -> Result<(), PemaError> {
        self.write_line(&DefineLine {
            record: "define_metric",
            series_prefix,
            step_metric,
        })
    }

    fn log(&mut self, metrics: &BTreeMap<String, f64>) -> Result<(), PemaError> {
        self.write_line(&MetricsLine {
            record: "log",
            metrics,
        })
    }
}

fn io_resource_error(action: &str, path: &Path, err: std::io::Error) -> PemaError {
    PemaError::resource_limit(format!("{action} '{}': {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::{ExperimentTracker, JsonlTracker, NullTracker};
    use std::collections::BTreeMap;
    use std::process;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_temp_path(stem: &str) -> std::path::PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("{stem}-{}-{seq}.jsonl", process::id()))
    }

    #[test]
    fn null_tracker_accepts_everything() {
        let mut tracker = NullTracker;
        tracker
            .define_step_metric("ema/", "std")
            .expect("define should succeed");
        tracker
            .log(&BTreeMap::new())
            .expect("empty log should succeed");
    }

    #[test]
    fn jsonl_tracker_appends_records() {
        let path = unique_temp_path("pema-tracker");
        let mut tracker = JsonlTracker::create(path.clone()).expect("tracker should open");
        tracker
            .define_step_metric("ema/", "std")
            .expect("define should succeed");
        let mut metrics = BTreeMap::new();
        metrics.insert("ema/test_mean_score".to_string(), 0.75);
        metrics.insert("std".to_string(), 0.08);
        tracker.log(&metrics).expect("log should succeed");

        let contents = std::fs::read_to_string(&path).expect("tracker file should exist");
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("define_metric"));
        assert!(lines[1].contains("ema/test_mean_score"));
        let _ = std::fs::remove_file(&path);
    }
}
