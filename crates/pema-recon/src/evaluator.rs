// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::{PemaError, TensorMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric every rollout evaluator must report.
pub const MEAN_SCORE_METRIC: &str = "test/mean_score";

/// Downstream rollout evaluation: runs a simulation episode set against a
/// ready-to-evaluate policy and reports named scalar metrics, including
/// [`MEAN_SCORE_METRIC`]. Treated as a pure function of the policy's
/// weights; failures propagate unmodified and abort the search.
pub trait RolloutEvaluator {
    fn run(&mut self, policy: &TensorMap) -> Result<BTreeMap<String, f64>, PemaError>;
}

/// Declarative evaluator selection, carried in the checkpoint's
/// configuration snapshot and resolved through an [`EvaluatorRegistry`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub tag: String,
    #[serde(default, with = "options_as_json_text")]
    pub options: serde_json::Value,
}

/// Persists evaluator options as JSON text. Checkpoint payloads must stay
/// codec-agnostic, and bincode cannot carry a self-describing JSON value.
mod options_as_json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &serde_json::Value,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.to_string().as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<serde_json::Value, D::Error> {
        let raw = String::deserialize(deserializer)?;
        serde_json::from_str(raw.as_str()).map_err(serde::de::Error::custom)
    }
}

type EvaluatorBuilder =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn RolloutEvaluator>, PemaError>>;

/// Explicit name-to-constructor map for rollout evaluators, resolved once
/// at startup instead of late-bound string instantiation at call sites.
#[derive(Default)]
pub struct EvaluatorRegistry {
    builders: BTreeMap<String, EvaluatorBuilder>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in evaluator kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("constant", |options| {
            Ok(Box::new(ConstantEvaluator::from_options(options)?))
        });
        registry.register("command", |options| {
            Ok(Box::new(CommandEvaluator::from_options(options)?))
        });
        registry
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        builder: impl Fn(&serde_json::Value) -> Result<Box<dyn RolloutEvaluator>, PemaError>
        + 'static,
    ) {
        self.builders.insert(tag.into(), Box::new(builder));
    }

    pub fn tags(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    pub fn build(&self, config: &EvaluatorConfig) -> Result<Box<dyn RolloutEvaluator>, PemaError> {
        let builder = self.builders.get(config.tag.as_str()).ok_or_else(|| {
            PemaError::not_supported(format!(
                "no evaluator registered for tag '{}'; registered tags: {:?}",
                config.tag,
                self.tags()
            ))
        })?;
        builder(&config.options)
    }
}

/// Fixed-score evaluator for dry runs and plumbing tests.
#[derive(Clone, Copy, Debug)]
pub struct ConstantEvaluator {
    score: f64,
}

#[derive(Deserialize)]
struct ConstantOptions {
    #[serde(default)]
    score: f64,
}

impl ConstantEvaluator {
    pub fn new(score: f64) -> Self {
        Self { score }
    }

    fn from_options(options: &serde_json::Value) -> Result<Self, PemaError> {
        let parsed: ConstantOptions = parse_options("constant", options)?;
        Ok(Self::new(parsed.score))
    }
}

impl RolloutEvaluator for ConstantEvaluator {
    fn run(&mut self, _policy: &TensorMap) -> Result<BTreeMap<String, f64>, PemaError> {
        let mut metrics = BTreeMap::new();
        metrics.insert(MEAN_SCORE_METRIC.to_string(), self.score);
        Ok(metrics)
    }
}

/// Bridges to an external rollout program: the policy is written to a
/// temporary JSON file, the program is invoked with that path as its last
/// argument, and the last non-empty stdout line is parsed as a JSON
/// object of named scalar metrics.
#[derive(Clone, Debug)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct CommandOptions {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn from_options(options: &serde_json::Value) -> Result<Self, PemaError> {
        let parsed: CommandOptions = parse_options("command", options)?;
        if parsed.program.trim().is_empty() {
            return Err(PemaError::invalid_input(
                "command evaluator requires a non-empty 'program' option",
            ));
        }
        Ok(Self::new(parsed.program, parsed.args))
    }

    fn policy_temp_path() -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("pema-policy-{}-{seq}.json", process::id()))
    }
}

impl RolloutEvaluator for CommandEvaluator {
    fn run(&mut self, policy: &TensorMap) -> Result<BTreeMap<String, f64>, PemaError> {
        let policy_path = Self::policy_temp_path();
        let encoded = serde_json::to_vec(policy).map_err(|err| {
            PemaError::invalid_input(format!("policy serialization failed: {err}"))
        })?;
        std::fs::write(&policy_path, encoded)
            .map_err(|err| io_resource_error("failed writing policy file", &policy_path, err))?;

        let output = Command::new(self.program.as_str())
            .args(self.args.iter())
            .arg(&policy_path)
            .output();
        let _ = std::fs::remove_file(&policy_path);
        let output = output.map_err(|err| {
            PemaError::resource_limit(format!(
                "failed spawning rollout program '{}': {err}",
                self.program
            ))
        })?;

        if !output.status.success() {
            return Err(PemaError::resource_limit(format!(
                "rollout program '{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| {
                PemaError::invalid_input(format!(
                    "rollout program '{}' produced no metric output",
                    self.program
                ))
            })?;
        serde_json::from_str::<BTreeMap<String, f64>>(last_line.trim()).map_err(|err| {
            PemaError::invalid_input(format!(
                "rollout program '{}' metric line is not a JSON object of numbers: {err}",
                self.program
            ))
        })
    }
}

fn parse_options<T: serde::de::DeserializeOwned>(
    tag: &str,
    options: &serde_json::Value,
) -> Result<T, PemaError> {
    let options = if options.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        options.clone()
    };
    serde_json::from_value(options).map_err(|err| {
        PemaError::invalid_input(format!("invalid options for evaluator '{tag}': {err}"))
    })
}

fn io_resource_error(action: &str, path: &Path, err: std::io::Error) -> PemaError {
    PemaError::resource_limit(format!("{action} '{}': {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::{
        ConstantEvaluator, EvaluatorConfig, EvaluatorRegistry, MEAN_SCORE_METRIC, RolloutEvaluator,
    };
    use pema_core::{Tensor, TensorKind, TensorMap};

    fn policy() -> TensorMap {
        TensorMap::new(vec![
            Tensor::new("w", TensorKind::Parameter, vec![1], vec![0.5])
                .expect("tensor should be valid"),
        ])
        .expect("tensor map should be valid")
    }

    #[test]
    fn constant_evaluator_reports_mean_score() {
        let mut evaluator = ConstantEvaluator::new(0.42);
        let metrics = evaluator.run(&policy()).expect("run should succeed");
        assert_eq!(metrics.get(MEAN_SCORE_METRIC), Some(&0.42));
    }

    #[test]
    fn registry_builds_constant_from_options() {
        let registry = EvaluatorRegistry::with_builtins();
        let mut evaluator = registry
            .build(&EvaluatorConfig {
                tag: "constant".to_string(),
                options: serde_json::json!({ "score": 0.9 }),
            })
            .expect("constant evaluator should build");
        let metrics = evaluator.run(&policy()).expect("run should succeed");
        assert_eq!(metrics.get(MEAN_SCORE_METRIC), Some(&0.9));
    }

    #[test]
    fn unknown_tag_lists_registered_tags() {
        let registry = EvaluatorRegistry::with_builtins();
        let err = registry
            .build(&EvaluatorConfig {
                tag: "pusht".to_string(),
                options: serde_json::Value::Null,
            })
            .err()
            .expect("unknown tag must fail");
        assert!(err.to_string().contains("constant"), "{err}");
        assert!(err.to_string().contains("command"), "{err}");
    }

    #[test]
    fn command_evaluator_requires_program() {
        let registry = EvaluatorRegistry::with_builtins();
        let err = registry
            .build(&EvaluatorConfig {
                tag: "command".to_string(),
                options: serde_json::json!({ "program": "" }),
            })
            .err()
            .expect("empty program must fail");
        assert!(err.to_string().contains("non-empty 'program'"), "{err}");
    }
}
