// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::{EmaProfile, JsonlTracker, PemaError, StdSpec};
use pema_recon::{
    EvaluatorRegistry, LATEST_CHECKPOINT_FILE, PayloadCodec, ReconRunner, load_checkpoint,
    load_envelope,
};
use pema_search::{SearchConfig, maximize};
use pema_solve::solve_posthoc_coefficients;
use serde::Serialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

struct Cli {
    command: Command,
}

enum Command {
    Search(SearchArgs),
    Coeffs(CoeffsArgs),
    Inspect(InspectArgs),
}

#[derive(Debug)]
struct SearchArgs {
    workspace_dir: PathBuf,
    n_iter: usize,
    seed: Option<u64>,
    output: Option<PathBuf>,
}

#[derive(Debug)]
struct CoeffsArgs {
    source_steps: Vec<u64>,
    source_stds: String,
    target_step: u64,
    target_std: f64,
    output: Option<PathBuf>,
}

#[derive(Debug)]
struct InspectArgs {
    checkpoint: PathBuf,
    output: Option<PathBuf>,
}

enum CliError {
    Pema(PemaError),
    Io {
        context: String,
        source: std::io::Error,
    },
    Json {
        context: String,
        source: serde_json::Error,
    },
    InvalidInput(String),
}

impl CliError {
    fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Pema(err) => err.code(),
            Self::InvalidInput(_) => "invalid_input",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pema(err) => write!(f, "{err}"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Json { context, source } => write!(f, "{context}: {source}"),
            Self::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Debug for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pema(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            Self::InvalidInput(_) => None,
        }
    }
}

impl From<PemaError> for CliError {
    fn from(value: PemaError) -> Self {
        Self::Pema(value)
    }
}

#[derive(Serialize)]
struct ObservationOutput {
    std: f64,
    score: f64,
}

#[derive(Serialize)]
struct SearchOutput {
    command: &'static str,
    workspace_dir: String,
    init_points: usize,
    n_iter: usize,
    seed: u64,
    best: ObservationOutput,
    history: Vec<ObservationOutput>,
}

#[derive(Serialize)]
struct SourceWeightOutput {
    step: u64,
    std: f64,
    weight: f64,
}

#[derive(Serialize)]
struct CoeffsOutput {
    command: &'static str,
    target_step: u64,
    target_std: f64,
    sources: Vec<SourceWeightOutput>,
    weight_sum: f64,
}

#[derive(Serialize)]
struct InspectOutput {
    command: &'static str,
    file: String,
    state_schema_version: u32,
    engine_fingerprint: String,
    payload_codec: &'static str,
    payload_bytes: usize,
    global_step: u64,
    stds: Vec<f64>,
    evaluator_tag: String,
    parameter_tensors: usize,
    buffer_tensors: usize,
    parameter_elements: usize,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Serialize)]
struct ErrorPayload {
    code: String,
    message: String,
}

fn main() {
    if let Err(err) = run() {
        emit_structured_error(&err);
        process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let Some(cli) = parse_cli_from_env()? else {
        return Ok(());
    };

    match cli.command {
        Command::Search(args) => handle_search(args),
        Command::Coeffs(args) => handle_coeffs(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn parse_cli_from_env() -> Result<Option<Cli>, CliError> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        print_root_help();
        return Ok(None);
    }

    if matches!(args[0].as_str(), "-h" | "--help") {
        print_root_help();
        return Ok(None);
    }
    if matches!(args[0].as_str(), "-V" | "--version") {
        print_version();
        return Ok(None);
    }

    let command_name = args[0].clone();
    let rest = &args[1..];

    if rest
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_command_help(command_name.as_str())?;
        return Ok(None);
    }
    if rest
        .iter()
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
    {
        print_version();
        return Ok(None);
    }

    let command = match command_name.as_str() {
        "search" => Command::Search(parse_search_args(rest)?),
        "coeffs" => Command::Coeffs(parse_coeffs_args(rest)?),
        "inspect" => Command::Inspect(parse_inspect_args(rest)?),
        _ => {
            return Err(CliError::invalid_input(format!(
                "unknown command '{}'; expected one of: search, coeffs, inspect",
                command_name
            )));
        }
    };

    Ok(Some(Cli { command }))
}

fn parse_search_args(tokens: &[String]) -> Result<SearchArgs, CliError> {
    let mut workspace_dir: Option<PathBuf> = None;
    let mut n_iter = pema_search::DEFAULT_N_ITER;
    let mut seed: Option<u64> = None;
    let mut output: Option<PathBuf> = None;

    let mut idx = 0;
    while idx < tokens.len() {
        let (flag, inline_value) = split_flag(tokens[idx].as_str())?;
        match flag {
            "--workspace_dir" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                workspace_dir = Some(PathBuf::from(value));
            }
            "--n_iter" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                n_iter = parse_usize_arg(value.as_str(), flag)?;
            }
            "--seed" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                seed = Some(parse_u64_arg(value.as_str(), flag)?);
            }
            "--output" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                output = Some(PathBuf::from(value));
            }
            _ => {
                return Err(CliError::invalid_input(format!(
                    "unknown option '{flag}' for search"
                )));
            }
        }
        idx += 1;
    }

    let workspace_dir = workspace_dir
        .ok_or_else(|| CliError::invalid_input("search requires --workspace_dir <dir>"))?;
    Ok(SearchArgs {
        workspace_dir,
        n_iter,
        seed,
        output,
    })
}

fn parse_coeffs_args(tokens: &[String]) -> Result<CoeffsArgs, CliError> {
    let mut source_steps: Option<Vec<u64>> = None;
    let mut source_stds: Option<String> = None;
    let mut target_step: Option<u64> = None;
    let mut target_std: Option<f64> = None;
    let mut output: Option<PathBuf> = None;

    let mut idx = 0;
    while idx < tokens.len() {
        let (flag, inline_value) = split_flag(tokens[idx].as_str())?;
        match flag {
            "--source-steps" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                let steps = value
                    .split(',')
                    .map(|raw| parse_u64_arg(raw.trim(), flag))
                    .collect::<Result<Vec<_>, _>>()?;
                source_steps = Some(steps);
            }
            "--source-stds" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                source_stds = Some(value);
            }
            "--target-step" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                target_step = Some(parse_u64_arg(value.as_str(), flag)?);
            }
            "--target-std" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                target_std = Some(parse_f64_arg(value.as_str(), flag)?);
            }
            "--output" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                output = Some(PathBuf::from(value));
            }
            _ => {
                return Err(CliError::invalid_input(format!(
                    "unknown option '{flag}' for coeffs"
                )));
            }
        }
        idx += 1;
    }

    Ok(CoeffsArgs {
        source_steps: source_steps
            .ok_or_else(|| CliError::invalid_input("coeffs requires --source-steps <list>"))?,
        source_stds: source_stds
            .ok_or_else(|| CliError::invalid_input("coeffs requires --source-stds <spec>"))?,
        target_step: target_step
            .ok_or_else(|| CliError::invalid_input("coeffs requires --target-step <u64>"))?,
        target_std: target_std
            .ok_or_else(|| CliError::invalid_input("coeffs requires --target-std <float>"))?,
        output,
    })
}

fn parse_inspect_args(tokens: &[String]) -> Result<InspectArgs, CliError> {
    let mut checkpoint: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;

    let mut idx = 0;
    while idx < tokens.len() {
        let (flag, inline_value) = split_flag(tokens[idx].as_str())?;
        match flag {
            "--checkpoint" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                checkpoint = Some(PathBuf::from(value));
            }
            "--output" => {
                let value = take_flag_value(flag, inline_value, tokens, &mut idx)?;
                output = Some(PathBuf::from(value));
            }
            _ => {
                return Err(CliError::invalid_input(format!(
                    "unknown option '{flag}' for inspect"
                )));
            }
        }
        idx += 1;
    }

    Ok(InspectArgs {
        checkpoint: checkpoint
            .ok_or_else(|| CliError::invalid_input("inspect requires --checkpoint <path>"))?,
        output,
    })
}

fn handle_search(args: SearchArgs) -> Result<(), CliError> {
    let checkpoint_dir = args.workspace_dir.join("checkpoints");
    let latest_path = checkpoint_dir.join(LATEST_CHECKPOINT_FILE);
    if !latest_path.exists() {
        return Err(CliError::invalid_input(format!(
            "checkpoint '{}' does not exist",
            latest_path.display()
        )));
    }

    let registry = EvaluatorRegistry::with_builtins();
    let tracker = JsonlTracker::create(args.workspace_dir.join("ema_search.jsonl"))?;
    let mut runner =
        ReconRunner::from_checkpoint_dir(checkpoint_dir.as_path(), &registry, Box::new(tracker))?;

    let mut config = SearchConfig {
        n_iter: args.n_iter,
        ..SearchConfig::default()
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let outcome = maximize(|std| runner.evaluate(std), &config)?;

    write_json_output(
        &SearchOutput {
            command: "search",
            workspace_dir: args.workspace_dir.display().to_string(),
            init_points: config.init_points,
            n_iter: config.n_iter,
            seed: config.seed,
            best: ObservationOutput {
                std: outcome.best.std,
                score: outcome.best.score,
            },
            history: outcome
                .history
                .iter()
                .map(|obs| ObservationOutput {
                    std: obs.std,
                    score: obs.score,
                })
                .collect(),
        },
        args.output.as_deref(),
    )
}

fn handle_coeffs(args: CoeffsArgs) -> Result<(), CliError> {
    if args.source_steps.is_empty() {
        return Err(CliError::invalid_input(
            "--source-steps requires at least one step",
        ));
    }
    let spec = StdSpec::parse(args.source_stds.as_str())?;

    // Every source step carries every std, matching how checkpoints store
    // their EMA variants.
    let mut steps = args.source_steps.clone();
    steps.sort_unstable();
    steps.dedup();

    let mut sources = Vec::with_capacity(steps.len() * spec.len());
    for &step in &steps {
        for &std in spec.values() {
            sources.push((step, EmaProfile::new(step as f64, std)?));
        }
    }

    let target = EmaProfile::new(args.target_step as f64, args.target_std)?;
    let profiles: Vec<EmaProfile> = sources.iter().map(|&(_, profile)| profile).collect();
    let coefficients = solve_posthoc_coefficients(profiles.as_slice(), &[target])?;
    let weights = coefficients.for_target(0);

    let weight_sum = weights.iter().sum::<f64>();
    write_json_output(
        &CoeffsOutput {
            command: "coeffs",
            target_step: args.target_step,
            target_std: args.target_std,
            sources: sources
                .iter()
                .zip(weights.iter())
                .map(|(&(step, profile), &weight)| SourceWeightOutput {
                    step,
                    std: profile.std(),
                    weight,
                })
                .collect(),
            weight_sum,
        },
        args.output.as_deref(),
    )
}

fn handle_inspect(args: InspectArgs) -> Result<(), CliError> {
    let envelope = load_envelope(args.checkpoint.as_path())?;
    let checkpoint = load_checkpoint(args.checkpoint.as_path())?;

    let parameter_tensors = checkpoint.model.parameters().count();
    let buffer_tensors = checkpoint.model.buffers().count();
    let parameter_elements = checkpoint
        .model
        .parameters()
        .map(|tensor| tensor.data.len())
        .sum::<usize>();

    write_json_output(
        &InspectOutput {
            command: "inspect",
            file: args.checkpoint.display().to_string(),
            state_schema_version: envelope.state_schema_version,
            engine_fingerprint: envelope.engine_fingerprint,
            payload_codec: match envelope.payload_codec {
                PayloadCodec::Json => "json",
                PayloadCodec::Bincode => "bincode",
            },
            payload_bytes: envelope.payload.len(),
            global_step: checkpoint.global_step,
            stds: checkpoint.config.ema.stds.clone(),
            evaluator_tag: checkpoint.config.task.evaluator.tag.clone(),
            parameter_tensors,
            buffer_tensors,
            parameter_elements,
        },
        args.output.as_deref(),
    )
}

fn split_flag(token: &str) -> Result<(&str, Option<String>), CliError> {
    if !token.starts_with("--") {
        return Err(CliError::invalid_input(format!(
            "unexpected positional argument '{token}'; expected --flag value"
        )));
    }
    if let Some((flag, value)) = token.split_once('=') {
        return Ok((flag, Some(value.to_string())));
    }
    Ok((token, None))
}

fn take_flag_value(
    flag: &str,
    inline_value: Option<String>,
    tokens: &[String],
    idx: &mut usize,
) -> Result<String, CliError> {
    if let Some(value) = inline_value {
        return Ok(value);
    }

    *idx += 1;
    let value = tokens
        .get(*idx)
        .ok_or_else(|| CliError::invalid_input(format!("{flag} requires a value")))?;
    if value.starts_with("--") {
        return Err(CliError::invalid_input(format!(
            "{flag} requires a value, but got option '{value}'"
        )));
    }
    Ok(value.clone())
}

fn parse_usize_arg(raw: &str, flag: &str) -> Result<usize, CliError> {
    raw.parse::<usize>().map_err(|_| {
        CliError::invalid_input(format!(
            "{flag} expects a non-negative integer, got '{raw}'"
        ))
    })
}

fn parse_u64_arg(raw: &str, flag: &str) -> Result<u64, CliError> {
    raw.parse::<u64>().map_err(|_| {
        CliError::invalid_input(format!(
            "{flag} expects a non-negative integer, got '{raw}'"
        ))
    })
}

fn parse_f64_arg(raw: &str, flag: &str) -> Result<f64, CliError> {
    raw.parse::<f64>()
        .map_err(|_| CliError::invalid_input(format!("{flag} expects a number, got '{raw}'")))
}

fn write_json_output<T: Serialize>(
    payload: &T,
    output_path: Option<&Path>,
) -> Result<(), CliError> {
    let encoded = serde_json::to_string_pretty(payload)
        .map_err(|source| CliError::json("failed to serialize JSON output", source))?;

    if let Some(path) = output_path {
        fs::write(path, format!("{encoded}\n"))
            .map_err(|source| CliError::io(format!("failed to write '{}'", path.display()), source))
    } else {
        println!("{encoded}");
        Ok(())
    }
}

fn print_version() {
    println!("pema {}", env!("CARGO_PKG_VERSION"));
}

fn print_root_help() {
    println!(
        "pema {}\n\nUSAGE:\n  pema <COMMAND> [OPTIONS]\n\nCOMMANDS:\n  search    Search the EMA std axis for the best rollout score\n  coeffs    Solve posthoc reconstruction coefficients\n  inspect   Summarize a training checkpoint\n\nGLOBAL OPTIONS:\n  -h, --help      Show help\n  -V, --version   Show version\n\nRun 'pema <COMMAND> --help' for subcommand options.",
        env!("CARGO_PKG_VERSION")
    );
}

fn print_command_help(command: &str) -> Result<(), CliError> {
    match command {
        "search" => {
            println!(
                "USAGE:\n  pema search --workspace_dir <dir> [OPTIONS]\n\nOPTIONS:\n  --workspace_dir <dir>   Required; must contain checkpoints/latest.ckpt\n  --n_iter <usize>        Guided iterations after the initial probes. Default: 10\n  --seed <u64>            Seed for the initial random probes\n  --output <path>         Write JSON output to file"
            );
            Ok(())
        }
        "coeffs" => {
            println!(
                "USAGE:\n  pema coeffs --source-steps <list> --source-stds <spec> --target-step <u64> --target-std <float> [OPTIONS]\n\nOPTIONS:\n  --source-steps <list>   Comma-separated checkpoint steps, e.g. 100,200,500\n  --source-stds <spec>    Std list, e.g. '0.05,0.10,...,0.25' (ellipsis expands)\n  --target-step <u64>     Step of the reconstruction target\n  --target-std <float>    Std of the reconstruction target\n  --output <path>         Write JSON output to file"
            );
            Ok(())
        }
        "inspect" => {
            println!(
                "USAGE:\n  pema inspect --checkpoint <path> [OPTIONS]\n\nOPTIONS:\n  --checkpoint <path>     Required checkpoint file\n  --output <path>         Write JSON output to file"
            );
            Ok(())
        }
        _ => Err(CliError::invalid_input(format!(
            "unknown command '{command}'; expected one of: search, coeffs, inspect"
        ))),
    }
}


fn emit_structured_error(err: &CliError) {
    let envelope = ErrorEnvelope {
        error: ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    };

    match serde_json::to_string_pretty(&envelope) {
        Ok(json) => eprintln!("{json}"),
        Err(_) => eprintln!(
            "{{\"error\":{{\"code\":\"{}\",\"message\":\"{}\"}}}}",
            err.code(),
            err
        ),
    }
}
