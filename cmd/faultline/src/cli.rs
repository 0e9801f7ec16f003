use crate::{
    error::CliError,
    initializers::{init_telemetry, init_tracing},
    io::{read_problems, write_diagnoses},
};
use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use faultline_engine::{Diagnosis, EngineError, Investigator, Problem, load_config};
use std::{path::PathBuf, time::Duration};
use tracing::{Level, info, warn};

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "faultline", version, about = "Root-cause localization for microservice alarms")]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "log-level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "FAULTLINE_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error. RUST_LOG directives take precedence.",
        global = true
    )]
    pub log_level: Level,
}

#[derive(ClapParser, Debug, Clone)]
pub struct RunOptions {
    #[arg(
        long = "input",
        value_name = "INPUT_JSONL",
        default_value = "input.jsonl",
        env = "FAULTLINE_INPUT",
        help = "Problems to analyze, one JSON object per line."
    )]
    pub input: PathBuf,
    #[arg(
        long = "output",
        value_name = "OUTPUT_JSONL",
        default_value = "output.jsonl",
        env = "FAULTLINE_OUTPUT",
        help = "Where diagnoses are written, one JSON object per line."
    )]
    pub output: PathBuf,
    #[arg(
        long = "config",
        value_name = "CONFIG_TOML",
        env = "FAULTLINE_CONFIG",
        help = "TOML file with a [faultline] section and an optional [queries] table."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long = "prometheus-url",
        value_name = "URL",
        env = "FAULTLINE_PROMETHEUS_URL",
        conflicts_with = "fixtures",
        help = "Base URL of the Prometheus HTTP API."
    )]
    pub prometheus_url: Option<String>,
    #[arg(
        long = "fixtures",
        value_name = "FIXTURES_JSON",
        env = "FAULTLINE_FIXTURES",
        help = "Offline telemetry fixture file, used instead of Prometheus."
    )]
    pub fixtures: Option<PathBuf>,
    #[arg(
        long = "problem-timeout",
        value_name = "SECONDS",
        default_value_t = 300,
        env = "FAULTLINE_PROBLEM_TIMEOUT",
        help = "Maximum analysis time per problem; a timed out problem gets no root causes."
    )]
    pub problem_timeout: u64,
    #[arg(
        long = "request-timeout",
        value_name = "SECONDS",
        default_value_t = 30,
        env = "FAULTLINE_REQUEST_TIMEOUT",
        help = "Timeout of a single Prometheus request."
    )]
    pub request_timeout: u64,
    #[arg(
        long = "with-evidence",
        action = ArgAction::SetTrue,
        env = "FAULTLINE_WITH_EVIDENCE",
        help = "Include the evidence sentences under `evidences` in every output line."
    )]
    pub with_evidence: bool,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "run", about = "Analyze every problem of an input file")]
    Run(RunOptions),
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> Result<(), CliError> {
        init_tracing(opts);

        match self {
            Subcommand::Run(run_opts) => {
                let config = load_config(run_opts.config.as_deref())?;
                let telemetry = init_telemetry(&run_opts)?;
                let investigator = Investigator::new(telemetry, config);

                let problems = read_problems(&run_opts.input)?;
                info!(problems = problems.len(), input = %run_opts.input.display(), "Loaded problems");

                let timeout = Duration::from_secs(run_opts.problem_timeout);
                let diagnoses = analyze_all(&investigator, &problems, timeout).await;

                write_diagnoses(&run_opts.output, &diagnoses, run_opts.with_evidence)?;
                info!(
                    written = diagnoses.len(),
                    output = %run_opts.output.display(),
                    "Results written"
                );
            }
        }
        Ok(())
    }
}

/// Analyzes problems one after another. Problems with an unknown alarm rule
/// or a malformed time range are skipped; a problem exceeding `timeout` is
/// reported with no root causes.
pub async fn analyze_all(
    investigator: &Investigator,
    problems: &[Problem],
    timeout: Duration,
) -> Vec<Diagnosis> {
    let mut diagnoses = Vec::with_capacity(problems.len());
    for problem in problems {
        match tokio::time::timeout(timeout, investigator.diagnose(problem)).await {
            Ok(Ok(diagnosis)) => {
                info!(
                    problem_id = %diagnosis.problem_id,
                    root_causes = ?diagnosis.root_causes.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "Problem analyzed"
                );
                diagnoses.push(diagnosis);
            }
            Ok(Err(error @ EngineError::UnknownAlarmRule(_))) => {
                warn!(problem_id = %problem.problem_id, %error, "Skipping problem");
            }
            Ok(Err(error)) => {
                warn!(problem_id = %problem.problem_id, %error, "Skipping malformed problem");
            }
            Err(_) => {
                warn!(
                    problem_id = %problem.problem_id,
                    timeout_secs = timeout.as_secs(),
                    "Analysis timed out"
                );
                diagnoses.push(Diagnosis::empty(problem.problem_id.clone()));
            }
        }
    }
    diagnoses
}
