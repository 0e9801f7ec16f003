use clap::Parser;
use faultline::selfcheck;
use std::path::PathBuf;
use tracing::error;

/// Compares a results file against an answer file, grouped by alarm rules.
#[derive(Parser)]
#[command(name = "faultline-selfcheck", version)]
struct Args {
    /// Expected root causes, one `{problem_id, root_causes}` per line
    answers: PathBuf,
    /// Root causes produced by `faultline run`
    results: PathBuf,
    /// The problems file, used to group mismatches by alarm rules
    problems: PathBuf,
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    match selfcheck::run(&args.answers, &args.results, &args.problems) {
        Ok(report) => print!("{report}"),
        Err(error) => {
            error!(%error, "self-check failed");
            std::process::exit(1);
        }
    }
}
