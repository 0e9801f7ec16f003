use clap::Parser;
use faultline::cli::CLI;
use tracing::error;

#[tokio::main]
async fn main() {
    let CLI { opts, command } = CLI::parse();

    if let Err(error) = command.run(&opts).await {
        error!(%error, "faultline failed");
        std::process::exit(1);
    }
}
