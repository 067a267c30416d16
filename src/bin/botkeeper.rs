use botkeeper::bk::cli;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();
    // stdout carries reports; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli::run(args).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("botkeeper: {e:#}");
            ExitCode::FAILURE
        }
    }
}
