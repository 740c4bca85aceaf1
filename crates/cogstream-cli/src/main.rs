use std::process::ExitCode;

use clap::Parser;
use cogstream_cli::{run, Cli};
use tracing::error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag.
    let filter = if cli.verbose {
        "cogstream=debug,cogstream_cli=debug,cogstream_reader=debug,cogstream_stream=debug,cogstream_range=debug,cogstream_tiff=debug"
    } else {
        "cogstream_cli=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    cogstream_metrics::describe_metrics();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
