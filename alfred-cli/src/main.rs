//! Alfred: a state document service with HTTP and WebSocket read APIs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use alfred_cli::service::{self, Environment};

/// Launch Alfred, attached to the terminal unless -d or --daemon is
/// specified.
#[derive(Parser)]
#[command(name = "alfred", version, about, long_about = None)]
struct Cli {
    /// Use the store saved in the file at the given PATH.
    #[arg(short = 's', long = "store", value_name = "PATH")]
    store: Option<PathBuf>,

    /// Write diagnostics to the configured log file rather than the
    /// terminal. (Daemonization itself requires separate OS-specific
    /// installation steps.)
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    #[arg(value_name = "EXTRA", hide = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    for extra in &cli.extra {
        eprintln!("warning: extra argument '{extra}' ignored");
    }
    let environment = Environment {
        store_file_path: cli.store,
        daemon: cli.daemon,
    };
    match service::run(environment).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(setup_error) => {
            eprintln!("error: {setup_error:#}");
            ExitCode::FAILURE
        }
    }
}
