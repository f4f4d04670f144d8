use clap::Parser;
use sail::{cli, commands, Error};
use sail_errors::Classify;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    let result: Result<i32, Error> = match args.command {
        cli::Command::Build(build_args) => commands::build(build_args, args.verbose).await,
        cli::Command::Scan { path } => commands::scan(path).await,
        cli::Command::Policy { action } => commands::policy(action, args.verbose).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.remediation() {
                eprintln!("  hint: {hint}");
            }
            err.classify().exit_code()
        }
    };
    std::process::exit(code);
}
