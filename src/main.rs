use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use verify_gate::GateError;

mod cli;
mod workflow;

/// Environment variable holding the log filter directive.
const LOG_ENV: &str = "VGATE_LOG";

fn main() -> ExitCode {
    let args = cli::RootArgs::parse();
    init_tracing(args.verbose);

    match workflow::run(args) {
        Ok(verdict) => verdict.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<GateError>() {
        Some(gate) if gate.is_lock_contention() => 2,
        _ => 1,
    }
}
