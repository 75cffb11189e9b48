//! obsh CLI entry point.
//!
//! Usage:
//!   obsh                       # Interactive REPL
//!   obsh -c <pipeline>         # Run one JSON pipeline in-process and exit

use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None => {
            obsh_repl::run()?;
            Ok(ExitCode::SUCCESS)
        }

        Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!(
                "obsh {} ({} {})",
                env!("CARGO_PKG_VERSION"),
                env!("OBSH_GIT_HASH"),
                env!("OBSH_BUILD_DATE")
            );
            Ok(ExitCode::SUCCESS)
        }

        Some("-c") => {
            let pipeline = args.get(2).context("-c requires a pipeline argument")?;
            obsh_repl::run_command(pipeline)
        }

        Some(unknown) => {
            eprintln!("Unknown option: {unknown}");
            eprintln!("Run 'obsh --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_help() {
    println!(
        r#"obsh v{}: the object shell

Usage:
  obsh                         Interactive REPL
  obsh -c <pipeline>           Run one pipeline and exit

Options:
  -c <pipeline>                Run a JSON pipeline in this process
  -h, --help                   Show this help
  -V, --version                Show version

Environment:
  OBSH_RUNNER                  Path of the obsh-runner program
  RUST_LOG                     Log filter, e.g. obsh_kernel=debug

Examples:
  obsh -c '[{{"op":"generate","count":3}}]'
  obsh -c '[{{"op":"values","items":[{{"Int":3}},{{"Int":1}}]}},{{"op":"sort"}}]'
"#,
        env!("CARGO_PKG_VERSION")
    );
}
