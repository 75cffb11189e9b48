//! obsh-runner: executes one shipped pipeline.
//!
//! Reads a run request from stdin, writes result frames to stdout, and
//! watches stdin for a signal number until the run finishes. Logs go to
//! stderr; stdout carries only the protocol.
//!
//! SIGINT is ignored: the controlling shell decides what an interrupt means
//! and tells the runner over stdin or with a direct signal.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use obsh_kernel::remote::OsSignalDelivery;
use obsh_kernel::{KernelConfig, ServeOutcome, serve};

/// How long shutdown waits for the blocked stdin reader.
const SHUTDOWN_WAIT: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    // SAFETY: SigIgn installs no handler code.
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) } {
        tracing::warn!("cannot ignore SIGINT: {}", e);
    }

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("obsh-runner: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let config = Arc::new(KernelConfig::load().context("Failed to load configuration")?);
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    let outcome = runtime.block_on(serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
        &OsSignalDelivery,
    ));
    // A parent may keep stdin open after the run; don't wait on the reader.
    runtime.shutdown_timeout(SHUTDOWN_WAIT);

    match outcome.context("runner failed")? {
        ServeOutcome::Completed => Ok(ExitCode::SUCCESS),
        // Reached only for signals whose default action doesn't end us.
        ServeOutcome::Signalled(sig) => Ok(ExitCode::from(128u8.wrapping_add(sig as u8))),
    }
}
