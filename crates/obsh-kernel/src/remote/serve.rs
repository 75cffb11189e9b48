//! The runner protocol loop.

use std::sync::Arc;

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::task::JoinError;

use super::signal::SignalDelivery;
use super::{RunRequest, run_request};
use crate::config::KernelConfig;
use crate::error::WireError;
use crate::wire::read_json_line;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no pipeline received")]
    NoRequest,

    #[error("bad request: {0}")]
    Request(#[from] WireError),

    #[error("unknown signal number {0}")]
    UnknownSignal(i32),

    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error("execution task failed: {0}")]
    Task(#[from] JoinError),
}

/// How a runner session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The pipeline ran to completion and the output was finished.
    Completed,
    /// A termination signal arrived and was delivered.
    Signalled(Signal),
}

/// Serve one request: read it from `input`, run it, watch `input` for a
/// termination signal until the run finishes.
///
/// The pipeline runs on its own task so that reading the input channel and
/// executing a long pipeline never block each other.
pub async fn serve<R, W>(
    input: R,
    output: W,
    config: Arc<KernelConfig>,
    delivery: &dyn SignalDelivery,
) -> Result<ServeOutcome, RunnerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut input = BufReader::new(input);
    let request: RunRequest = read_json_line(&mut input).await?.ok_or(RunnerError::NoRequest)?;
    tracing::debug!("runner: received {}", request.pipeline.describe());

    let poll = config.runner_poll();
    let mut task = tokio::spawn(run_request(request, Box::new(output), config));
    let mut input_open = true;

    loop {
        if !input_open {
            // Nothing can cancel us any more; wait for the run to finish.
            match tokio::time::timeout(poll, &mut task).await {
                Ok(joined) => return finished(joined),
                Err(_) => continue,
            }
        }

        tokio::select! {
            joined = &mut task => return finished(joined),
            line = read_json_line::<_, i32>(&mut input) => match line {
                Ok(Some(signo)) => {
                    task.abort();
                    let sig = Signal::try_from(signo).map_err(|_| RunnerError::UnknownSignal(signo))?;
                    tracing::info!("runner: received {}", sig);
                    delivery.deliver(sig)?;
                    return Ok(ServeOutcome::Signalled(sig));
                }
                Ok(None) => {
                    tracing::debug!("runner: input closed, running to completion");
                    input_open = false;
                }
                Err(e) => {
                    tracing::warn!("runner: unreadable input ignored: {}", e);
                    input_open = false;
                }
            },
        }
    }
}

fn finished(joined: Result<Result<(), WireError>, JoinError>) -> Result<ServeOutcome, RunnerError> {
    match joined? {
        Ok(()) => Ok(ServeOutcome::Completed),
        Err(e) => {
            // Whoever reads our output has gone; there is nobody to report to.
            tracing::debug!("runner: output failed: {}", e);
            Ok(ServeOutcome::Completed)
        }
    }
}
