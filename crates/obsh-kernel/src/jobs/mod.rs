//! Job control: running commands as signal-driven child processes.
//!
//! A job is one runner process executing one pipeline. Its state moves
//! through the table in [`state`] on user signals and explicit `bg`/`fg`
//! requests; a listener thread reads every job's result channel and hands
//! the frames to the controlling process as events.
//!
//! [`JobControl`] is an explicit handle: the front end creates one per
//! session and passes it to whatever needs to start or signal jobs.

mod control;
mod listener;
mod process;
mod state;

pub use control::{JobControl, JobOutput};
pub use listener::{ChannelFactory, JobChannel, Listener, ListenerEvent};
pub use process::{JobProcess, KillOutcome, OsProcess, kill_sequence};
pub use state::{Effect, Lifecycle, Transition, Trigger};

use thiserror::Error;

use obsh_types::JobId;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no such job: {0}")]
    UnknownJob(JobId),

    #[error("no current job")]
    NoCurrentJob,

    #[error("job {0} is already in the foreground")]
    ForegroundBusy(JobId),

    #[error("cannot start job: {0}")]
    Spawn(String),

    #[error("process handle is no longer usable")]
    ProcessGone,

    #[error("signal failed: {0}")]
    Signal(String),

    #[error("listener unavailable: {0}")]
    Listener(String),
}
