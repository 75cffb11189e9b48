//! Job identification and state types.

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Foreground`, `Background` and `Paused` move between each other on
/// signals and explicit `fg`/`bg` requests; `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Owns the terminal; the shell waits for it.
    Foreground,
    /// Running without the terminal.
    Background,
    /// Stopped by a suspend signal.
    Paused,
    /// Exited, killed, or a kill could not be confirmed.
    Dead,
}

impl JobState {
    pub fn is_alive(&self) -> bool {
        !matches!(self, JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Foreground => write!(f, "Running"),
            JobState::Background => write!(f, "Running &"),
            JobState::Paused => write!(f, "Stopped"),
            JobState::Dead => write!(f, "Done"),
        }
    }
}

/// Information about a job for listing.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Job ID.
    pub id: JobId,
    /// Command description.
    pub command: String,
    /// Current state.
    pub state: JobState,
    /// OS process ID, while the process handle is usable.
    pub pid: Option<u32>,
    /// Exit code once the job is dead (128 + signal for signalled exits).
    pub exit_code: Option<i64>,
}
