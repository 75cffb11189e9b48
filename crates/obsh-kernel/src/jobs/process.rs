//! Job processes and the kill sequence.

use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::JobError;
use crate::remote::RunRequest;

/// The OS side of a job.
pub trait JobProcess: Send {
    /// Process id, while the process has not been reaped.
    fn pid(&self) -> Option<u32>;

    fn signal(&mut self, sig: Signal) -> Result<(), JobError>;

    /// The exit code once the process has exited, without blocking.
    ///
    /// Processes ended by a signal report `128 + signal`.
    fn try_wait(&mut self) -> Result<Option<i64>, JobError>;
}

/// How a kill attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Exited after the graceful signal.
    Terminated(i64),
    /// Exited after the forceful signal.
    Killed(i64),
    /// Still alive after both waits.
    Unconfirmed,
}

/// Graceful signal, bounded wait, forceful signal, bounded wait, report.
///
/// Never waits longer than `2 * wait` and never retries.
pub fn kill_sequence(process: &mut dyn JobProcess, wait: Duration) -> KillOutcome {
    if let Ok(Some(code)) = process.try_wait() {
        return KillOutcome::Terminated(code);
    }

    if let Err(e) = process.signal(Signal::SIGTERM) {
        tracing::debug!("SIGTERM: {}", e);
    }
    if let Some(code) = wait_for_exit(process, wait) {
        return KillOutcome::Terminated(code);
    }

    tracing::info!("process {:?} ignored SIGTERM, escalating", process.pid());
    if let Err(e) = process.signal(Signal::SIGKILL) {
        tracing::debug!("SIGKILL: {}", e);
    }
    if let Some(code) = wait_for_exit(process, wait) {
        return KillOutcome::Killed(code);
    }

    tracing::warn!("process {:?} still alive after SIGKILL", process.pid());
    KillOutcome::Unconfirmed
}

fn wait_for_exit(process: &mut dyn JobProcess, wait: Duration) -> Option<i64> {
    let deadline = Instant::now() + wait;
    let step = Duration::from_millis(10).min(wait);
    loop {
        match process.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("wait: {}", e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(step);
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(sig)) => 128 + sig as i64,
        (None, None) => -1,
    }
}

/// A runner child process executing one request.
///
/// The runner leads its own process group, and every signal goes to that
/// group: workers the runner started are stopped, continued and killed with
/// it.
pub struct OsProcess {
    child: Child,
    group: Pid,
    exit: Option<i64>,
}

impl OsProcess {
    /// Start `runner`, hand it `request`, and close its input so it runs to
    /// completion. Returns the process and its result channel.
    pub fn spawn(runner: &Path, request: &RunRequest) -> Result<(OsProcess, ChildStdout), JobError> {
        let mut child = Command::new(runner)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| JobError::Spawn(format!("{}: {}", runner.display(), e)))?;
        let group = Pid::from_raw(child.id() as i32);

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(JobError::Spawn("runner has no pipes".to_string()));
        };
        let sent = serde_json::to_writer(&mut stdin, request)
            .map_err(|e| JobError::Spawn(e.to_string()))
            .and_then(|()| stdin.write_all(b"\n").map_err(|e| JobError::Spawn(e.to_string())));
        drop(stdin);

        let mut process = OsProcess { child, group, exit: None };
        if let Err(e) = sent {
            kill_sequence(&mut process, Duration::from_millis(200));
            return Err(e);
        }
        Ok((process, stdout))
    }
}

impl JobProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        match self.exit {
            Some(_) => None,
            None => Some(self.child.id()),
        }
    }

    /// Signals the whole group. Workers outliving the runner still share
    /// the group id, so this keeps reaching them after the runner exited.
    fn signal(&mut self, sig: Signal) -> Result<(), JobError> {
        signal::killpg(self.group, sig).map_err(|e| JobError::Signal(format!("{} group {}: {}", sig, self.group, e)))
    }

    fn try_wait(&mut self) -> Result<Option<i64>, JobError> {
        if let Some(code) = self.exit {
            return Ok(Some(code));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code(status);
                self.exit = Some(code);
                Ok(Some(code))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(JobError::Signal(e.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A scripted process that records the signals it receives.
    #[derive(Clone)]
    pub struct FakeProcess {
        pub signals: Arc<Mutex<Vec<Signal>>>,
        pub exit: Arc<Mutex<Option<i64>>>,
        /// Signals that make the process exit.
        pub dies_on: Vec<Signal>,
    }

    impl FakeProcess {
        pub fn new(dies_on: Vec<Signal>) -> Self {
            Self {
                signals: Arc::new(Mutex::new(Vec::new())),
                exit: Arc::new(Mutex::new(None)),
                dies_on,
            }
        }

        pub fn signals(&self) -> Vec<Signal> {
            self.signals.lock().unwrap().clone()
        }

        pub fn exit_now(&self, code: i64) {
            *self.exit.lock().unwrap() = Some(code);
        }
    }

    impl JobProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            match *self.exit.lock().unwrap() {
                Some(_) => None,
                None => Some(4242),
            }
        }

        fn signal(&mut self, sig: Signal) -> Result<(), JobError> {
            if self.exit.lock().unwrap().is_some() {
                return Err(JobError::ProcessGone);
            }
            self.signals.lock().unwrap().push(sig);
            if self.dies_on.contains(&sig) {
                self.exit_now(128 + sig as i64);
            }
            Ok(())
        }

        fn try_wait(&mut self) -> Result<Option<i64>, JobError> {
            Ok(*self.exit.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProcess;
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[test]
    fn test_graceful_exit() {
        let mut process = FakeProcess::new(vec![Signal::SIGTERM]);
        assert_eq!(kill_sequence(&mut process, WAIT), KillOutcome::Terminated(143));
        assert_eq!(process.signals(), vec![Signal::SIGTERM]);
    }

    #[test]
    fn test_escalates_to_sigkill() {
        let mut process = FakeProcess::new(vec![Signal::SIGKILL]);
        assert_eq!(kill_sequence(&mut process, WAIT), KillOutcome::Killed(137));
        assert_eq!(process.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[test]
    fn test_unkillable_is_reported_not_raised() {
        let mut process = FakeProcess::new(vec![]);
        let started = Instant::now();
        assert_eq!(kill_sequence(&mut process, WAIT), KillOutcome::Unconfirmed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_real_process_is_killed() {
        let child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let group = Pid::from_raw(child.id() as i32);
        let mut process = OsProcess { child, group, exit: None };
        let outcome = kill_sequence(&mut process, Duration::from_millis(200));
        assert_eq!(outcome, KillOutcome::Terminated(128 + Signal::SIGTERM as i64));
        assert_eq!(process.pid(), None);
        assert!(matches!(process.signal(Signal::SIGCONT), Err(JobError::ProcessGone)));
    }
}
