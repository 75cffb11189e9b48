//! The job table and its controlling handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::io::BufReader;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use obsh_types::{ErrorValue, Frame, JobId, JobInfo, JobState, Value};

use super::listener::{ChannelFactory, JobChannel, Listener, ListenerEvent};
use super::process::{JobProcess, KillOutcome, OsProcess, kill_sequence};
use super::state::{Effect, Lifecycle, Trigger};
use super::JobError;
use crate::config::KernelConfig;
use crate::env::Env;
use crate::remote::RunRequest;

struct Job {
    command: String,
    state: JobState,
    /// Dropped once the job is dead; a dead job's handle is never used.
    process: Option<Box<dyn JobProcess>>,
    exit_code: Option<i64>,
    killed: bool,
    output_closed: bool,
    delta_applied: bool,
}

impl Job {
    fn info(&self, id: JobId) -> JobInfo {
        JobInfo {
            id,
            command: self.command.clone(),
            state: self.state,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            exit_code: self.exit_code,
        }
    }

    fn send(&mut self, id: JobId, sig: Signal) {
        if let Some(process) = self.process.as_mut()
            && let Err(e) = process.signal(sig)
        {
            tracing::warn!("job {}: {} failed: {}", id, sig, e);
        }
    }
}

/// What the front end should show for a listener event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Item(JobId, Value),
    Error(JobId, ErrorValue),
}

/// Owns every job of one interactive session.
pub struct JobControl {
    config: Arc<KernelConfig>,
    jobs: BTreeMap<JobId, Job>,
    next_id: u64,
    listener: Listener,
    events: UnboundedReceiver<ListenerEvent>,
}

impl JobControl {
    pub fn new(config: Arc<KernelConfig>) -> Result<Self, JobError> {
        let (tx, events) = unbounded_channel();
        let listener = Listener::start(config.listener_tick(), tx)?;
        Ok(Self {
            config,
            jobs: BTreeMap::new(),
            next_id: 1,
            listener,
            events,
        })
    }

    /// Start `request` in a runner process.
    pub fn launch(&mut self, request: &RunRequest, background: bool) -> Result<JobId, JobError> {
        if !background && let Some(current) = self.foreground() {
            return Err(JobError::ForegroundBusy(current));
        }
        let (process, stdout) = OsProcess::spawn(&self.config.runner, request)?;
        let state = if background {
            JobState::Background
        } else {
            JobState::Foreground
        };
        let id = self.adopt(Box::new(process), request.pipeline.describe(), state);

        let factory: ChannelFactory = Box::new(move || {
            let stdout = tokio::process::ChildStdout::from_std(stdout)?;
            Ok(Box::new(BufReader::new(stdout)) as JobChannel)
        });
        if let Err(e) = self.watch(id, factory) {
            self.kill(id)?;
            return Err(e);
        }
        Ok(id)
    }

    /// Track an already running process.
    pub fn adopt(&mut self, process: Box<dyn JobProcess>, command: String, state: JobState) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        tracing::info!("job {} started ({}): {}", id, state, command);
        self.jobs.insert(
            id,
            Job {
                command,
                state,
                process: Some(process),
                exit_code: None,
                killed: false,
                output_closed: false,
                delta_applied: false,
            },
        );
        id
    }

    /// Hand a job's result channel to the listener.
    pub fn watch(&self, id: JobId, factory: ChannelFactory) -> Result<(), JobError> {
        self.listener.register(id, factory)
    }

    pub fn foreground(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|(_, job)| job.state == JobState::Foreground)
            .map(|(id, _)| *id)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.jobs.get(&id).map(|job| job.state)
    }

    pub fn info(&self, id: JobId) -> Option<JobInfo> {
        self.jobs.get(&id).map(|job| job.info(id))
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs.iter().map(|(id, job)| job.info(*id)).collect()
    }

    /// The most recent live job that is not in the foreground.
    fn current(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .rev()
            .find(|(_, job)| job.state.is_alive() && job.state != JobState::Foreground)
            .map(|(id, _)| *id)
    }

    fn apply(&mut self, id: JobId, trigger: Trigger) -> Result<Option<KillOutcome>, JobError> {
        let wait = self.config.kill_wait();
        let job = self.jobs.get_mut(&id).ok_or(JobError::UnknownJob(id))?;
        let transition = job.state.apply(trigger);

        let mut outcome = None;
        match transition.effect {
            Effect::None => {}
            Effect::Stop => job.send(id, Signal::SIGTSTP),
            Effect::Continue => job.send(id, Signal::SIGCONT),
            Effect::Kill => {
                if let Some(process) = job.process.as_mut() {
                    let result = kill_sequence(process.as_mut(), wait);
                    outcome = Some(result);
                    job.killed = true;
                    match result {
                        KillOutcome::Terminated(code) | KillOutcome::Killed(code) => job.exit_code = Some(code),
                        KillOutcome::Unconfirmed => tracing::warn!("job {}: kill could not be confirmed", id),
                    }
                }
            }
        }

        if transition.next != job.state {
            tracing::info!("job {}: {:?} -> {:?}", id, job.state, transition.next);
        }
        job.state = transition.next;
        if job.state == JobState::Dead {
            job.process = None;
        }
        Ok(outcome)
    }

    /// Interrupt: kill the foreground job, and nothing else.
    pub fn interrupt(&mut self) -> Option<(JobId, KillOutcome)> {
        let id = self.foreground()?;
        match self.apply(id, Trigger::Interrupt) {
            Ok(outcome) => outcome.map(|o| (id, o)),
            Err(e) => {
                tracing::warn!("interrupt: {}", e);
                None
            }
        }
    }

    /// Suspend: pause the foreground job and keep background jobs running.
    pub fn suspend(&mut self) -> Option<JobId> {
        let foreground = self.foreground();
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.apply(id, Trigger::Suspend) {
                tracing::warn!("suspend job {}: {}", id, e);
            }
        }
        foreground
    }

    /// Run a job in the background. Without an id, the current job.
    pub fn bg(&mut self, id: Option<JobId>) -> Result<JobId, JobError> {
        let id = id.or_else(|| self.current()).ok_or(JobError::NoCurrentJob)?;
        self.apply(id, Trigger::Background)?;
        Ok(id)
    }

    /// Bring a job to the foreground. Without an id, the current job.
    pub fn fg(&mut self, id: Option<JobId>) -> Result<JobId, JobError> {
        let id = id.or_else(|| self.current()).ok_or(JobError::NoCurrentJob)?;
        if let Some(current) = self.foreground()
            && current != id
        {
            return Err(JobError::ForegroundBusy(current));
        }
        self.apply(id, Trigger::Foreground)?;
        Ok(id)
    }

    /// Kill a job in any live state. It is dead afterwards either way.
    pub fn kill(&mut self, id: JobId) -> Result<KillOutcome, JobError> {
        let wait = self.config.kill_wait();
        let job = self.jobs.get_mut(&id).ok_or(JobError::UnknownJob(id))?;
        let Some(process) = job.process.as_mut() else {
            return Err(JobError::ProcessGone);
        };
        if job.state == JobState::Paused {
            // A stopped process only acts on SIGTERM once continued.
            if let Err(e) = process.signal(Signal::SIGCONT) {
                tracing::debug!("job {}: {}", id, e);
            }
        }
        let outcome = kill_sequence(process.as_mut(), wait);
        job.killed = true;
        if let KillOutcome::Terminated(code) | KillOutcome::Killed(code) = outcome {
            job.exit_code = Some(code);
        }
        self.apply(id, Trigger::Exited)?;
        Ok(outcome)
    }

    /// Check live jobs for exit. Returns the jobs that died.
    pub fn reap(&mut self) -> Vec<JobId> {
        let mut exited = Vec::new();
        for (id, job) in self.jobs.iter_mut() {
            let Some(process) = job.process.as_mut() else { continue };
            match process.try_wait() {
                Ok(Some(code)) => {
                    job.exit_code = Some(code);
                    exited.push(*id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("job {}: {}", id, e),
            }
        }
        for id in &exited {
            if let Err(e) = self.apply(*id, Trigger::Exited) {
                tracing::warn!("reap job {}: {}", id, e);
            }
        }
        exited
    }

    /// Remove dead jobs whose output has been fully read.
    pub fn retire(&mut self) -> Vec<JobInfo> {
        let done: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.state == JobState::Dead && job.output_closed)
            .map(|(id, _)| *id)
            .collect();
        done.into_iter()
            .filter_map(|id| self.jobs.remove(&id).map(|job| job.info(id)))
            .collect()
    }

    /// Whether the listener has delivered everything the job will send.
    pub fn output_closed(&self, id: JobId) -> bool {
        self.jobs.get(&id).is_none_or(|job| job.output_closed)
    }

    /// The listener's event queue.
    pub fn events(&mut self) -> &mut UnboundedReceiver<ListenerEvent> {
        &mut self.events
    }

    /// Apply one listener event.
    ///
    /// Environment changes are applied to `env` at most once per job.
    /// Returns anything the front end should display.
    pub fn handle_event(&mut self, event: ListenerEvent, env: &mut Env) -> Option<JobOutput> {
        match event {
            ListenerEvent::Frame(id, Frame::Data(item)) => Some(JobOutput::Item(id, item)),
            ListenerEvent::Frame(id, Frame::Error(error)) | ListenerEvent::Frame(id, Frame::Abort(error)) => {
                Some(JobOutput::Error(id, error))
            }
            ListenerEvent::Frame(id, Frame::Env(delta)) => {
                match self.jobs.get_mut(&id) {
                    Some(job) if !job.delta_applied => {
                        job.delta_applied = true;
                        tracing::debug!("job {}: applying environment changes", id);
                        env.apply(&delta);
                    }
                    Some(_) => tracing::warn!("job {}: ignoring repeated environment changes", id),
                    None => tracing::debug!("environment changes from unknown job {}", id),
                }
                None
            }
            ListenerEvent::Frame(_, Frame::End) => None,
            ListenerEvent::Closed { job: id, clean } => {
                let job = self.jobs.get_mut(&id)?;
                job.output_closed = true;
                if clean || job.killed {
                    None
                } else {
                    Some(JobOutput::Error(
                        id,
                        ErrorValue::new("job output ended without end marker").with_origin(format!("job {}", id)),
                    ))
                }
            }
        }
    }

    /// Kill every live job and stop the listener.
    pub fn shutdown(mut self) {
        let alive: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.process.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in alive {
            if let Err(e) = self.kill(id) {
                tracing::warn!("shutdown: job {}: {}", id, e);
            }
        }
        self.listener.shutdown();
    }
}
