//! Starting workers.
//!
//! A [`Launcher`] turns a worker identity plus a [`RunRequest`] into a
//! running worker: something producing result frames on a byte channel, and
//! a handle to wait for or kill it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use obsh_types::WorkerId;

use crate::config::KernelConfig;
use crate::error::Abort;
use crate::remote::{RunRequest, run_request};
use crate::wire::write_json_line;

/// Buffer size of the in-memory pipe between an in-process worker and the fork.
pub const CHANNEL_CAPACITY: usize = 64 * 1024;

pub type WorkerOutput = Box<dyn AsyncBufRead + Send + Unpin>;

/// The execution side of a worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Wait up to `grace` for the worker to finish.
    ///
    /// Returns `true` once it has exited.
    async fn wait_exit(&mut self, grace: Duration) -> bool;

    /// Stop the worker. Must not block indefinitely.
    async fn kill(&mut self);
}

pub struct WorkerHandle {
    pub id: WorkerId,
    pub output: WorkerOutput,
    pub process: Box<dyn WorkerProcess>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, id: &WorkerId, request: RunRequest) -> Result<WorkerHandle, Abort>;
}

/// The launcher selected by configuration.
pub fn launcher_for(config: &Arc<KernelConfig>) -> Arc<dyn Launcher> {
    match config.worker_mode {
        crate::config::WorkerMode::Process => Arc::new(ProcessLauncher::new(config.clone())),
        crate::config::WorkerMode::InProcess => Arc::new(InProcessLauncher::new(config.clone())),
    }
}

/// Runs each worker as a runner child process.
///
/// Local slots run the local runner directly, hosts go through the ssh
/// prefix, and elevated workers through the elevation prefix. The request is
/// written to the child's stdin, which stays open so a termination signal can
/// still be sent to a remote runner.
pub struct ProcessLauncher {
    config: Arc<KernelConfig>,
}

impl ProcessLauncher {
    pub fn new(config: Arc<KernelConfig>) -> Self {
        Self { config }
    }

    /// The program and arguments that start the runner for `id`.
    pub fn argv(&self, id: &WorkerId) -> Vec<String> {
        let runner = self.config.runner.to_string_lossy().into_owned();
        match id {
            WorkerId::Slot(_) => vec![runner],
            WorkerId::Host(host) => {
                let mut argv = self.config.ssh.clone();
                argv.push(host.clone());
                argv.push(self.config.remote_runner.clone());
                argv
            }
            WorkerId::Elevated => {
                let mut argv = self.config.elevate.clone();
                argv.push(runner);
                argv
            }
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, id: &WorkerId, request: RunRequest) -> Result<WorkerHandle, Abort> {
        let argv = self.argv(id);
        let Some((program, args)) = argv.split_first() else {
            return Err(Abort::command("fork", format!("empty command for worker {}", id)));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Abort::command("fork", format!("cannot start {} for {}: {}", program, id, e)))?;
        tracing::debug!("launched worker {} (pid {:?}): {:?}", id, child.id(), argv);

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Abort::Transport(format!("worker {} has no pipes", id)));
        };
        write_json_line(&mut stdin, &request).await?;

        Ok(WorkerHandle {
            id: id.clone(),
            output: Box::new(BufReader::new(stdout)),
            process: Box::new(ChildWorker {
                child,
                stdin: Some(stdin),
                remote: matches!(id, WorkerId::Host(_)),
            }),
        })
    }
}

struct ChildWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    remote: bool,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    async fn wait_exit(&mut self, grace: Duration) -> bool {
        // End of input tells the runner nothing more is coming.
        self.stdin = None;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("worker {:?} exited: {}", self.child.id(), status);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("waiting for worker failed: {}", e);
                true
            }
            Err(_) => false,
        }
    }

    async fn kill(&mut self) {
        // A remote runner can only be reached through its input channel.
        if self.remote
            && let Some(stdin) = self.stdin.as_mut()
        {
            let signo = nix::sys::signal::Signal::SIGTERM as i32;
            if let Err(e) = write_json_line(stdin, &signo).await {
                tracing::debug!("cannot signal remote runner: {}", e);
            }
        }
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("kill worker: {}", e);
        }
        let _ = tokio::time::timeout(Duration::from_millis(200), self.child.wait()).await;
    }
}

/// Runs each worker as a task on the current runtime.
///
/// Frames cross an in-memory pipe, so everything the worker sends goes
/// through the same serialisation as a process worker. Only one direction of
/// the pipe is used; dropping the worker's end reads as end of output.
pub struct InProcessLauncher {
    config: Arc<KernelConfig>,
}

impl InProcessLauncher {
    pub fn new(config: Arc<KernelConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self, id: &WorkerId, request: RunRequest) -> Result<WorkerHandle, Abort> {
        let (writer, reader) = tokio::io::duplex(CHANNEL_CAPACITY);
        let config = self.config.clone();
        let worker = id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_request(request, Box::new(writer), config).await {
                tracing::debug!("in-process worker {} stopped: {}", worker, e);
            }
        });
        tracing::debug!("launched in-process worker {}", id);

        Ok(WorkerHandle {
            id: id.clone(),
            output: Box::new(BufReader::new(reader)),
            process: Box::new(TaskWorker { task }),
        })
    }
}

struct TaskWorker {
    task: JoinHandle<()>,
}

#[async_trait]
impl WorkerProcess for TaskWorker {
    async fn wait_exit(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, &mut self.task).await.is_ok()
    }

    async fn kill(&mut self) {
        self.task.abort();
    }
}
