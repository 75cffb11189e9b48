//! obsh REPL: an interactive front end over the object-streaming engine.
//!
//! Each line is a pipeline written as JSON, for example
//! `[{"op":"generate","count":3},{"op":"map","f":"|x| x * 2"}]`, optionally
//! followed by `&` to run it in the background. Every pipeline runs as a job
//! in an `obsh-runner` child, so Ctrl-C and Ctrl-Z act on the job and never
//! on the shell.

pub mod format;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use nix::sys::signal::Signal as NixSignal;
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::signal::unix::{Signal, SignalKind, signal};

use obsh_kernel::remote::RunRequest;
use obsh_kernel::{
    Abort, Command, Env, ErrorPolicy, ExecContext, JobControl, JobOutput, KernelConfig, Pipeline, PipelineSpec, Sink,
};
use obsh_types::{ErrorValue, JobId, JobState, Value};

use crate::format::{
    OutputContext, detect_context, format_error, format_finished, format_job, format_job_output, format_value,
};

/// Returned by [`Repl::process_line`] when the user asked to leave.
#[derive(Debug, Error)]
#[error("exit requested")]
pub struct ExitRequested;

/// Result from builtin handling.
#[derive(Debug)]
enum MetaResult {
    /// Continue with optional output
    Continue(Option<String>),
    /// Exit the REPL (caller should save history and exit)
    Exit,
}

/// Output of one line, printed as it arrives or kept for the caller.
struct Transcript {
    live: bool,
    lines: Vec<String>,
}

impl Transcript {
    fn out(&mut self, line: String) {
        if self.live {
            println!("{}", line);
        } else {
            self.lines.push(line);
        }
    }

    fn err(&mut self, line: String) {
        if self.live {
            eprintln!("{}", line);
        } else {
            self.lines.push(line);
        }
    }

    fn finish(self) -> Option<String> {
        if self.lines.is_empty() {
            None
        } else {
            Some(self.lines.join("\n"))
        }
    }
}

/// The terminal signals the shell turns into job control requests.
struct TerminalSignals {
    interrupt: Signal,
    suspend: Signal,
}

impl TerminalSignals {
    /// Must be called inside the runtime.
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to watch SIGINT")?,
            suspend: signal(SignalKind::from_raw(NixSignal::SIGTSTP as i32)).context("Failed to watch SIGTSTP")?,
        })
    }

    /// Forget signals that arrived while no job was in the foreground.
    async fn drain(&mut self) {
        while let Ok(Some(())) = tokio::time::timeout(Duration::ZERO, self.interrupt.recv()).await {}
        while let Ok(Some(())) = tokio::time::timeout(Duration::ZERO, self.suspend.recv()).await {}
    }
}

/// What woke the foreground wait.
enum Wake {
    Interrupt,
    Suspend,
    Event(Option<obsh_kernel::jobs::ListenerEvent>),
    Tick,
}

/// REPL configuration and state.
pub struct Repl {
    runtime: Runtime,
    config: Arc<KernelConfig>,
    env: Env,
    jobs: JobControl,
    signals: TerminalSignals,
    context: OutputContext,
    live: bool,
}

impl Repl {
    /// Create a REPL with configuration from the default config file.
    pub fn new() -> Result<Self> {
        let config = KernelConfig::load().context("Failed to load configuration")?;
        Self::with_config(config)
    }

    /// Create a REPL with a custom kernel configuration.
    ///
    /// Output is collected and returned from [`Repl::process_line`] until
    /// [`Repl::live_output`] is switched on.
    pub fn with_config(config: KernelConfig) -> Result<Self> {
        let config = Arc::new(config);
        let runtime = Runtime::new().context("Failed to create tokio runtime")?;
        let signals = {
            let _guard = runtime.enter();
            TerminalSignals::install()?
        };
        let jobs = JobControl::new(config.clone()).context("Failed to start job control")?;

        Ok(Self {
            runtime,
            config,
            env: Env::from_process(),
            jobs,
            signals,
            context: detect_context(),
            live: false,
        })
    }

    /// Print job output as it arrives instead of returning it.
    pub fn live_output(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// The environment new jobs start in.
    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn jobs(&self) -> &JobControl {
        &self.jobs
    }

    /// Process a single line of input.
    ///
    /// Returns `Ok(None)` when there is nothing to show. Fails with
    /// [`ExitRequested`] when the line asks the REPL to exit.
    pub fn process_line(&mut self, line: &str) -> Result<Option<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if let Some(meta) = self.try_builtin(trimmed) {
            return match meta {
                MetaResult::Continue(output) => Ok(output),
                MetaResult::Exit => Err(ExitRequested.into()),
            };
        }

        let (source, background) = match trimmed.strip_suffix('&') {
            Some(rest) => (rest.trim_end(), true),
            None => (trimmed, false),
        };
        let spec: PipelineSpec = match serde_json::from_str(source) {
            Ok(spec) => spec,
            Err(e) => return Ok(Some(format!("Parse error: {}", e))),
        };
        self.launch(spec, background)
    }

    /// Announcements for background jobs: their output so far and any that
    /// finished. Called before each prompt.
    pub fn background_report(&mut self) -> Option<String> {
        let mut transcript = Transcript {
            live: self.live,
            lines: Vec::new(),
        };
        while let Ok(event) = self.jobs.events().try_recv() {
            if let Some(output) = self.jobs.handle_event(event, &mut self.env) {
                show(&mut transcript, &output, false, self.context);
            }
        }
        self.jobs.reap();
        for info in self.jobs.retire() {
            transcript.out(format_finished(&info));
        }
        transcript.finish()
    }

    /// Kill every remaining job and stop the listener.
    pub fn shutdown(self) {
        self.jobs.shutdown();
    }

    fn launch(&mut self, spec: PipelineSpec, background: bool) -> Result<Option<String>> {
        let request = RunRequest::new(spec, self.env.snapshot());
        let id = match self.jobs.launch(&request, background) {
            Ok(id) => id,
            Err(e) => return Ok(Some(format!("Error: {}", e))),
        };
        if background {
            return Ok(Some(format!("[{}] {}", id, request.pipeline.describe())));
        }
        self.wait_foreground(id)
    }

    /// Wait for the foreground job, turning terminal signals into job
    /// control requests, until it finishes or leaves the foreground.
    fn wait_foreground(&mut self, id: JobId) -> Result<Option<String>> {
        let Repl {
            runtime,
            config,
            env,
            jobs,
            signals,
            context,
            live,
        } = self;
        let tick = config.listener_tick();
        let mut transcript = Transcript {
            live: *live,
            lines: Vec::new(),
        };

        runtime.block_on(async {
            signals.drain().await;
            loop {
                let wake = tokio::select! {
                    _ = signals.interrupt.recv() => Wake::Interrupt,
                    _ = signals.suspend.recv() => Wake::Suspend,
                    event = jobs.events().recv() => Wake::Event(event),
                    _ = tokio::time::sleep(tick) => Wake::Tick,
                };

                match wake {
                    Wake::Interrupt => {
                        if let Some((job, outcome)) = jobs.interrupt() {
                            tracing::info!("job {} interrupted: {:?}", job, outcome);
                        }
                    }
                    Wake::Suspend => {
                        jobs.suspend();
                    }
                    Wake::Event(Some(event)) => {
                        if let Some(output) = jobs.handle_event(event, env) {
                            let foreground = job_of(&output) == id;
                            show(&mut transcript, &output, foreground, *context);
                        }
                    }
                    Wake::Event(None) => return Err(anyhow!("job listener stopped")),
                    Wake::Tick => {
                        jobs.reap();
                    }
                }

                match jobs.state(id) {
                    Some(JobState::Foreground) => {}
                    Some(JobState::Dead) | None => {
                        if jobs.output_closed(id) {
                            return Ok(());
                        }
                    }
                    Some(JobState::Paused) | Some(JobState::Background) => {
                        if let Some(info) = jobs.info(id) {
                            transcript.out(format!("\n[{}] {:<10}{}", id, info.state.to_string(), info.command));
                        }
                        return Ok(());
                    }
                }
            }
        })?;

        // The foreground job was reported as it ran; don't announce it again.
        for info in jobs.retire() {
            if info.id != id {
                transcript.out(format_finished(&info));
            }
        }
        Ok(transcript.finish())
    }

    /// Try to handle a builtin. Returns `None` for pipelines.
    fn try_builtin(&mut self, cmd: &str) -> Option<MetaResult> {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let command = parts.first().copied().unwrap_or("");
        let arg = parts.get(1).copied();

        let result = match command {
            "exit" | "quit" => return Some(MetaResult::Exit),
            "help" => Some(HELP_TEXT.trim_end().to_string()),
            "jobs" => {
                let jobs = self.jobs.list();
                if jobs.is_empty() {
                    Some("(no jobs)".to_string())
                } else {
                    Some(jobs.iter().map(format_job).collect::<Vec<_>>().join("\n"))
                }
            }
            "fg" => match parse_job(arg).and_then(|id| self.jobs.fg(id).map_err(Into::into)) {
                Ok(id) => match self.wait_foreground(id) {
                    Ok(output) => output,
                    Err(e) => Some(format!("fg: {}", e)),
                },
                Err(e) => Some(format!("fg: {}", e)),
            },
            "bg" => match parse_job(arg).and_then(|id| self.jobs.bg(id).map_err(Into::into)) {
                Ok(id) => {
                    let command = self.jobs.info(id).map(|info| info.command).unwrap_or_default();
                    Some(format!("[{}] {} &", id, command))
                }
                Err(e) => Some(format!("bg: {}", e)),
            },
            "kill" => {
                let killed = parse_job(arg)
                    .and_then(|id| id.ok_or_else(|| anyhow!("usage: kill N")))
                    .and_then(|id| self.jobs.kill(id).map(|outcome| (id, outcome)).map_err(Into::into));
                match killed {
                    Ok((id, outcome)) => Some(format!("[{}] {:?}", id, outcome)),
                    Err(e) => Some(format!("kill: {}", e)),
                }
            }
            "cd" => self.cd(arg).err().map(|e| format!("cd: {}", e)),
            "pwd" => Some(self.env.cwd().display().to_string()),
            _ => return None,
        };
        Some(MetaResult::Continue(result))
    }

    fn cd(&mut self, arg: Option<&str>) -> Result<()> {
        let target = match arg {
            Some(dir) => self.env.resolve(dir),
            None => directories::BaseDirs::new()
                .map(|dirs| dirs.home_dir().to_path_buf())
                .context("no home directory")?,
        };
        if !target.is_dir() {
            return Err(anyhow!("{}: not a directory", target.display()));
        }
        self.env.set_cwd(target);
        Ok(())
    }
}

fn job_of(output: &JobOutput) -> JobId {
    match output {
        JobOutput::Item(id, _) | JobOutput::Error(id, _) => *id,
    }
}

fn show(transcript: &mut Transcript, output: &JobOutput, foreground: bool, context: OutputContext) {
    let line = format_job_output(output, foreground, context);
    match output {
        JobOutput::Item(..) => transcript.out(line),
        JobOutput::Error(..) => transcript.err(line),
    }
}

/// `N` or `%N`; no argument means the current job.
fn parse_job(arg: Option<&str>) -> Result<Option<JobId>> {
    arg.map(|a| {
        a.trim_start_matches('%')
            .parse::<u64>()
            .map(JobId)
            .map_err(|_| anyhow!("{}: not a job number", a))
    })
    .transpose()
}

const HELP_TEXT: &str = r#"obsh: the object shell

Each line is a pipeline as a JSON list of operators. End it with & to run
it in the background.

  [{"op":"generate","count":5},{"op":"map","f":"|x| x * x"}]
  [{"op":"fork","workers":[{"slot":0},{"slot":1}],"template":[{"op":"generate","count":2}],"tag":true}]
  [{"op":"sleep","ms":60000}] &

Builtins:
  jobs                       List jobs
  fg [N]                     Bring job N (or the current job) to the foreground
  bg [N]                     Continue job N (or the current job) in the background
  kill N                     Kill job N
  cd [DIR]                   Change the directory new jobs start in
  pwd                        Show that directory
  help                       Show this help
  exit, quit                 Leave the shell

Ctrl-C kills the foreground job. Ctrl-Z stops it.
"#;

/// Prints pipeline output as it arrives.
struct Printer {
    context: OutputContext,
}

#[async_trait]
impl Sink for Printer {
    async fn send(&mut self, item: Value, _env: &mut Env) -> Result<(), Abort> {
        println!("{}", format_value(&item, self.context));
        Ok(())
    }

    async fn send_error(&mut self, error: ErrorValue, _env: &mut Env) -> Result<(), Abort> {
        eprintln!("{}", format_error(&error));
        Ok(())
    }
}

/// Run one pipeline in this process and print its results.
pub fn run_command(source: &str) -> Result<ExitCode> {
    let spec: PipelineSpec = serde_json::from_str(source).context("Failed to parse pipeline")?;
    let config = Arc::new(KernelConfig::load().context("Failed to load configuration")?);
    let runtime = Runtime::new().context("Failed to create tokio runtime")?;

    let result = runtime.block_on(async {
        let pipeline = Pipeline::from_spec(&spec)?;
        let ctx = ExecContext::new(Env::from_process(), config);
        let mut command = Command::new(pipeline, ctx).with_policy(ErrorPolicy::Forward);
        let mut printer = Printer {
            context: detect_context(),
        };
        command.execute(Vec::new(), &mut printer).await
    });

    match result {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(abort) => {
            eprintln!("{}", format_error(&abort.to_error_value()));
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Save REPL history to disk.
fn save_history(rl: &mut Editor<(), DefaultHistory>, history_path: &Option<PathBuf>) {
    if let Some(path) = history_path {
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create history directory: {}", e);
        }
        if let Err(e) = rl.save_history(path) {
            tracing::warn!("Failed to save history: {}", e);
        }
    }
}

/// Run the REPL.
pub fn run() -> Result<()> {
    println!("obsh v{}", env!("CARGO_PKG_VERSION"));
    println!("Type help for commands, exit to quit.");

    let mut rl: Editor<(), DefaultHistory> = Editor::new().context("Failed to create editor")?;

    let history_path = directories::BaseDirs::new().map(|b| b.data_dir().join("obsh").join("history.txt"));
    if let Some(ref path) = history_path
        && let Err(e) = rl.load_history(path)
    {
        // A missing history file is expected on first run.
        let is_not_found = matches!(&e, ReadlineError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound);
        if !is_not_found {
            tracing::warn!("Failed to load history: {}", e);
        }
    }

    let mut repl = Repl::new()?.live_output(true);
    println!();

    loop {
        if let Some(report) = repl.background_report() {
            println!("{}", report);
        }

        match rl.readline("obsh> ") {
            Ok(line) => {
                if let Err(e) = rl.add_history_entry(line.as_str()) {
                    tracing::warn!("Failed to add history entry: {}", e);
                }

                match repl.process_line(&line) {
                    Ok(Some(output)) => println!("{}", output),
                    Ok(None) => {}
                    Err(e) if e.is::<ExitRequested>() => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }

    save_history(&mut rl, &history_path);
    repl.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn repl() -> Repl {
        Repl::with_config(KernelConfig::default()).expect("repl")
    }

    #[test]
    fn test_empty_line() {
        let mut repl = repl();
        assert_eq!(repl.process_line("   ").unwrap(), None);
        repl.shutdown();
    }

    #[test]
    fn test_exit_is_typed() {
        let mut repl = repl();
        let err = repl.process_line("exit").unwrap_err();
        assert!(err.is::<ExitRequested>());
        repl.shutdown();
    }

    #[test]
    fn test_parse_error_is_reported() {
        let mut repl = repl();
        let output = repl.process_line("generate | head").unwrap().unwrap();
        assert!(output.starts_with("Parse error"));
        repl.shutdown();
    }

    #[test]
    fn test_jobs_empty() {
        let mut repl = repl();
        assert_eq!(repl.process_line("jobs").unwrap().as_deref(), Some("(no jobs)"));
        repl.shutdown();
    }

    #[test]
    fn test_fg_without_jobs() {
        let mut repl = repl();
        let output = repl.process_line("fg").unwrap().unwrap();
        assert_eq!(output, "fg: no current job");
        repl.shutdown();
    }

    #[test]
    fn test_kill_needs_job_number() {
        let mut repl = repl();
        assert_eq!(repl.process_line("kill").unwrap().as_deref(), Some("kill: usage: kill N"));
        assert!(repl.process_line("kill %x").unwrap().unwrap().contains("not a job number"));
        repl.shutdown();
    }

    #[test]
    fn test_cd_changes_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut repl = repl();
        let line = format!("cd {}", dir.path().display());
        assert_eq!(repl.process_line(&line).unwrap(), None);
        assert_eq!(repl.env().cwd(), dir.path());
        assert_eq!(repl.process_line("pwd").unwrap().unwrap(), dir.path().display().to_string());
        repl.shutdown();
    }

    #[test]
    fn test_cd_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut repl = repl();
        let before = repl.env().cwd().to_path_buf();
        let line = format!("cd {}", dir.path().join("missing").display());
        assert!(repl.process_line(&line).unwrap().unwrap().starts_with("cd: "));
        assert_eq!(repl.env().cwd(), before);
        repl.shutdown();
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some("%3"), Some(JobId(3)))]
    #[case(Some("7"), Some(JobId(7)))]
    #[case(Some("%%12"), Some(JobId(12)))]
    fn test_parse_job(#[case] arg: Option<&str>, #[case] expected: Option<JobId>) {
        assert_eq!(parse_job(arg).unwrap(), expected);
    }

    #[rstest]
    #[case("x")]
    #[case("%")]
    #[case("-1")]
    #[case("%3x")]
    fn test_parse_job_rejects(#[case] arg: &str) {
        let err = parse_job(Some(arg)).unwrap_err();
        assert!(err.to_string().contains("not a job number"), "{}", err);
    }
}
