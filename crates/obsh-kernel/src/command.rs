//! Command: a bound pipeline plus its environment.
//!
//! A command drives one run of its pipeline through the full lifecycle:
//! `setup_1` on every node, `setup_2` on every node, then either `run` (when
//! the pipeline starts with a source) or one `receive` per input item, then
//! `flush`, then `cleanup`. Cleanup happens even when the run aborts.

use std::sync::Arc;

use async_trait::async_trait;

use obsh_types::{EnvDelta, ErrorValue, Value};

use crate::config::KernelConfig;
use crate::env::Env;
use crate::error::Abort;
use crate::fork::{Launcher, launcher_for};
use crate::op::{Emitter, Operator, Sink};
use crate::pipeline::Pipeline;

/// Everything a node may consult during setup.
#[derive(Clone)]
pub struct ExecContext {
    pub env: Env,
    pub config: Arc<KernelConfig>,
    pub launcher: Arc<dyn Launcher>,
}

impl ExecContext {
    pub fn new(env: Env, config: Arc<KernelConfig>) -> Self {
        let launcher = launcher_for(&config);
        Self {
            env,
            config,
            launcher,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }
}

/// What happens to an error value that reaches the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Print it and continue.
    #[default]
    Report,
    /// Hand it to the caller's sink.
    Forward,
}

pub struct Command {
    pipeline: Pipeline,
    ctx: ExecContext,
    policy: ErrorPolicy,
}

impl Command {
    pub fn new(pipeline: Pipeline, ctx: ExecContext) -> Self {
        Self {
            pipeline,
            ctx,
            policy: ErrorPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn env(&self) -> &Env {
        &self.ctx.env
    }

    /// Run the pipeline once, feeding `input` unless it starts with a source.
    ///
    /// Returns the environment changes the run made.
    pub async fn execute<I>(&mut self, input: I, sink: &mut dyn Sink) -> Result<EnvDelta, Abort>
    where
        I: IntoIterator<Item = Value> + Send,
        I::IntoIter: Send,
    {
        let result = self.drive(input, sink).await;
        self.pipeline.cleanup().await;
        match &result {
            Ok(_) => tracing::debug!("command finished"),
            Err(e) => tracing::debug!("command aborted: {}", e),
        }
        result
    }

    /// Run with no input and gather everything that comes out.
    pub async fn gather(&mut self) -> Result<Collector, Abort> {
        self.policy = ErrorPolicy::Forward;
        let mut collector = Collector::default();
        self.execute(Vec::new(), &mut collector).await?;
        Ok(collector)
    }

    async fn drive<I>(&mut self, input: I, sink: &mut dyn Sink) -> Result<EnvDelta, Abort>
    where
        I: IntoIterator<Item = Value> + Send,
        I::IntoIter: Send,
    {
        self.pipeline.setup_1(&self.ctx).await?;
        self.pipeline.setup_2(&self.ctx).await?;

        let mut boundary = Boundary {
            policy: self.policy,
            inner: sink,
        };
        let env = &mut self.ctx.env;
        let mut out = Emitter::terminal(&mut boundary, env);

        if self.pipeline.must_be_first() {
            self.pipeline.run(&mut out).await?;
        } else {
            for item in input {
                self.pipeline.receive(item, &mut out).await?;
            }
        }
        self.pipeline.flush(&mut out).await?;

        Ok(self.ctx.env.take_delta())
    }
}

/// Applies the error policy at the edge of the command.
struct Boundary<'a> {
    policy: ErrorPolicy,
    inner: &'a mut dyn Sink,
}

#[async_trait]
impl Sink for Boundary<'_> {
    async fn send(&mut self, item: Value, env: &mut Env) -> Result<(), Abort> {
        self.inner.send(item, env).await
    }

    async fn send_error(&mut self, error: ErrorValue, env: &mut Env) -> Result<(), Abort> {
        match self.policy {
            ErrorPolicy::Report => {
                tracing::warn!("{}", error);
                eprintln!("{}", error);
                Ok(())
            }
            ErrorPolicy::Forward => self.inner.send_error(error, env).await,
        }
    }
}

/// A sink that keeps everything, for API callers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Collector {
    pub items: Vec<Value>,
    pub errors: Vec<ErrorValue>,
}

#[async_trait]
impl Sink for Collector {
    async fn send(&mut self, item: Value, _env: &mut Env) -> Result<(), Abort> {
        self.items.push(item);
        Ok(())
    }

    async fn send_error(&mut self, error: ErrorValue, _env: &mut Env) -> Result<(), Abort> {
        self.errors.push(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{OpSpec, PipelineSpec};
    use std::path::PathBuf;

    fn ctx() -> ExecContext {
        ExecContext::new(Env::new("/"), Arc::new(KernelConfig::default()))
    }

    fn command(ops: Vec<OpSpec>) -> Command {
        let pipeline = Pipeline::from_spec(&PipelineSpec::new(ops)).unwrap();
        Command::new(pipeline, ctx())
    }

    #[tokio::test]
    async fn test_gather_source_pipeline() {
        let mut cmd = command(vec![OpSpec::Generate { count: 3 }]);
        let out = cmd.gather().await.unwrap();
        assert_eq!(out.items, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_feeds_input_when_not_a_source() {
        let mut cmd = command(vec![OpSpec::map("|x| x + 1")]);
        let mut out = Collector::default();
        cmd.execute(vec![Value::Int(1), Value::Int(2)], &mut out)
            .await
            .unwrap();
        assert_eq!(out.items, vec![Value::Int(2), Value::Int(3)]);
    }

    #[tokio::test]
    async fn test_item_error_keeps_position() {
        let mut cmd = command(vec![
            OpSpec::Values {
                items: vec![Value::Int(1), Value::Int(0), Value::Int(2)],
            },
            OpSpec::map("|x| 10 / x"),
        ]);
        let mut out = Interleaved::default();
        cmd = cmd.with_policy(ErrorPolicy::Forward);
        cmd.execute(Vec::new(), &mut out).await.unwrap();
        assert_eq!(
            out.seen,
            vec!["10".to_string(), "error: division by zero".to_string(), "5".to_string()]
        );
    }

    #[tokio::test]
    async fn test_report_policy_swallows_errors() {
        let mut cmd = command(vec![
            OpSpec::Values {
                items: vec![Value::Int(0)],
            },
            OpSpec::map("|x| 1 / x"),
        ]);
        let mut out = Collector::default();
        cmd.execute(Vec::new(), &mut out).await.unwrap();
        assert!(out.items.is_empty());
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_setup_abort_is_command_fatal() {
        let mut cmd = command(vec![OpSpec::Generate { count: 1 }, OpSpec::map("|x| (x")]);
        let err = cmd.gather().await.unwrap_err();
        assert!(matches!(err, Abort::Command { ref op, .. } if op == "map"));
    }

    #[tokio::test]
    async fn test_returns_env_delta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let mut cmd = command(vec![OpSpec::Cd { path: path.clone() }]);
        let mut out = Collector::default();
        let delta = cmd.execute(Vec::new(), &mut out).await.unwrap();
        assert_eq!(delta.cwd, Some(path.clone()));
        assert_eq!(cmd.env().cwd(), path.as_path());
    }

    #[tokio::test]
    async fn test_missing_directory_aborts() {
        let mut cmd = command(vec![OpSpec::Cd {
            path: PathBuf::from("/definitely/not/here"),
        }]);
        assert!(cmd.gather().await.is_err());
    }

    /// Records items and errors in arrival order.
    #[derive(Default)]
    struct Interleaved {
        seen: Vec<String>,
    }

    #[async_trait]
    impl Sink for Interleaved {
        async fn send(&mut self, item: Value, _env: &mut Env) -> Result<(), Abort> {
            self.seen.push(item.to_string());
            Ok(())
        }

        async fn send_error(&mut self, error: ErrorValue, _env: &mut Env) -> Result<(), Abort> {
            self.seen.push(format!("error: {}", error.message));
            Ok(())
        }
    }
}
