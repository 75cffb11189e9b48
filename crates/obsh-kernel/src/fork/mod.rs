//! Fork Manager: runs a pipeline template once per worker and merges the
//! results into one downstream.
//!
//! ```text
//!             ┌─ clone(template) + relay ─▶ worker 0 ─┐
//!   fork ─────┼─ clone(template) + relay ─▶ worker 1 ─┼─▶ merge ─▶ downstream
//!             └─ clone(template) + relay ─▶ worker N ─┘
//! ```
//!
//! Copies are made in `setup_2`, after the whole pipeline has finished
//! `setup_1`, and each copy is then customised for its worker. At run time
//! every worker is launched, its frames are read until the end marker, and
//! finally every worker is waited for. A worker whose channel closes without
//! an end marker is reported as truncated; one that does not exit within the
//! grace period is reported as leaked and killed.
//!
//! Within one worker, items keep their production order. Across workers the
//! order depends on the [`MergePolicy`].

mod launch;
mod relay;

pub use launch::{
    CHANNEL_CAPACITY, InProcessLauncher, Launcher, ProcessLauncher, WorkerHandle, WorkerOutput, WorkerProcess, launcher_for,
};
pub use relay::{Relay, RelayOutput, SharedWriter, shared_writer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use obsh_types::{ErrorValue, Frame, Value, WorkerId};

use crate::command::ExecContext;
use crate::error::{Abort, WireError};
use crate::op::{Emitter, Operator};
use crate::remote::RunRequest;
use crate::spec::PipelineSpec;
use crate::wire::FrameReader;

/// How output from several workers is interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Whichever worker has a frame ready first.
    #[default]
    Arrival,
    /// All of worker 0, then all of worker 1, and so on. Deterministic.
    WorkerOrder,
}

/// Tailors the template for one worker.
pub type Customize = Arc<dyn Fn(PipelineSpec, &WorkerId) -> PipelineSpec + Send + Sync>;

/// Something a worker's channel produced.
enum Event {
    Frame(Frame),
    /// The channel closed before the end marker.
    Truncated,
    Failed(WireError),
}

/// The `fork` operator.
pub struct Fork {
    template: PipelineSpec,
    workers: Vec<WorkerId>,
    tag: bool,
    bind: Option<String>,
    merge: Option<MergePolicy>,
    customize: Option<Customize>,

    // Prepared in setup_2.
    requests: Vec<(WorkerId, RunRequest)>,
    launcher: Option<Arc<dyn Launcher>>,
    policy: MergePolicy,
    grace: Duration,

    /// Workers launched by the current run and not yet reaped.
    running: Vec<(WorkerId, Box<dyn WorkerProcess>)>,
}

impl Fork {
    pub fn new(template: PipelineSpec, workers: Vec<WorkerId>) -> Self {
        Self {
            template,
            workers,
            tag: false,
            bind: None,
            merge: None,
            customize: None,
            requests: Vec::new(),
            launcher: None,
            policy: MergePolicy::default(),
            grace: Duration::from_millis(500),
            running: Vec::new(),
        }
    }

    /// Attach the worker identity to every item as `[worker, item]`.
    pub fn tagged(mut self, tag: bool) -> Self {
        self.tag = tag;
        self
    }

    /// Bind the worker identity to `name` in each worker's environment.
    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bind = Some(name.into());
        self
    }

    /// Override the configured merge policy.
    pub fn merge(mut self, policy: MergePolicy) -> Self {
        self.merge = Some(policy);
        self
    }

    /// Customise the template per worker. A fork with a hook is local-only:
    /// it cannot itself be shipped.
    pub fn customize(mut self, hook: Customize) -> Self {
        self.customize = Some(hook);
        self
    }

    async fn launch_all(&mut self, out: &mut Emitter<'_>) -> Result<Vec<BoxStream<'static, (usize, Event)>>, Abort> {
        let launcher = self
            .launcher
            .clone()
            .ok_or_else(|| Abort::Protocol("fork run before setup".to_string()))?;

        let mut streams = Vec::with_capacity(self.requests.len());
        for (id, request) in std::mem::take(&mut self.requests) {
            match launcher.launch(&id, request).await {
                Ok(handle) => {
                    let index = self.running.len();
                    self.running.push((handle.id, handle.process));
                    streams.push(frames(index, handle.output));
                }
                Err(Abort::Closed) => return Err(Abort::Closed),
                Err(e) => {
                    tracing::warn!("worker {} failed to start: {}", id, e);
                    out.send_error(e.to_error_value().with_origin(id.to_string()))
                        .await?;
                }
            }
        }
        Ok(streams)
    }

    /// Wait for every launched worker; report and kill those that linger.
    async fn reap(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        for (id, mut process) in std::mem::take(&mut self.running) {
            if process.wait_exit(self.grace).await {
                continue;
            }
            tracing::warn!("worker {} did not exit within {:?}, killing", id, self.grace);
            process.kill().await;
            out.send_error(ErrorValue::new("worker did not exit after closing its channel").with_origin(id.to_string()))
                .await?;
        }
        Ok(())
    }
}

/// Pass one worker event downstream, attributing errors to `origin`.
async fn forward(origin: String, event: Event, out: &mut Emitter<'_>) -> Result<(), Abort> {
    match event {
        Event::Frame(Frame::Data(item)) => out.send(item).await,
        Event::Frame(Frame::Error(error)) => out.send_error(error.with_origin(origin)).await,
        Event::Frame(Frame::Abort(error)) => {
            tracing::debug!("worker {} aborted: {}", origin, error);
            out.send_error(error.with_origin(origin)).await
        }
        Event::Frame(Frame::Env(delta)) => {
            tracing::debug!("ignoring environment changes from worker {}: {:?}", origin, delta);
            Ok(())
        }
        Event::Frame(Frame::End) => Ok(()),
        Event::Truncated => {
            tracing::warn!("worker {} output truncated", origin);
            out.send_error(ErrorValue::new("worker output ended without end marker").with_origin(origin))
                .await
        }
        Event::Failed(e) => {
            tracing::warn!("worker {} channel failed: {}", origin, e);
            out.send_error(ErrorValue::new("worker channel failed").with_cause(e.to_string()).with_origin(origin))
                .await
        }
    }
}

/// The frames of one worker, ending after the end marker or at closure.
fn frames(index: usize, output: WorkerOutput) -> BoxStream<'static, (usize, Event)> {
    stream::unfold(Some(FrameReader::new(output)), move |reader| async move {
        let mut reader = reader?;
        match reader.next().await {
            Ok(Some(frame)) => {
                let next = if frame.is_end() { None } else { Some(reader) };
                Some(((index, Event::Frame(frame)), next))
            }
            Ok(None) => Some(((index, Event::Truncated), None)),
            Err(e) => Some(((index, Event::Failed(e)), None)),
        }
    })
    .boxed()
}

#[async_trait]
impl Operator for Fork {
    fn name(&self) -> &str {
        "fork"
    }

    fn must_be_first(&self) -> bool {
        true
    }

    async fn setup_1(&mut self, ctx: &ExecContext) -> Result<(), Abort> {
        if self.template.ops.is_empty() {
            return Err(Abort::command("fork", "empty template"));
        }
        // Building checks the template's structure before anything is launched.
        crate::pipeline::Pipeline::from_spec(&self.template)?;
        self.launcher = Some(ctx.launcher.clone());
        self.policy = self.merge.unwrap_or(ctx.config.merge);
        self.grace = ctx.config.worker_grace();
        Ok(())
    }

    async fn setup_2(&mut self, ctx: &ExecContext) -> Result<(), Abort> {
        // Copy first, then specialise each copy.
        self.requests = self
            .workers
            .iter()
            .map(|id| {
                let mut pipeline = self.template.clone();
                if let Some(hook) = &self.customize {
                    pipeline = hook(pipeline, id);
                }
                let mut env = ctx.env.snapshot();
                if let Some(name) = &self.bind {
                    env.set(name.clone(), id.to_value());
                    env.take_delta();
                }
                let mut request = RunRequest::new(pipeline, env);
                if self.tag {
                    request.tag = Some(id.clone());
                }
                (id.clone(), request)
            })
            .collect();
        Ok(())
    }

    async fn run(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let streams = self.launch_all(out).await?;
        tracing::debug!("fork: {} worker(s), {:?} merge", streams.len(), self.policy);

        let mut merged = match self.policy {
            MergePolicy::Arrival => stream::select_all(streams).boxed(),
            MergePolicy::WorkerOrder => stream::iter(streams).flatten().boxed(),
        };
        while let Some((index, event)) = merged.next().await {
            let Some((id, _)) = self.running.get(index) else { continue };
            forward(id.to_string(), event, out).await?;
        }
        drop(merged);

        self.reap(out).await
    }

    async fn receive(&mut self, _item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command("fork", "does not accept upstream input"))
    }

    async fn cleanup(&mut self) {
        for (id, mut process) in std::mem::take(&mut self.running) {
            tracing::debug!("fork cleanup: killing worker {}", id);
            process.kill().await;
        }
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Collector, Command};
    use crate::config::{KernelConfig, WorkerMode};
    use crate::env::Env;
    use crate::pipeline::Pipeline;
    use crate::spec::OpSpec;

    fn ctx() -> ExecContext {
        let config = KernelConfig {
            worker_mode: WorkerMode::InProcess,
            ..KernelConfig::default()
        };
        ExecContext::new(Env::new("/"), Arc::new(config))
    }

    async fn gather(ops: Vec<OpSpec>) -> Collector {
        let pipeline = Pipeline::from_spec(&PipelineSpec::new(ops)).unwrap();
        Command::new(pipeline, ctx()).gather().await.unwrap()
    }

    fn sorted(mut items: Vec<Value>) -> Vec<Value> {
        items.sort_by(|a, b| a.total_cmp(b));
        items
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[tokio::test]
    async fn test_three_workers_multiset_union() {
        let template = PipelineSpec::new(vec![OpSpec::Generate { count: 3 }]);
        let out = gather(vec![OpSpec::fork_slots(3, template)]).await;
        assert_eq!(sorted(out.items), ints(&[0, 0, 0, 1, 1, 1, 2, 2, 2]));
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_matches_local_run() {
        let ops = vec![
            OpSpec::Values {
                items: vec![Value::Int(4), Value::Int(0), Value::Int(2)],
            },
            OpSpec::map("|x| 8 / x"),
        ];
        let local = gather(ops.clone()).await;
        let forked = gather(vec![OpSpec::fork_slots(1, PipelineSpec::new(ops))]).await;

        assert_eq!(forked.items, local.items);
        assert_eq!(forked.errors.len(), local.errors.len());
        assert_eq!(forked.errors[0].message, local.errors[0].message);
        assert_eq!(forked.errors[0].origin.as_deref(), Some("slot 0"));
    }

    #[tokio::test]
    async fn test_worker_order_is_deterministic() {
        let template = PipelineSpec::new(vec![OpSpec::Generate { count: 2 }]);
        let fork = OpSpec::Fork {
            workers: vec![WorkerId::Slot(0), WorkerId::Slot(1)],
            template,
            tag: true,
            bind: None,
            merge: Some(MergePolicy::WorkerOrder),
        };
        let out = gather(vec![fork]).await;
        let pair = |w, i| Value::List(vec![Value::Int(w), Value::Int(i)]);
        assert_eq!(out.items, vec![pair(0, 0), pair(0, 1), pair(1, 0), pair(1, 1)]);
    }

    #[tokio::test]
    async fn test_bind_exposes_worker_identity() {
        let template = PipelineSpec::new(vec![OpSpec::Generate { count: 1 }, OpSpec::map("|x| x + w * 10")]);
        let fork = OpSpec::Fork {
            workers: vec![WorkerId::Slot(1), WorkerId::Slot(2)],
            template,
            tag: false,
            bind: Some("w".to_string()),
            merge: None,
        };
        let out = gather(vec![fork]).await;
        assert_eq!(sorted(out.items), ints(&[10, 20]));
    }

    #[tokio::test]
    async fn test_worker_abort_becomes_tagged_error() {
        let template = PipelineSpec::new(vec![OpSpec::Cd {
            path: "/definitely/not/here".into(),
        }]);
        let out = gather(vec![OpSpec::fork(vec![WorkerId::Slot(7)], template)]).await;
        assert!(out.items.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].op.as_deref(), Some("cd"));
        assert_eq!(out.errors[0].origin.as_deref(), Some("slot 7"));
    }

    #[tokio::test]
    async fn test_customize_hook_tailors_each_clone() {
        let hook: Customize = Arc::new(|spec: PipelineSpec, id: &WorkerId| match id {
            WorkerId::Slot(n) => spec.then(OpSpec::Head { count: *n }),
            _ => spec,
        });
        let fork = Fork::new(
            PipelineSpec::new(vec![OpSpec::Generate { count: 5 }]),
            vec![WorkerId::Slot(1), WorkerId::Slot(3)],
        )
        .customize(hook);

        let mut pipeline = Pipeline::new();
        pipeline.append(Box::new(fork));
        let out = Command::new(pipeline, ctx()).gather().await.unwrap();
        assert_eq!(out.items.len(), 4);
    }

    #[tokio::test]
    async fn test_truncated_worker_is_reported() {
        struct Truncating;

        #[async_trait]
        impl Launcher for Truncating {
            async fn launch(&self, id: &WorkerId, _request: RunRequest) -> Result<WorkerHandle, Abort> {
                let data: &'static [u8] = b"{\"kind\":\"data\",\"body\":{\"Int\":1}}\n";
                Ok(WorkerHandle {
                    id: id.clone(),
                    output: Box::new(tokio::io::BufReader::new(data)),
                    process: Box::new(Exited),
                })
            }
        }

        struct Exited;

        #[async_trait]
        impl WorkerProcess for Exited {
            async fn wait_exit(&mut self, _grace: Duration) -> bool {
                true
            }
            async fn kill(&mut self) {}
        }

        let pipeline = Pipeline::from_spec(&PipelineSpec::new(vec![OpSpec::fork_slots(
            1,
            PipelineSpec::new(vec![OpSpec::Generate { count: 2 }]),
        )]))
        .unwrap();
        let ctx = ctx().with_launcher(Arc::new(Truncating));
        let out = Command::new(pipeline, ctx).gather().await.unwrap();
        assert_eq!(out.items, vec![Value::Int(1)]);
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("end marker"));
    }

    #[tokio::test]
    async fn test_lingering_worker_is_reported_and_killed() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Lingering(Arc<AtomicBool>);

        #[async_trait]
        impl Launcher for Lingering {
            async fn launch(&self, id: &WorkerId, _request: RunRequest) -> Result<WorkerHandle, Abort> {
                let data: &'static [u8] = b"{\"kind\":\"end\"}\n";
                Ok(WorkerHandle {
                    id: id.clone(),
                    output: Box::new(tokio::io::BufReader::new(data)),
                    process: Box::new(Stuck(self.0.clone())),
                })
            }
        }

        struct Stuck(Arc<AtomicBool>);

        #[async_trait]
        impl WorkerProcess for Stuck {
            async fn wait_exit(&mut self, _grace: Duration) -> bool {
                false
            }
            async fn kill(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let killed = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::from_spec(&PipelineSpec::new(vec![OpSpec::fork_slots(
            1,
            PipelineSpec::new(vec![OpSpec::Generate { count: 1 }]),
        )]))
        .unwrap();
        let ctx = ctx().with_launcher(Arc::new(Lingering(killed.clone())));
        let out = Command::new(pipeline, ctx).gather().await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert!(killed.load(Ordering::SeqCst));
    }
}
