//! Pipeline: an ordered chain of operators that is itself an operator.
//!
//! `setup_1`/`setup_2` visit members in order; `run`/`receive` go to the
//! first member and the chain's own `send` calls carry items to the last
//! member, whose receiver is whatever consumes the pipeline as a whole. That
//! uniformity lets pipelines nest and serve as fan-out templates.

use async_trait::async_trait;

use obsh_types::{ErrorValue, Value};

use crate::command::ExecContext;
use crate::error::Abort;
use crate::op::{Emitter, Operator};
use crate::ops;
use crate::spec::{OpSpec, PipelineSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Constructed,
    Setup1,
    Ready,
    Flushed,
}

pub struct Pipeline {
    ops: Vec<Box<dyn Operator>>,
    /// How each member was built, so the pipeline can be deep-cloned and
    /// shipped. `None` for local-only members such as relays.
    specs: Vec<Option<OpSpec>>,
    phase: Phase,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            specs: Vec::new(),
            phase: Phase::Constructed,
        }
    }

    pub fn from_spec(spec: &PipelineSpec) -> Result<Self, Abort> {
        let mut pipeline = Pipeline::new();
        for op in &spec.ops {
            pipeline.append_spec(op.clone())?;
        }
        Ok(pipeline)
    }

    /// Append a member built from its description.
    pub fn append_spec(&mut self, spec: OpSpec) -> Result<(), Abort> {
        let op = ops::build(&spec)?;
        self.push(op, Some(spec));
        Ok(())
    }

    /// Append a member that only exists in this process.
    pub fn append(&mut self, op: Box<dyn Operator>) {
        self.push(op, None);
    }

    fn push(&mut self, op: Box<dyn Operator>, spec: Option<OpSpec>) {
        self.ops.push(op);
        self.specs.push(spec);
        self.phase = Phase::Constructed;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The serialisable description of this pipeline.
    pub fn spec(&self) -> Result<PipelineSpec, Abort> {
        let mut ops = Vec::with_capacity(self.specs.len());
        for (spec, op) in self.specs.iter().zip(&self.ops) {
            match spec {
                Some(spec) => ops.push(spec.clone()),
                None => {
                    return Err(Abort::command(
                        op.name(),
                        "local-only operator cannot be cloned or shipped",
                    ));
                }
            }
        }
        Ok(PipelineSpec::new(ops))
    }

    /// An independent copy with fresh per-run state.
    ///
    /// Nodes hold mutable run state (accumulators, counters), so a pipeline
    /// used by more than one concurrent execution must be copied first.
    pub fn deep_clone(&self) -> Result<Pipeline, Abort> {
        Pipeline::from_spec(&self.spec()?)
    }

    fn ensure_ready(&self) -> Result<(), Abort> {
        if self.phase == Phase::Ready {
            Ok(())
        } else {
            Err(Abort::Protocol(format!(
                "pipeline driven before setup completed ({:?})",
                self.phase
            )))
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for Pipeline {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn must_be_first(&self) -> bool {
        self.ops.first().is_some_and(|op| op.must_be_first())
    }

    async fn setup_1(&mut self, ctx: &ExecContext) -> Result<(), Abort> {
        if self.ops.is_empty() {
            return Err(Abort::command("pipeline", "empty pipeline"));
        }
        for (i, op) in self.ops.iter_mut().enumerate() {
            if i > 0 && op.must_be_first() {
                return Err(Abort::command(
                    op.name(),
                    "can only appear at the start of a pipeline",
                ));
            }
            op.setup_1(ctx).await?;
        }
        self.phase = Phase::Setup1;
        Ok(())
    }

    async fn setup_2(&mut self, ctx: &ExecContext) -> Result<(), Abort> {
        if self.phase != Phase::Setup1 {
            return Err(Abort::Protocol("setup_2 before setup_1".to_string()));
        }
        for op in self.ops.iter_mut() {
            op.setup_2(ctx).await?;
        }
        self.phase = Phase::Ready;
        Ok(())
    }

    async fn run(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.ensure_ready()?;
        let (mut sink, env) = out.forward();
        let Some((first, rest)) = self.ops.split_first_mut() else {
            return Ok(());
        };
        first.run(&mut Emitter::new(rest, &mut sink, env)).await
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.ensure_ready()?;
        let (mut sink, env) = out.forward();
        let Some((first, rest)) = self.ops.split_first_mut() else {
            return Ok(());
        };
        if first.must_be_first() {
            return Err(Abort::command(first.name(), "does not accept upstream input"));
        }
        first.receive(item, &mut Emitter::new(rest, &mut sink, env)).await
    }

    async fn receive_error(&mut self, error: ErrorValue, out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.ensure_ready()?;
        let (mut sink, env) = out.forward();
        let Some((first, rest)) = self.ops.split_first_mut() else {
            return Ok(());
        };
        first
            .receive_error(error, &mut Emitter::new(rest, &mut sink, env))
            .await
    }

    async fn flush(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.ensure_ready()?;
        let (mut sink, env) = out.forward();
        // Each member flushes once, in order, after everything upstream of it
        // has flushed and so has finished sending.
        for i in 0..self.ops.len() {
            let (head, tail) = self.ops.split_at_mut(i + 1);
            head[i]
                .flush(&mut Emitter::new(tail, &mut sink, &mut *env))
                .await?;
        }
        self.phase = Phase::Flushed;
        Ok(())
    }

    async fn cleanup(&mut self) {
        for op in self.ops.iter_mut() {
            op.cleanup().await;
        }
        self.phase = Phase::Constructed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::command::{Collector, Command, ExecContext};
    use crate::config::KernelConfig;
    use crate::env::Env;
    use crate::op::Sink;

    fn ctx() -> ExecContext {
        ExecContext::new(Env::new("/"), Arc::new(KernelConfig::default()))
    }

    /// Records every protocol call it sees into a shared log.
    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn boxed(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Operator> {
            Box::new(Probe {
                label,
                log: log.clone(),
            })
        }

        fn note(&self, event: impl Into<String>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, event.into()));
        }
    }

    #[async_trait]
    impl Operator for Probe {
        fn name(&self) -> &str {
            self.label
        }

        async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
            self.note("setup_1");
            Ok(())
        }

        async fn setup_2(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
            self.note("setup_2");
            Ok(())
        }

        async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
            self.note(format!("receive {}", item));
            out.send(item).await
        }

        async fn flush(&mut self, _out: &mut Emitter<'_>) -> Result<(), Abort> {
            self.note("flush");
            Ok(())
        }

        async fn cleanup(&mut self) {
            self.note("cleanup");
        }
    }

    fn events(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.append(Probe::boxed("a", &log));
        pipeline.append(Probe::boxed("b", &log));

        let mut cmd = Command::new(pipeline, ctx());
        let mut out = Collector::default();
        cmd.execute(vec![Value::Int(1), Value::Int(2)], &mut out)
            .await
            .unwrap();

        assert_eq!(
            events(&log),
            vec![
                "a:setup_1",
                "b:setup_1",
                "a:setup_2",
                "b:setup_2",
                "a:receive 1",
                "b:receive 1",
                "a:receive 2",
                "b:receive 2",
                "a:flush",
                "b:flush",
                "a:cleanup",
                "b:cleanup",
            ]
        );
        assert_eq!(out.items, vec![Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_flush_once_even_without_output() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.append(Probe::boxed("only", &log));

        let mut cmd = Command::new(pipeline, ctx());
        let mut out = Collector::default();
        cmd.execute(Vec::new(), &mut out).await.unwrap();

        let flushes = events(&log).iter().filter(|e| e.ends_with("flush")).count();
        assert_eq!(flushes, 1);
    }

    #[tokio::test]
    async fn test_nested_pipeline_forwards_to_outer_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut inner = Pipeline::new();
        inner.append(Probe::boxed("inner", &log));

        let mut outer = Pipeline::new();
        outer.append_spec(OpSpec::Generate { count: 2 }).unwrap();
        outer.append(Box::new(inner));
        outer.append(Probe::boxed("tail", &log));

        let mut cmd = Command::new(outer, ctx());
        let out = cmd.gather().await.unwrap();
        assert_eq!(out.items, vec![Value::Int(0), Value::Int(1)]);
        let seen = events(&log);
        let inner_flush = seen.iter().position(|e| e == "inner:flush").unwrap();
        let tail_flush = seen.iter().position(|e| e == "tail:flush").unwrap();
        assert!(inner_flush < tail_flush);
        assert!(seen.contains(&"tail:receive 1".to_string()));
    }

    #[tokio::test]
    async fn test_source_must_be_first() {
        let mut pipeline = Pipeline::new();
        pipeline.append_spec(OpSpec::map("|x| x")).unwrap();
        pipeline.append_spec(OpSpec::Generate { count: 1 }).unwrap();

        let err = pipeline.setup_1(&ctx()).await.unwrap_err();
        assert!(matches!(err, Abort::Command { ref op, .. } if op == "generate"));
    }

    #[tokio::test]
    async fn test_receive_before_setup_is_rejected() {
        let mut pipeline = Pipeline::from_spec(&PipelineSpec::new(vec![OpSpec::map("|x| x")])).unwrap();
        let mut env = Env::new("/");
        let mut sink = Collector::default();
        let mut out = Emitter::terminal(&mut sink as &mut dyn Sink, &mut env);
        let err = pipeline.receive(Value::Int(1), &mut out).await.unwrap_err();
        assert!(matches!(err, Abort::Protocol(_)));
    }

    #[tokio::test]
    async fn test_deep_clone_has_independent_state() {
        let spec = PipelineSpec::new(vec![OpSpec::Generate { count: 5 }, OpSpec::Head { count: 2 }]);
        let original = Pipeline::from_spec(&spec).unwrap();
        let copy = original.deep_clone().unwrap();

        let mut first = Command::new(original, ctx());
        let mut second = Command::new(copy, ctx());
        assert_eq!(first.gather().await.unwrap().items.len(), 2);
        assert_eq!(second.gather().await.unwrap().items.len(), 2);
    }

    #[test]
    fn test_local_only_member_cannot_be_cloned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.append(Probe::boxed("probe", &log));
        assert!(pipeline.deep_clone().is_err());
    }
}
