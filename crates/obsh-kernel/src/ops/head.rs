//! head and window: counting operators.

use async_trait::async_trait;

use obsh_types::Value;

use crate::command::ExecContext;
use crate::error::Abort;
use crate::op::{Emitter, Operator};

/// Passes the first `count` items and drops the rest.
pub struct Head {
    count: usize,
    passed: usize,
}

impl Head {
    pub fn new(count: usize) -> Self {
        Self { count, passed: 0 }
    }
}

#[async_trait]
impl Operator for Head {
    fn name(&self) -> &str {
        "head"
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        self.passed = 0;
        Ok(())
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        if self.passed < self.count {
            self.passed += 1;
            out.send(item).await
        } else {
            Ok(())
        }
    }
}

/// Groups consecutive items into lists of `size`.
///
/// A final partial group is emitted at flush.
pub struct Window {
    size: usize,
    current: Vec<Value>,
}

impl Window {
    pub fn new(size: usize) -> Result<Self, Abort> {
        if size == 0 {
            return Err(Abort::command("window", "size must be at least 1"));
        }
        Ok(Self {
            size,
            current: Vec::with_capacity(size),
        })
    }
}

#[async_trait]
impl Operator for Window {
    fn name(&self) -> &str {
        "window"
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.current.push(item);
        if self.current.len() == self.size {
            let group = std::mem::replace(&mut self.current, Vec::with_capacity(self.size));
            out.send(Value::List(group)).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        if !self.current.is_empty() {
            let group = std::mem::take(&mut self.current);
            out.send(Value::List(group)).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.current.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::command::{Command, ExecContext};
    use crate::config::KernelConfig;
    use crate::env::Env;
    use crate::pipeline::Pipeline;
    use crate::spec::{OpSpec, PipelineSpec};
    use obsh_types::Value;

    async fn gather(ops: Vec<OpSpec>) -> Vec<Value> {
        let pipeline = Pipeline::from_spec(&PipelineSpec::new(ops)).unwrap();
        let ctx = ExecContext::new(Env::new("/"), Arc::new(KernelConfig::default()));
        Command::new(pipeline, ctx).gather().await.unwrap().items
    }

    #[tokio::test]
    async fn test_head() {
        let items = gather(vec![OpSpec::Generate { count: 10 }, OpSpec::Head { count: 3 }]).await;
        assert_eq!(items, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_window_flushes_partial_group() {
        let items = gather(vec![OpSpec::Generate { count: 5 }, OpSpec::Window { size: 2 }]).await;
        assert_eq!(
            items,
            vec![
                Value::List(vec![Value::Int(0), Value::Int(1)]),
                Value::List(vec![Value::Int(2), Value::Int(3)]),
                Value::List(vec![Value::Int(4)]),
            ]
        );
    }

    #[test]
    fn test_window_of_zero_is_rejected() {
        let spec = PipelineSpec::new(vec![OpSpec::Window { size: 0 }]);
        assert!(Pipeline::from_spec(&spec).is_err());
    }
}
