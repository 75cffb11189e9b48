//! sort and unique: keyed buffering operators.

use std::collections::HashSet;

use async_trait::async_trait;

use obsh_types::Value;

use super::{compile, item_error};
use crate::command::ExecContext;
use crate::error::Abort;
use crate::eval::{Callable, Evaluable};
use crate::op::{Emitter, Operator};

/// Evaluate an optional key closure; without one the item is its own key.
fn key_of(key: &Option<Callable>, item: &Value, out: &Emitter<'_>) -> Result<Value, crate::eval::EvalError> {
    match key {
        Some(f) => f.call(std::slice::from_ref(item), out.env()),
        None => Ok(item.clone()),
    }
}

/// Buffers every item and emits them in key order at flush.
///
/// The sort is stable, so items with equal keys keep their arrival order.
pub struct Sort {
    key: Option<Evaluable>,
    reverse: bool,
    compiled: Option<Callable>,
    buffer: Vec<(Value, Value)>,
}

impl Sort {
    pub fn new(key: Option<Evaluable>, reverse: bool) -> Self {
        Self {
            key,
            reverse,
            compiled: None,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl Operator for Sort {
    fn name(&self) -> &str {
        "sort"
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        self.compiled = self.key.as_ref().map(|k| compile("sort", k)).transpose()?;
        self.buffer.clear();
        Ok(())
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        match key_of(&self.compiled, &item, out) {
            Ok(key) => {
                self.buffer.push((key, item));
                Ok(())
            }
            Err(e) => out.send_error(item_error("sort", e, item)).await,
        }
    }

    async fn flush(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let mut buffer = std::mem::take(&mut self.buffer);
        // Equal keys keep arrival order in both directions.
        if self.reverse {
            buffer.sort_by(|(a, _), (b, _)| b.total_cmp(a));
        } else {
            buffer.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        }
        for (_, item) in buffer {
            out.send(item).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.buffer.clear();
    }
}

/// Passes the first item for each distinct key.
pub struct Unique {
    key: Option<Evaluable>,
    compiled: Option<Callable>,
    seen: HashSet<String>,
}

impl Unique {
    pub fn new(key: Option<Evaluable>) -> Self {
        Self {
            key,
            compiled: None,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Operator for Unique {
    fn name(&self) -> &str {
        "unique"
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        self.compiled = self.key.as_ref().map(|k| compile("unique", k)).transpose()?;
        self.seen.clear();
        Ok(())
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        match key_of(&self.compiled, &item, out) {
            Ok(key) => {
                if self.seen.insert(key.key()) {
                    out.send(item).await
                } else {
                    Ok(())
                }
            }
            Err(e) => out.send_error(item_error("unique", e, item)).await,
        }
    }

    async fn cleanup(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use crate::command::{Command, ExecContext};
    use crate::config::KernelConfig;
    use crate::env::Env;
    use crate::eval::Evaluable;
    use crate::pipeline::Pipeline;
    use crate::spec::{OpSpec, PipelineSpec};
    use obsh_types::Value;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    async fn run(op: OpSpec, input: &[i64]) -> crate::command::Collector {
        let spec = PipelineSpec::new(vec![OpSpec::Values { items: ints(input) }, op]);
        let pipeline = Pipeline::from_spec(&spec).unwrap();
        let ctx = ExecContext::new(Env::new("/"), Arc::new(KernelConfig::default()));
        Command::new(pipeline, ctx).gather().await.unwrap()
    }

    #[rstest]
    #[case(OpSpec::sort(), &[3, 1, 2], &[1, 2, 3])]
    #[case(OpSpec::Sort { key: None, reverse: true }, &[3, 1, 2], &[3, 2, 1])]
    #[case(OpSpec::Sort { key: Some(Evaluable::new("|x| 0 - x")), reverse: false }, &[1, 3, 2], &[3, 2, 1])]
    #[case(OpSpec::Sort { key: Some(Evaluable::new("|x| x / 10")), reverse: false }, &[21, 11, 25, 12, 13], &[11, 12, 13, 21, 25])]
    #[case(OpSpec::Sort { key: Some(Evaluable::new("|x| x / 10")), reverse: true }, &[11, 25, 12, 21, 13], &[25, 21, 11, 12, 13])]
    #[case(OpSpec::Unique { key: None }, &[1, 1, 2, 1, 3], &[1, 2, 3])]
    #[case(OpSpec::Unique { key: Some(Evaluable::new("|x| x % 2")) }, &[1, 3, 2, 4], &[1, 2])]
    #[tokio::test]
    async fn test_buffering_ops(#[case] op: OpSpec, #[case] input: &[i64], #[case] expected: &[i64]) {
        let out = run(op, input).await;
        assert_eq!(out.items, ints(expected));
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_sort_key_error_drops_only_that_item() {
        let spec = PipelineSpec::new(vec![
            OpSpec::Values {
                items: vec![Value::Int(2), Value::from("x"), Value::Int(1)],
            },
            OpSpec::Sort {
                key: Some(Evaluable::new("|x| x * 1")),
                reverse: false,
            },
        ]);
        let pipeline = Pipeline::from_spec(&spec).unwrap();
        let ctx = ExecContext::new(Env::new("/"), Arc::new(KernelConfig::default()));
        let out = Command::new(pipeline, ctx).gather().await.unwrap();
        assert_eq!(out.items, ints(&[1, 2]));
        assert_eq!(out.errors.len(), 1);
    }
}
