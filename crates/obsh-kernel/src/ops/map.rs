//! map and select: per-item closures.
//!
//! A closure that fails on one item yields an error value in that item's
//! place; the stream continues with the next item.

use async_trait::async_trait;

use obsh_types::Value;

use super::{compile, compiled, item_error};
use crate::command::ExecContext;
use crate::error::Abort;
use crate::eval::{Callable, Evaluable};
use crate::op::{Emitter, Operator};

/// Replace each item with `f(item)`.
pub struct Map {
    f: Evaluable,
    compiled: Option<Callable>,
}

impl Map {
    pub fn new(f: Evaluable) -> Self {
        Self { f, compiled: None }
    }
}

#[async_trait]
impl Operator for Map {
    fn name(&self) -> &str {
        "map"
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        self.compiled = Some(compile("map", &self.f)?);
        Ok(())
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let f = compiled("map", &self.compiled)?;
        match f.call(std::slice::from_ref(&item), out.env()) {
            Ok(value) => out.send(value).await,
            Err(e) => out.send_error(item_error("map", e, item)).await,
        }
    }
}

/// Keep the items for which `pred(item)` is truthy.
pub struct Select {
    pred: Evaluable,
    compiled: Option<Callable>,
}

impl Select {
    pub fn new(pred: Evaluable) -> Self {
        Self {
            pred,
            compiled: None,
        }
    }
}

#[async_trait]
impl Operator for Select {
    fn name(&self) -> &str {
        "select"
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        self.compiled = Some(compile("select", &self.pred)?);
        Ok(())
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let pred = compiled("select", &self.compiled)?;
        match pred.call(std::slice::from_ref(&item), out.env()) {
            Ok(keep) if keep.is_truthy() => out.send(item).await,
            Ok(_) => Ok(()),
            Err(e) => out.send_error(item_error("select", e, item)).await,
        }
    }
}
