//! The operator protocol.
//!
//! An [`Operator`] is one stage of a pipeline. It moves through
//! `Constructed → setup_1 → setup_2 → running → flushed → cleaned`:
//!
//! - `setup_1` does node-local initialisation after argument binding.
//! - `setup_2` runs after every node's `setup_1`, so fan-out nodes can copy
//!   their templates before anything is specialised or started.
//! - `run` starts a source (the "receive nothing" call); `receive` handles one
//!   upstream item; `receive_error` handles one upstream error value.
//! - `flush` is called exactly once per run, after every `receive`, and may
//!   emit buffered output.
//!
//! A node sends downstream through its [`Emitter`], which is the node's
//! resolved receiver for the duration of the call: the rest of the chain,
//! then whatever consumes the enclosing pipeline.
//!
//! `receive` must not abort for one bad item; it emits an `ErrorValue` with
//! [`Emitter::send_error`] instead. Returning `Err(Abort)` unwinds the whole
//! command.

use async_trait::async_trait;

use obsh_types::{ErrorValue, Value};

use crate::command::ExecContext;
use crate::env::Env;
use crate::error::Abort;

/// One stage of a pipeline.
#[async_trait]
pub trait Operator: Send {
    /// Operator name, used in error values and logs.
    fn name(&self) -> &str;

    /// Sources generate output from nothing and reject upstream input.
    fn must_be_first(&self) -> bool {
        false
    }

    async fn setup_1(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        Ok(())
    }

    async fn setup_2(&mut self, _ctx: &ExecContext) -> Result<(), Abort> {
        Ok(())
    }

    /// Start a source. Only the head of a pipeline is started.
    async fn run(&mut self, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command(self.name(), "needs upstream input"))
    }

    async fn receive(&mut self, item: Value, out: &mut Emitter<'_>) -> Result<(), Abort>;

    async fn receive_error(&mut self, error: ErrorValue, out: &mut Emitter<'_>) -> Result<(), Abort> {
        out.send_error(error).await
    }

    async fn flush(&mut self, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Ok(())
    }

    /// Release per-run resources. Called even when the run aborted.
    async fn cleanup(&mut self) {}
}

/// Whatever consumes the output of a pipeline as a whole.
#[async_trait]
pub trait Sink: Send {
    async fn send(&mut self, item: Value, env: &mut Env) -> Result<(), Abort>;

    async fn send_error(&mut self, error: ErrorValue, env: &mut Env) -> Result<(), Abort>;
}

/// The downstream of one node during one call.
///
/// Holds the nodes after the caller in the same chain and the sink that
/// receives the chain's output, plus the environment of the running command.
pub struct Emitter<'a> {
    rest: &'a mut [Box<dyn Operator>],
    sink: &'a mut dyn Sink,
    env: &'a mut Env,
}

impl<'a> Emitter<'a> {
    pub fn new(rest: &'a mut [Box<dyn Operator>], sink: &'a mut dyn Sink, env: &'a mut Env) -> Self {
        Self { rest, sink, env }
    }

    /// An emitter that goes straight to the sink.
    pub fn terminal(sink: &'a mut dyn Sink, env: &'a mut Env) -> Self {
        Self {
            rest: &mut [],
            sink,
            env,
        }
    }

    pub async fn send(&mut self, item: Value) -> Result<(), Abort> {
        match self.rest.split_first_mut() {
            Some((next, rest)) => {
                let mut out = Emitter {
                    rest,
                    sink: &mut *self.sink,
                    env: &mut *self.env,
                };
                next.receive(item, &mut out).await
            }
            None => self.sink.send(item, self.env).await,
        }
    }

    pub async fn send_error(&mut self, error: ErrorValue) -> Result<(), Abort> {
        match self.rest.split_first_mut() {
            Some((next, rest)) => {
                let mut out = Emitter {
                    rest,
                    sink: &mut *self.sink,
                    env: &mut *self.env,
                };
                next.receive_error(error, &mut out).await
            }
            None => self.sink.send_error(error, self.env).await,
        }
    }

    pub fn env(&self) -> &Env {
        self.env
    }

    pub fn env_mut(&mut self) -> &mut Env {
        self.env
    }

    /// Split into a sink that forwards to this emitter's downstream and the
    /// environment, so a nested chain can run with this emitter as its sink.
    pub fn forward(&mut self) -> (Forward<'_>, &mut Env) {
        (
            Forward {
                rest: &mut *self.rest,
                sink: &mut *self.sink,
            },
            &mut *self.env,
        )
    }
}

/// A sink that continues into an outer chain.
pub struct Forward<'a> {
    rest: &'a mut [Box<dyn Operator>],
    sink: &'a mut dyn Sink,
}

#[async_trait]
impl Sink for Forward<'_> {
    async fn send(&mut self, item: Value, env: &mut Env) -> Result<(), Abort> {
        Emitter::new(&mut *self.rest, &mut *self.sink, env).send(item).await
    }

    async fn send_error(&mut self, error: ErrorValue, env: &mut Env) -> Result<(), Abort> {
        Emitter::new(&mut *self.rest, &mut *self.sink, env)
            .send_error(error)
            .await
    }
}

/// A sink that drops everything. Used under terminal relay nodes.
pub struct Discard;

#[async_trait]
impl Sink for Discard {
    async fn send(&mut self, _item: Value, _env: &mut Env) -> Result<(), Abort> {
        Ok(())
    }

    async fn send_error(&mut self, _error: ErrorValue, _env: &mut Env) -> Result<(), Abort> {
        Ok(())
    }
}
