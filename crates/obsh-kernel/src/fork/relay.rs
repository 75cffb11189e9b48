//! Relay: the terminal node of a worker's pipeline.
//!
//! Instead of passing items to a local receiver, the relay serialises each
//! item and error onto the channel back to the parent. The executor that
//! appended it keeps a second handle on the same writer to send the final
//! abort, environment and end frames.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use obsh_types::{ErrorValue, Frame, Value};

use crate::error::Abort;
use crate::op::{Emitter, Operator};
use crate::wire::FrameWriter;

pub type RelayOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// A frame writer shared between the relay and its executor.
pub type SharedWriter = Arc<Mutex<FrameWriter<RelayOutput>>>;

pub fn shared_writer(output: RelayOutput) -> SharedWriter {
    Arc::new(Mutex::new(FrameWriter::new(output)))
}

pub struct Relay {
    writer: SharedWriter,
    tag: Option<Value>,
}

impl Relay {
    pub fn new(writer: SharedWriter) -> Self {
        Self { writer, tag: None }
    }

    /// Send every item as `[tag, item]`.
    pub fn tagged(mut self, tag: Value) -> Self {
        self.tag = Some(tag);
        self
    }

    async fn write(&self, frame: Frame) -> Result<(), Abort> {
        self.writer.lock().await.write(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl Operator for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn receive(&mut self, item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        let item = match &self.tag {
            Some(tag) => Value::List(vec![tag.clone(), item]),
            None => item,
        };
        self.write(Frame::Data(item)).await
    }

    async fn receive_error(&mut self, error: ErrorValue, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        self.write(Frame::Error(error)).await
    }
}
