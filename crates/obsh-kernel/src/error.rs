//! Error types for the execution engine.
//!
//! Item-level failures are not Rust errors: operators emit them as
//! [`ErrorValue`]s and keep going. [`Abort`] is the separate unwinding path
//! for conditions that make the whole command meaningless.

use thiserror::Error;

use obsh_types::ErrorValue;

/// A command-fatal condition. Unwinds to the command boundary.
#[derive(Debug, Clone, Error)]
pub enum Abort {
    /// Bad arguments or a missing resource, raised by an operator.
    #[error("{op}: {message}")]
    Command { op: String, message: String },

    /// The pipeline was driven out of order (e.g. receive before setup).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A byte channel to or from a child failed.
    #[error("transport: {0}")]
    Transport(String),

    /// Whoever consumes the output went away.
    #[error("output closed")]
    Closed,
}

impl Abort {
    pub fn command(op: impl Into<String>, message: impl Into<String>) -> Self {
        Abort::Command {
            op: op.into(),
            message: message.into(),
        }
    }

    /// The wire representation shared with item-level errors.
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            Abort::Command { op, message } => ErrorValue::new(message.clone()).with_op(op.clone()),
            other => ErrorValue::new(other.to_string()),
        }
    }
}

/// Framing and serialisation failures on a child channel.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<WireError> for Abort {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => Abort::Closed,
            other => Abort::Transport(other.to_string()),
        }
    }
}
