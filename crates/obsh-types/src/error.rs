//! ErrorValue: an item-level failure carried through the stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A per-item failure that travels downstream like data.
///
/// Created by an operator when one input cannot be processed. The same
/// representation is used on the wire for command-fatal aborts raised in a
/// worker or runner, so initiators handle both uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// What went wrong.
    pub message: String,
    /// Underlying cause, if one was reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Operator that produced the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// The input item that could not be processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Worker or host the error came from, when it crossed a process boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            op: None,
            input: None,
            origin: None,
        }
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Tag the error with its origin unless an inner hop already did.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        if self.origin.is_none() {
            self.origin = Some(origin.into());
        }
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(origin) = &self.origin {
            write!(f, "[{}] ", origin)?;
        }
        if let Some(op) = &self.op {
            write!(f, "{}: ", op)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(input) = &self.input {
            write!(f, " (input: {})", input)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}
