//! Wire messages exchanged between a child (worker, job, remote runner) and
//! the process that launched it.

use serde::{Deserialize, Serialize};

use crate::env::EnvDelta;
use crate::error::ErrorValue;
use crate::value::Value;

/// One message on a child's output channel.
///
/// A well-behaved child writes any number of `Data`/`Error` frames, at most
/// one `Abort`, at most one `Env`, and finishes with `End`. A channel that
/// closes without `End` was truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Data(Value),
    Error(ErrorValue),
    /// A command-fatal abort inside the child, serialised as an error value.
    Abort(ErrorValue),
    Env(EnvDelta),
    End,
}

impl Frame {
    pub fn is_end(&self) -> bool {
        matches!(self, Frame::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let json = serde_json::to_string(&Frame::Data(Value::Int(2))).unwrap();
        assert_eq!(json, r#"{"kind":"data","body":{"Int":2}}"#);

        let json = serde_json::to_string(&Frame::End).unwrap();
        assert_eq!(json, r#"{"kind":"end"}"#);
    }
}
