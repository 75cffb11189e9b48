//! Worker identities for parallel fan-out.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identity of one fan-out worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerId {
    /// A local worker, numbered from zero.
    Slot(usize),
    /// A remote host reached over ssh.
    Host(String),
    /// A local worker running under the privilege-elevation wrapper.
    Elevated,
}

impl WorkerId {
    /// The value attached to items when the caller asks for tagging.
    pub fn to_value(&self) -> Value {
        match self {
            WorkerId::Slot(i) => Value::Int(*i as i64),
            WorkerId::Host(host) => Value::Str(host.clone()),
            WorkerId::Elevated => Value::Str("elevated".to_string()),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Slot(i) => write!(f, "slot {}", i),
            WorkerId::Host(host) => write!(f, "host {}", host),
            WorkerId::Elevated => write!(f, "elevated"),
        }
    }
}
