//! Environment deltas reported by forked children and job processes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Changes a child made to its copy of the environment.
///
/// Children never share environment memory with the controlling process;
/// they report what changed and the controller applies it once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvDelta {
    /// New working directory, if it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Variables that were set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    /// Variables that were removed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
}

impl EnvDelta {
    pub fn is_empty(&self) -> bool {
        self.cwd.is_none() && self.set.is_empty() && self.unset.is_empty()
    }
}
