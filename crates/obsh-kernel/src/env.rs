//! Environment owned by one command or job at a time.
//!
//! An `Env` holds the working directory and variables. Every change is also
//! recorded so a child can report what it changed ([`EnvDelta`]) instead of
//! sharing memory with the controlling process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use obsh_types::{EnvDelta, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Env {
    cwd: PathBuf,
    vars: BTreeMap<String, Value>,
    #[serde(skip)]
    delta: EnvDelta,
}

impl Env {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            vars: BTreeMap::new(),
            delta: EnvDelta::default(),
        }
    }

    /// Environment rooted at the process's current directory.
    pub fn from_process() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::new(cwd)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        let cwd = cwd.into();
        self.delta.cwd = Some(cwd.clone());
        self.cwd = cwd;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.delta.unset.retain(|n| n != &name);
        self.delta.set.insert(name.clone(), value.clone());
        self.vars.insert(name, value);
    }

    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.delta.set.remove(name);
        if !self.delta.unset.iter().any(|n| n == name) {
            self.delta.unset.push(name.to_string());
        }
        self.vars.remove(name)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    /// Resolve a path against the working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Take the changes recorded since the last call.
    pub fn take_delta(&mut self) -> EnvDelta {
        std::mem::take(&mut self.delta)
    }

    /// A copy for a child: same bindings, nothing recorded yet.
    pub fn snapshot(&self) -> Env {
        Env {
            cwd: self.cwd.clone(),
            vars: self.vars.clone(),
            delta: EnvDelta::default(),
        }
    }

    /// Apply a delta reported by a child.
    ///
    /// Applied changes are not re-recorded: they already happened elsewhere.
    pub fn apply(&mut self, delta: &EnvDelta) {
        if let Some(cwd) = &delta.cwd {
            self.cwd = cwd.clone();
        }
        for (name, value) in &delta.set {
            self.vars.insert(name.clone(), value.clone());
        }
        for name in &delta.unset {
            self.vars.remove(name);
        }
    }
}
