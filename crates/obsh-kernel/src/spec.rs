//! Serialisable pipeline descriptions.
//!
//! A live [`Pipeline`](crate::pipeline::Pipeline) holds per-run state and
//! cannot be shared. An [`OpSpec`] is the recipe a node was built from: it is
//! what deep cloning rebuilds from, and what travels to fork workers and
//! remote runners.
//!
//! On the wire each op is an object tagged by `op`:
//!
//! ```text
//! [{"op": "generate", "count": 3}, {"op": "map", "f": "|x| x * 2"}]
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use obsh_types::{Value, WorkerId};

use crate::eval::Evaluable;
use crate::fork::MergePolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    /// Emit literal values.
    Values { items: Vec<Value> },
    /// Emit `0..count`.
    Generate { count: u64 },
    /// Replace each item with `f(item)`.
    Map { f: Evaluable },
    /// Keep items for which `pred(item)` is truthy.
    Select { pred: Evaluable },
    /// Buffer everything, emit sorted at flush.
    Sort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Evaluable>,
        #[serde(default)]
        reverse: bool,
    },
    /// Drop items whose key was already seen.
    Unique {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Evaluable>,
    },
    /// Pass the first `count` items.
    Head { count: usize },
    /// Group items into lists of `size`; a short final group is emitted at flush.
    Window { size: usize },
    /// Source that sleeps, then emits nothing. Exists to give jobs a lifetime.
    Sleep { ms: u64 },
    /// Change the working directory of the running command.
    Cd { path: PathBuf },
    /// Run `template` once per worker and merge their output.
    Fork {
        workers: Vec<WorkerId>,
        template: PipelineSpec,
        /// Send each item as `[worker, item]`.
        #[serde(default)]
        tag: bool,
        /// Bind the worker identity to this variable in each clone's environment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<MergePolicy>,
    },
    /// A nested pipeline.
    Pipeline { ops: PipelineSpec },
}

impl OpSpec {
    pub fn map(f: impl Into<String>) -> Self {
        OpSpec::Map {
            f: Evaluable::new(f),
        }
    }

    pub fn select(pred: impl Into<String>) -> Self {
        OpSpec::Select {
            pred: Evaluable::new(pred),
        }
    }

    pub fn sort() -> Self {
        OpSpec::Sort {
            key: None,
            reverse: false,
        }
    }

    pub fn fork(workers: Vec<WorkerId>, template: PipelineSpec) -> Self {
        OpSpec::Fork {
            workers,
            template,
            tag: false,
            bind: None,
            merge: None,
        }
    }

    /// `count` local slots running `template`.
    pub fn fork_slots(count: usize, template: PipelineSpec) -> Self {
        OpSpec::fork((0..count).map(WorkerId::Slot).collect(), template)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpSpec::Values { .. } => "values",
            OpSpec::Generate { .. } => "generate",
            OpSpec::Map { .. } => "map",
            OpSpec::Select { .. } => "select",
            OpSpec::Sort { .. } => "sort",
            OpSpec::Unique { .. } => "unique",
            OpSpec::Head { .. } => "head",
            OpSpec::Window { .. } => "window",
            OpSpec::Sleep { .. } => "sleep",
            OpSpec::Cd { .. } => "cd",
            OpSpec::Fork { .. } => "fork",
            OpSpec::Pipeline { .. } => "pipeline",
        }
    }
}

/// An ordered list of ops. Serialises as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineSpec {
    pub ops: Vec<OpSpec>,
}

impl PipelineSpec {
    pub fn new(ops: Vec<OpSpec>) -> Self {
        Self { ops }
    }

    pub fn then(mut self, op: OpSpec) -> Self {
        self.ops.push(op);
        self
    }

    /// A short human-readable form for job listings.
    pub fn describe(&self) -> String {
        self.ops
            .iter()
            .map(OpSpec::name)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
