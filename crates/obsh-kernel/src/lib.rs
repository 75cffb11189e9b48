//! obsh-kernel: the execution engine of the object shell.
//!
//! This crate provides:
//!
//! - **Operators**: the push protocol every pipeline stage implements
//! - **Pipeline**: a chain of operators that is itself an operator
//! - **Command**: the setup → run → flush → cleanup lifecycle
//! - **Eval**: closure parameters compiled from text
//! - **Fork**: fan-out of a pipeline template across local or remote workers
//! - **Remote**: the runner protocol for executing shipped pipelines
//! - **Jobs**: signal-driven job control over runner processes
//! - **Wire**: newline-delimited JSON framing for child channels

pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod eval;
pub mod fork;
pub mod jobs;
pub mod op;
pub mod ops;
pub mod pipeline;
pub mod remote;
pub mod spec;
pub mod wire;

pub use command::{Collector, Command, ErrorPolicy, ExecContext};
pub use config::{KernelConfig, WorkerMode};
pub use env::Env;
pub use error::{Abort, WireError};
pub use eval::{Callable, EvalError, Evaluable};
pub use fork::{Fork, Launcher, MergePolicy};
pub use jobs::{JobControl, JobError, JobOutput, KillOutcome};
pub use op::{Emitter, Operator, Sink};
pub use pipeline::Pipeline;
pub use remote::{RunRequest, RunnerError, ServeOutcome, run_request, serve};
pub use spec::{OpSpec, PipelineSpec};
