//! Built-in operators.
//!
//! These are the generic operators the engine ships with. Each one is built
//! from its [`OpSpec`] so that any pipeline made of them can be deep-cloned
//! and shipped to a worker.

mod cd;
mod generate;
mod head;
mod map;
mod sleep;
mod sort;
mod values;

pub use cd::Cd;
pub use generate::Generate;
pub use head::{Head, Window};
pub use map::{Map, Select};
pub use sleep::Sleep;
pub use sort::{Sort, Unique};
pub use values::Values;

use obsh_types::{ErrorValue, Value};

use crate::error::Abort;
use crate::eval::{Callable, EvalError, Evaluable};
use crate::fork::Fork;
use crate::op::Operator;
use crate::pipeline::Pipeline;
use crate::spec::OpSpec;

/// Build a fresh operator from its description.
pub fn build(spec: &OpSpec) -> Result<Box<dyn Operator>, Abort> {
    let op: Box<dyn Operator> = match spec {
        OpSpec::Values { items } => Box::new(Values::new(items.clone())),
        OpSpec::Generate { count } => Box::new(Generate::new(*count)),
        OpSpec::Map { f } => Box::new(Map::new(f.clone())),
        OpSpec::Select { pred } => Box::new(Select::new(pred.clone())),
        OpSpec::Sort { key, reverse } => Box::new(Sort::new(key.clone(), *reverse)),
        OpSpec::Unique { key } => Box::new(Unique::new(key.clone())),
        OpSpec::Head { count } => Box::new(Head::new(*count)),
        OpSpec::Window { size } => Box::new(Window::new(*size)?),
        OpSpec::Sleep { ms } => Box::new(Sleep::new(*ms)),
        OpSpec::Cd { path } => Box::new(Cd::new(path.clone())),
        OpSpec::Fork {
            workers,
            template,
            tag,
            bind,
            merge,
        } => {
            let mut fork = Fork::new(template.clone(), workers.clone()).tagged(*tag);
            if let Some(name) = bind {
                fork = fork.bind(name.clone());
            }
            if let Some(merge) = merge {
                fork = fork.merge(*merge);
            }
            Box::new(fork)
        }
        OpSpec::Pipeline { ops } => Box::new(Pipeline::from_spec(ops)?),
    };
    Ok(op)
}

/// Compile a closure parameter during setup. Failure aborts the command.
pub(crate) fn compile(op: &str, f: &Evaluable) -> Result<Callable, Abort> {
    f.compile().map_err(|e| Abort::command(op, e.to_string()))
}

/// The error value for one item that a closure could not process.
pub(crate) fn item_error(op: &str, error: EvalError, input: Value) -> ErrorValue {
    ErrorValue::new(error.to_string()).with_op(op).with_input(input)
}

/// A compiled closure, or a protocol abort if setup never ran.
pub(crate) fn compiled<'a>(op: &str, f: &'a Option<Callable>) -> Result<&'a Callable, Abort> {
    f.as_ref()
        .ok_or_else(|| Abort::Protocol(format!("{} received before setup", op)))
}
