//! Pure data types for obsh: values, error values, wire frames, job states.
//!
//! This crate is a leaf dependency with no async runtime and no I/O, so that
//! the runner protocol can be spoken by anything that links it.

pub mod env;
pub mod error;
pub mod frame;
pub mod job;
pub mod value;
pub mod worker;

// Flat re-exports for convenience
pub use env::*;
pub use error::*;
pub use frame::*;
pub use job::*;
pub use value::*;
pub use worker::*;
