//! CAD script execution in a sandboxed child process.

pub mod cad;

pub use cad::{validate_stl, CadRunner, ExecutionOutcome, ProcessCadRunner};
