#![forbid(unsafe_code)]

//! Compilation side of the oracle: the compilers under test, the two
//! chained pipelines, and the artifacts they produce.

pub mod backend;
pub mod command;
pub mod invoker;

pub use backend::{BackendId, CompileRequest, CompilerBackend};
pub use command::{CommandBackend, ToolchainConfig, classify_failure, output_files};
pub use invoker::{Artifact, CompileError, CompileInput, CompilerInvoker};
