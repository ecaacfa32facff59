//! Compiler for `.script` sources.
//!
//! Scripts are parsed, resolved against a table of host component
//! interfaces, and emitted as stack-bytecode artifacts, one `<id>.sbc`
//! file per script plus an `index.sbi` mapping script ids to their code
//! sections. [`pipeline::Pipeline`] drives the whole flow; the phase
//! modules are public so embedders can run them over in-memory sources.

pub mod ast;
pub mod bindings;
pub mod bytecode;
pub mod emitter;
pub mod index;
pub mod interface;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod source;

pub use pipeline::{BuildReport, BuildRequest, IdRule, Pipeline, RunError};
