//! risa-compiler - Single-pass compiler from Risa source to bytecode.
//!
//! There is no AST: the compiler walks the token stream once, allocating
//! registers and emitting 4-byte instructions as it goes. Forward control
//! flow is emitted blank and patched; nested functions compile on a stack
//! of per-function states sharing one parser.

mod compiler;
mod parser;

pub use compiler::{compile, CompileError, CompilerOptions};
pub use parser::Parser;
