//! risa-util - Foundation types shared by every Risa crate.
//!
//! Source positions in Risa are plain byte offsets; tokens, bytecode and
//! diagnostics all carry a `u32` index into the original source. This crate
//! holds the offset-to-line/column mapping and the diagnostic handler the
//! parser and compiler report through.

pub mod diagnostic;
pub mod position;

pub use diagnostic::{Diagnostic, Handler, Level};
pub use position::line_column;
