//! risa-vm - The Risa virtual machine.
//!
//! A register-based interpreter over the 4-byte instruction encoding of
//! `risa-core`, with call frames, closures, a tracing mark-and-sweep
//! garbage collector, a disassembler, and the standard library natives.
//! All user-visible I/O goes through the swappable [`RisaIo`] handlers.

pub mod disassembler;
mod gc;
pub mod io;
pub mod stdlib;
pub mod vm;

pub use io::RisaIo;
pub use vm::{NativeFn, RuntimeError, Vm, VmOptions, CALLFRAME_COUNT, STACK_SIZE};
