//! risa-core - The shared data model of the Risa virtual machine.
//!
//! Everything the compiler, the interpreter and the persistence layer agree
//! on lives here: the tagged [`Value`] representation, the garbage-collected
//! [`Heap`] of dense (heap-allocated) values, the open-addressed [`Map`]
//! used for globals and string interning, the [`Cluster`] compilation unit
//! with its fixed-width instruction encoding, and the cluster serializer /
//! deserializer.

pub mod bytecode;
pub mod cluster;
pub mod heap;
pub mod map;
pub mod serial;
pub mod value;

pub use bytecode::OpCode;
pub use cluster::Cluster;
pub use heap::{Dense, DenseRef, Function, Heap, HeapContext, NativeId, ScratchHeap, UpvalueState};
pub use map::Map;
pub use value::Value;
