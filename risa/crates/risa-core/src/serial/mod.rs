//! Cluster persistence.
//!
//! A serialized cluster is a self-contained byte container:
//!
//! ```text
//! magic     : "RISACLU\0"
//! endian    : u32 = 0x01020304     probe; must match the host byte order
//! version   : u32                  major/minor/patch packed
//! toStrings : u32                  bytes from here to the strings section
//! <cluster body>                   constants, bytecode, source indices
//! strings   : u32 count, then count of { u32 len; bytes[len] }
//! ```
//!
//! Interned strings are pooled: the body stores u32 pool indices and the
//! pool itself sits at the end so a reader can intern every string through
//! the live VM before touching the body.

mod deserializer;
mod serializer;

pub use deserializer::deserialize_cluster;
pub use serializer::serialize_cluster;

use thiserror::Error;

/// Fixed ASCII tag opening every serialized cluster.
pub const CLUSTER_MAGIC: &[u8; 8] = b"RISACLU\0";

/// Endianness probe. Everything on the wire is little-endian; a reader on
/// a mismatched host sees the bytes reversed and rejects the container.
pub const ENDIANNESS_TEST: u32 = 0x01020304;

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Packed version written to (and demanded from) every container.
pub const VERSION_SIGNATURE: u32 = (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH;

/// Why a byte buffer failed to deserialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DeserializeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("magic tag mismatch")]
    MagicMismatch,
    #[error("endianness mismatch")]
    EndiannessMismatch,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("malformed cluster data")]
    Other,
}

/// Why a cluster could not be serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SerializeError {
    /// Upvalues, closures and natives exist only at runtime.
    #[error("runtime-only value cannot be serialized: {0}")]
    RuntimeOnly(&'static str),
}
