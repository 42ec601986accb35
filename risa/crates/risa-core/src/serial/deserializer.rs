//! Bytes to cluster.
//!
//! The strings section is read first (jumping over the body) and interned
//! through the provided [`HeapContext`], so string references in the body
//! resolve to the same handles the rest of the VM uses.

use std::rc::Rc;

use crate::cluster::Cluster;
use crate::heap::{Dense, DenseObject, DenseRef, Function, HeapContext};
use crate::serial::serializer::{
    DENSE_ARRAY, DENSE_CLOSURE, DENSE_FUNCTION, DENSE_NATIVE, DENSE_OBJECT, DENSE_STRING,
    DENSE_UPVALUE,
};
use crate::serial::{DeserializeError, CLUSTER_MAGIC, ENDIANNESS_TEST, VERSION_SIGNATURE};
use crate::value::Value;

/// Reconstructs a cluster from a serialized container.
pub fn deserialize_cluster(
    ctx: &mut dyn HeapContext,
    input: &[u8],
) -> Result<Cluster, DeserializeError> {
    let mut reader = Reader { input, pos: 0 };

    let magic = reader.read_bytes(CLUSTER_MAGIC.len())?;
    if magic != CLUSTER_MAGIC {
        return Err(DeserializeError::MagicMismatch);
    }

    if reader.read_u32()? != ENDIANNESS_TEST {
        return Err(DeserializeError::EndiannessMismatch);
    }

    if reader.read_u32()? != VERSION_SIGNATURE {
        return Err(DeserializeError::VersionMismatch);
    }

    let to_strings = reader.read_u32()? as usize;
    let body_start = reader.pos;
    reader.skip(to_strings)?;

    // Intern the string pool through the live heap first.
    let count = reader.read_u32()?;
    let mut strings = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let length = reader.read_u32()? as usize;
        let bytes = reader.read_bytes(length)?;
        strings.push(ctx.intern(bytes));
    }

    reader.pos = body_start;

    let mut deserializer = Deserializer {
        reader,
        ctx,
        strings,
    };

    deserializer.read_cluster()
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, length: usize) -> Result<&'a [u8], DeserializeError> {
        let end = self
            .pos
            .checked_add(length)
            .ok_or(DeserializeError::Eof)?;

        if end > self.input.len() {
            return Err(DeserializeError::Eof);
        }

        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, length: usize) -> Result<(), DeserializeError> {
        self.read_bytes(length).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DeserializeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DeserializeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, DeserializeError> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, DeserializeError> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(buf))
    }
}

struct Deserializer<'a, 'c> {
    reader: Reader<'a>,
    ctx: &'c mut dyn HeapContext,
    strings: Vec<DenseRef>,
}

impl<'a, 'c> Deserializer<'a, 'c> {
    fn read_cluster(&mut self) -> Result<Cluster, DeserializeError> {
        let constants = self.read_value_array()?;

        let size = self.reader.read_u32()? as usize;
        let bytecode = self.reader.read_bytes(size)?.to_vec();

        let mut indices = Vec::with_capacity(size);
        for _ in 0..size {
            indices.push(self.reader.read_u32()?);
        }

        Ok(Cluster {
            bytecode,
            indices,
            constants,
        })
    }

    fn read_value_array(&mut self) -> Result<Vec<Value>, DeserializeError> {
        let size = self.reader.read_u32()?;
        let mut values = Vec::with_capacity(size.min(1024) as usize);

        for _ in 0..size {
            values.push(self.read_value()?);
        }

        Ok(values)
    }

    fn read_value(&mut self) -> Result<Value, DeserializeError> {
        let tag = self.reader.read_u8()?;
        let dense_type = tag >> 4;
        let value_type = tag & 0x0F;

        match value_type {
            0 => Ok(Value::Null),
            1 => Ok(Value::Bool(self.reader.read_u8()? != 0)),
            2 => Ok(Value::Byte(self.reader.read_u8()?)),
            3 => Ok(Value::Int(self.reader.read_i64()?)),
            4 => Ok(Value::Float(self.reader.read_f64()?)),
            5 => self.read_dense(dense_type),
            _ => Err(DeserializeError::Other),
        }
    }

    fn read_dense(&mut self, dense_type: u8) -> Result<Value, DeserializeError> {
        match dense_type {
            DENSE_STRING => {
                let index = self.reader.read_u32()? as usize;

                // Pool indices are untrusted input.
                let handle = self
                    .strings
                    .get(index)
                    .copied()
                    .ok_or(DeserializeError::Other)?;

                Ok(Value::Dense(handle))
            }
            DENSE_ARRAY => {
                let items = self.read_value_array()?;
                Ok(Value::Dense(self.ctx.register(Dense::Array(items))))
            }
            DENSE_OBJECT => {
                let count = self.reader.read_u32()?;
                let mut object = DenseObject::new();

                for _ in 0..count {
                    let key = match self.read_value()? {
                        Value::Dense(handle)
                            if self.ctx.heap().as_string(handle).is_some() =>
                        {
                            handle
                        }
                        _ => return Err(DeserializeError::Other),
                    };

                    let value = self.read_value()?;
                    object.set(key, value);
                }

                Ok(Value::Dense(self.ctx.register(Dense::Object(object))))
            }
            DENSE_FUNCTION => {
                let name = match self.read_value()? {
                    Value::Null => None,
                    Value::Dense(handle)
                        if self.ctx.heap().as_string(handle).is_some() =>
                    {
                        Some(handle)
                    }
                    _ => return Err(DeserializeError::Other),
                };

                let arity = self.reader.read_u8()?;
                let cluster = self.read_cluster()?;

                let function = Function {
                    name,
                    arity,
                    cluster,
                };

                Ok(Value::Dense(
                    self.ctx.register(Dense::Function(Rc::new(function))),
                ))
            }
            // Upvalues, closures and natives never serialize; their tags
            // in the input mean the data is corrupt.
            DENSE_UPVALUE | DENSE_CLOSURE | DENSE_NATIVE => Err(DeserializeError::Other),
            _ => Err(DeserializeError::Other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ScratchHeap;
    use crate::serial::serialize_cluster;

    fn sample_cluster(scratch: &mut ScratchHeap) -> Cluster {
        let mut cluster = Cluster::new();

        let hello = scratch.intern(b"hello");
        let world = scratch.intern(b"world");

        cluster.write_constant(Value::Int(42));
        cluster.write_constant(Value::Float(2.5));
        cluster.write_constant(Value::Dense(hello));
        cluster.write_constant(Value::Dense(world));
        cluster.write_constant(Value::Dense(hello)); // deduplicated

        for byte in [0u8, 1, 0, 0, 47, 0, 0, 0] {
            cluster.write(byte, 7);
        }

        cluster
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);

        let first = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        let mut fresh = ScratchHeap::new();
        let reloaded = deserialize_cluster(&mut fresh, &first).expect("deserialize");
        let second = serialize_cluster(&fresh.heap, &reloaded).expect("reserialize");

        assert_eq!(first, second);
    }

    #[test]
    fn test_round_trip_preserves_tables() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);

        let bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        let mut fresh = ScratchHeap::new();
        let reloaded = deserialize_cluster(&mut fresh, &bytes).expect("deserialize");

        assert_eq!(reloaded.bytecode, cluster.bytecode);
        assert_eq!(reloaded.indices, cluster.indices);
        assert_eq!(reloaded.constants.len(), cluster.constants.len());
    }

    #[test]
    fn test_strings_intern_through_context() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);
        let bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        let mut fresh = ScratchHeap::new();
        let preinterned = fresh.intern(b"hello");

        let reloaded = deserialize_cluster(&mut fresh, &bytes).expect("deserialize");

        // The pooled "hello" resolves to the handle interned beforehand.
        assert!(reloaded
            .constants
            .iter()
            .any(|value| *value == Value::Dense(preinterned)));
    }

    #[test]
    fn test_magic_mismatch() {
        let mut fresh = ScratchHeap::new();
        let err = deserialize_cluster(&mut fresh, b"NOTRISA\0rest").unwrap_err();
        assert_eq!(err, DeserializeError::MagicMismatch);
    }

    #[test]
    fn test_truncated_input() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);
        let bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        let mut fresh = ScratchHeap::new();
        let err = deserialize_cluster(&mut fresh, &bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err, DeserializeError::Eof);
    }

    #[test]
    fn test_endianness_mismatch() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);
        let mut bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        // Flip the probe to the opposite byte order.
        bytes[8..12].copy_from_slice(&ENDIANNESS_TEST.to_be_bytes());

        let mut fresh = ScratchHeap::new();
        let err = deserialize_cluster(&mut fresh, &bytes).unwrap_err();
        assert_eq!(err, DeserializeError::EndiannessMismatch);
    }

    #[test]
    fn test_version_mismatch() {
        let mut scratch = ScratchHeap::new();
        let cluster = sample_cluster(&mut scratch);
        let mut bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        bytes[12..16].copy_from_slice(&(VERSION_SIGNATURE + 1).to_le_bytes());

        let mut fresh = ScratchHeap::new();
        let err = deserialize_cluster(&mut fresh, &bytes).unwrap_err();
        assert_eq!(err, DeserializeError::VersionMismatch);
    }

    #[test]
    fn test_out_of_range_string_index() {
        let mut scratch = ScratchHeap::new();
        let mut cluster = Cluster::new();
        let s = scratch.intern(b"only");
        cluster.write_constant(Value::Dense(s));

        let mut bytes = serialize_cluster(&scratch.heap, &cluster).expect("serialize");

        // The single string constant's pool index sits right after the
        // constants count in the body; corrupt it.
        let body = 8 + 4 + 4 + 4;
        let tag = body + 4;
        assert_eq!(bytes[tag] & 0x0F, 5);
        bytes[tag + 1..tag + 5].copy_from_slice(&99u32.to_le_bytes());

        let mut fresh = ScratchHeap::new();
        let err = deserialize_cluster(&mut fresh, &bytes).unwrap_err();
        assert_eq!(err, DeserializeError::Other);
    }

    #[test]
    fn test_runtime_only_values_refuse_to_serialize() {
        use crate::heap::{DenseUpvalue, UpvalueState};
        use crate::serial::SerializeError;

        let mut scratch = ScratchHeap::new();
        let upvalue = scratch.register(Dense::Upvalue(DenseUpvalue {
            state: UpvalueState::Open(0),
        }));

        let mut cluster = Cluster::new();
        cluster.write_constant(Value::Dense(upvalue));

        let err = serialize_cluster(&scratch.heap, &cluster).unwrap_err();
        assert_eq!(err, SerializeError::RuntimeOnly("upvalue"));
    }

    #[test]
    fn test_function_constant_round_trips() {
        let mut scratch = ScratchHeap::new();
        let name = scratch.intern(b"f");

        let mut inner = Cluster::new();
        inner.write_constant(Value::Int(7));
        for byte in [47u8, 251, 0, 0] {
            inner.write(byte, 0);
        }

        let function = scratch.register(Dense::Function(Rc::new(Function {
            name: Some(name),
            arity: 2,
            cluster: inner,
        })));

        let mut outer = Cluster::new();
        outer.write_constant(Value::Dense(function));

        let bytes = serialize_cluster(&scratch.heap, &outer).expect("serialize");

        let mut fresh = ScratchHeap::new();
        let reloaded = deserialize_cluster(&mut fresh, &bytes).expect("deserialize");

        let handle = reloaded.constants[0].as_dense().expect("dense constant");
        let function = fresh.heap.as_function(handle).expect("function");

        assert_eq!(function.arity, 2);
        assert_eq!(
            fresh.heap.string_bytes(function.name.expect("named")),
            b"f"
        );
        assert_eq!(function.cluster.bytecode, vec![47, 251, 0, 0]);
    }
}
