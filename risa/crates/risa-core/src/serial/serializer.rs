//! Cluster to bytes.

use crate::cluster::Cluster;
use crate::heap::{Dense, DenseRef, Heap};
use crate::map::Map;
use crate::serial::{SerializeError, CLUSTER_MAGIC, ENDIANNESS_TEST, VERSION_SIGNATURE};
use crate::value::Value;

// Low-nibble value tags.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_DENSE: u8 = 5;

// High-nibble dense tags.
pub(super) const DENSE_STRING: u8 = 0;
pub(super) const DENSE_ARRAY: u8 = 1;
pub(super) const DENSE_OBJECT: u8 = 2;
pub(super) const DENSE_UPVALUE: u8 = 3;
pub(super) const DENSE_FUNCTION: u8 = 4;
pub(super) const DENSE_CLOSURE: u8 = 5;
pub(super) const DENSE_NATIVE: u8 = 6;

/// Serializes a cluster into a standalone byte container.
pub fn serialize_cluster(heap: &Heap, cluster: &Cluster) -> Result<Vec<u8>, SerializeError> {
    let mut serializer = Serializer {
        heap,
        output: Vec::new(),
        strings: Map::new(),
        strings_buffer: Vec::new(),
        string_count: 0,
    };

    serializer.output.extend_from_slice(CLUSTER_MAGIC);
    serializer.write_u32(ENDIANNESS_TEST);
    serializer.write_u32(VERSION_SIGNATURE);

    // Patched with the body length once it is known, so a reader can jump
    // straight to the strings section.
    let to_strings_offset = serializer.output.len();
    serializer.write_u32(0);

    serializer.write_cluster(cluster)?;

    let body_len = (serializer.output.len() - to_strings_offset - 4) as u32;
    serializer.output[to_strings_offset..to_strings_offset + 4]
        .copy_from_slice(&body_len.to_le_bytes());

    serializer.write_u32(serializer.string_count);
    let strings_buffer = std::mem::take(&mut serializer.strings_buffer);
    serializer.output.extend_from_slice(&strings_buffer);

    Ok(serializer.output)
}

struct Serializer<'h> {
    heap: &'h Heap,
    output: Vec<u8>,
    /// Pool index per interned string already written.
    strings: Map,
    strings_buffer: Vec<u8>,
    string_count: u32,
}

impl<'h> Serializer<'h> {
    fn write_u8(&mut self, value: u8) {
        self.output.push(value);
    }

    fn write_u32(&mut self, value: u32) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    fn write_i64(&mut self, value: i64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    fn write_f64(&mut self, value: f64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    fn write_cluster(&mut self, cluster: &Cluster) -> Result<(), SerializeError> {
        self.write_value_array(&cluster.constants)?;

        self.write_u32(cluster.size() as u32);
        self.output.extend_from_slice(&cluster.bytecode);
        for index in &cluster.indices {
            self.write_u32(*index);
        }

        Ok(())
    }

    fn write_value_array(&mut self, values: &[Value]) -> Result<(), SerializeError> {
        self.write_u32(values.len() as u32);

        for value in values {
            self.write_value(*value)?;
        }

        Ok(())
    }

    fn write_tag(&mut self, dense: u8, value: u8) {
        self.write_u8((dense << 4) | value);
    }

    fn write_value(&mut self, value: Value) -> Result<(), SerializeError> {
        match value {
            Value::Null => self.write_tag(0, TAG_NULL),
            Value::Bool(b) => {
                self.write_tag(0, TAG_BOOL);
                self.write_u8(u8::from(b));
            }
            Value::Byte(b) => {
                self.write_tag(0, TAG_BYTE);
                self.write_u8(b);
            }
            Value::Int(i) => {
                self.write_tag(0, TAG_INT);
                self.write_i64(i);
            }
            Value::Float(f) => {
                self.write_tag(0, TAG_FLOAT);
                self.write_f64(f);
            }
            Value::Dense(handle) => return self.write_dense(handle),
        }

        Ok(())
    }

    fn write_dense(&mut self, handle: DenseRef) -> Result<(), SerializeError> {
        match self.heap.dense(handle) {
            Dense::Str(_) => {
                self.write_tag(DENSE_STRING, TAG_DENSE);
                let index = self.pool_string(handle);
                self.write_u32(index);
            }
            Dense::Array(items) => {
                let items = items.clone();
                self.write_tag(DENSE_ARRAY, TAG_DENSE);
                self.write_value_array(&items)?;
            }
            Dense::Object(object) => {
                let entries: Vec<(DenseRef, Value)> = object
                    .entries
                    .iter()
                    .map(|(key, value)| (*key, *value))
                    .collect();

                self.write_tag(DENSE_OBJECT, TAG_DENSE);
                self.write_u32(entries.len() as u32);

                for (key, value) in entries {
                    self.write_dense(key)?;
                    self.write_value(value)?;
                }
            }
            Dense::Function(function) => {
                let function = function.clone();

                self.write_tag(DENSE_FUNCTION, TAG_DENSE);
                match function.name {
                    Some(name) => self.write_dense(name)?,
                    None => self.write_tag(0, TAG_NULL),
                }
                self.write_u8(function.arity);
                self.write_cluster(&function.cluster)?;
            }
            Dense::Upvalue(_) => return Err(SerializeError::RuntimeOnly("upvalue")),
            Dense::Closure(_) => return Err(SerializeError::RuntimeOnly("closure")),
            Dense::Native(_) => return Err(SerializeError::RuntimeOnly("native")),
        }

        Ok(())
    }

    /// Returns the pool index for a string, appending it to the pool on
    /// first encounter.
    fn pool_string(&mut self, handle: DenseRef) -> u32 {
        if let Some(Value::Int(index)) = self.strings.get(self.heap, handle) {
            return index as u32;
        }

        let bytes = self.heap.string_bytes(handle);
        self.strings_buffer
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.strings_buffer.extend_from_slice(bytes);

        let index = self.string_count;
        self.string_count += 1;
        self.strings.set(self.heap, handle, Value::Int(i64::from(index)));

        index
    }
}
