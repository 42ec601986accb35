//! Open-addressed hash table keyed by interned strings.
//!
//! Backs the VM's globals and its interned-string table. Capacity is a
//! power of two starting at 8; probing is linear; deletions leave
//! tombstones (no key, `false` value) so probe chains stay intact, while
//! empty buckets carry `null` to terminate them. Keys hash through the
//! heap, where every interned string stores its precomputed FNV-1a hash.

use crate::heap::{DenseRef, Heap};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;
const START_CAPACITY: usize = 8;

/// FNV-1a over raw bytes.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;

    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }

    hash
}

#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub key: Option<DenseRef>,
    pub value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Null,
};

const TOMBSTONE: Entry = Entry {
    key: None,
    value: Value::Bool(false),
};

/// String-keyed hash map with linear probing.
#[derive(Clone, Debug, Default)]
pub struct Map {
    entries: Vec<Entry>,
    count: usize,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries plus tombstones; the load factor is measured against
    /// this, the same way slots are consumed.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, heap: &Heap, key: DenseRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let entry = &self.entries[self.bucket(heap, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates; returns whether the key was new.
    pub fn set(&mut self, heap: &Heap, key: DenseRef, value: Value) -> bool {
        self.adjust_capacity(heap);

        let index = self.bucket(heap, key);
        let entry = &mut self.entries[index];

        let is_new = entry.key.is_none();
        if is_new && entry.value.is_null() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.value = value;

        is_new
    }

    /// Removes a key, leaving a tombstone. Returns whether it was present.
    pub fn erase(&mut self, heap: &Heap, key: DenseRef) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = self.bucket(heap, key);

        if self.entries[index].key.is_none() {
            return false;
        }

        self.entries[index] = TOMBSTONE;
        true
    }

    /// Copies every entry of `from` into this map.
    pub fn extend_from(&mut self, heap: &Heap, from: &Map) {
        for (key, value) in from.iter() {
            self.set(heap, key, value);
        }
    }

    /// Looks a string up by content, for resolve-or-intern without
    /// allocating a candidate first.
    pub fn find(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<DenseRef> {
        if self.count == 0 {
            return None;
        }

        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;

        loop {
            let entry = &self.entries[index];

            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = match heap.as_string(key) {
                        Some(string) => string,
                        None => unreachable!("map key is not an interned string"),
                    };

                    if string.hash == hash && &*string.bytes == bytes {
                        return Some(key);
                    }
                }
            }

            index = (index + 1) & mask;
        }
    }

    /// Live entries, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (DenseRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Probes for the bucket holding `key`, or the bucket where it would be
    /// inserted (preferring the first tombstone on the chain).
    fn bucket(&self, heap: &Heap, key: DenseRef) -> usize {
        let hash = match heap.as_string(key) {
            Some(string) => string.hash,
            None => unreachable!("map key is not an interned string"),
        };

        Self::bucket_in(&self.entries, heap, key, hash)
    }

    fn bucket_in(entries: &[Entry], _heap: &Heap, key: DenseRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;

        loop {
            let entry = &entries[index];

            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => (),
            }

            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, heap: &Heap) {
        if (self.count + 1) as f64 <= self.entries.len() as f64 * MAX_LOAD {
            return;
        }

        let capacity = if self.entries.len() < START_CAPACITY {
            START_CAPACITY
        } else {
            self.entries.len() * 2
        };

        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);
        self.count = 0;

        for entry in old {
            if let Some(key) = entry.key {
                let hash = match heap.as_string(key) {
                    Some(string) => string.hash,
                    None => unreachable!("map key is not an interned string"),
                };

                let index = Self::bucket_in(&self.entries, heap, key, hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}
