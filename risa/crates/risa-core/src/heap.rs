//! The dense-value heap.
//!
//! Dense values live in a slab; a [`DenseRef`] is a stable handle into it.
//! Handle equality is the Rust rendition of the original pointer equality:
//! interned strings resolve to one handle, so string equality is handle
//! equality. The garbage collector owns the mark bits stored here and frees
//! slots through [`Heap::free`]; sweep order is ascending slot index.

use std::hash::BuildHasherDefault;
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHasher;

use crate::cluster::Cluster;
use crate::map::{fnv1a, Map};
use crate::value::Value;

/// Handle to a dense value on the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DenseRef(u32);

impl DenseRef {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Handle to a host function registered with the VM.
///
/// The callable itself lives in a VM-side registry; the heap only stores
/// this identity so natives serialize, print and compare like any other
/// dense value (they are never serialized, but they do flow through
/// globals, objects and arrays).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// An immutable byte string with its precomputed FNV-1a hash.
#[derive(Clone, Debug)]
pub struct DenseStr {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl DenseStr {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
            hash: fnv1a(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// String-keyed, insertion-ordered entry table of an object.
#[derive(Clone, Debug, Default)]
pub struct DenseObject {
    pub entries: IndexMap<DenseRef, Value, BuildHasherDefault<FxHasher>>,
}

impl DenseObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: DenseRef) -> Option<Value> {
        self.entries.get(&key).copied()
    }

    pub fn set(&mut self, key: DenseRef, value: Value) {
        self.entries.insert(key, value);
    }
}

/// A reference a closure holds to a variable of an enclosing function.
#[derive(Clone, Copy, Debug)]
pub enum UpvalueState {
    /// The variable is still on the stack, at this absolute slot.
    Open(usize),
    /// The variable has been promoted into the upvalue itself.
    Closed(Value),
}

#[derive(Clone, Copy, Debug)]
pub struct DenseUpvalue {
    pub state: UpvalueState,
}

/// A compiled function: arity, optional interned name, bytecode.
///
/// Behind `Rc` so call frames can keep the bytecode alive while the VM
/// mutates its stack; the heap slot remains the GC identity.
#[derive(Debug)]
pub struct Function {
    pub name: Option<DenseRef>,
    pub arity: u8,
    pub cluster: Cluster,
}

/// A function bundled with its captured upvalues.
#[derive(Clone, Debug)]
pub struct DenseClosure {
    pub function: Rc<Function>,
    pub upvalues: Vec<DenseRef>,
}

/// A heap-allocated value.
#[derive(Clone, Debug)]
pub enum Dense {
    Str(DenseStr),
    Array(Vec<Value>),
    Object(DenseObject),
    Upvalue(DenseUpvalue),
    Function(Rc<Function>),
    Closure(DenseClosure),
    Native(NativeId),
}

impl Dense {
    pub fn string(bytes: &[u8]) -> Self {
        Dense::Str(DenseStr::new(bytes))
    }

    /// Heap-size heuristic used for the GC threshold. Counts the structural
    /// payload; for functions, the bytecode, index and constant capacity.
    pub fn size(&self) -> usize {
        use std::mem::size_of;

        let base = size_of::<Dense>();

        match self {
            Dense::Str(s) => base + s.len() + 1,
            Dense::Array(_) | Dense::Object(_) | Dense::Upvalue(_) | Dense::Native(_) => base,
            Dense::Function(f) => {
                base
                    + f.cluster.bytecode.capacity() * (size_of::<u8>() + size_of::<u32>())
                    + f.cluster.constants.capacity() * size_of::<Value>()
            }
            Dense::Closure(c) => base + c.upvalues.len() * size_of::<DenseRef>(),
        }
    }
}

struct Slot {
    dense: Dense,
    marked: bool,
    size: usize,
}

/// Slab of every live dense value, with the byte accounting the GC
/// threshold compares against.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a dense value onto the heap and starts tracking it.
    pub fn register(&mut self, dense: Dense) -> DenseRef {
        let size = dense.size();
        self.bytes += size;

        let slot = Slot {
            dense,
            marked: false,
            size,
        };

        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                DenseRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                DenseRef(self.slots.len() as u32 - 1)
            }
        }
    }

    fn slot(&self, handle: DenseRef) -> &Slot {
        match self.slots[handle.0 as usize].as_ref() {
            Some(slot) => slot,
            None => unreachable!("dangling dense handle {:?}", handle),
        }
    }

    fn slot_mut(&mut self, handle: DenseRef) -> &mut Slot {
        match self.slots[handle.0 as usize].as_mut() {
            Some(slot) => slot,
            None => unreachable!("dangling dense handle {:?}", handle),
        }
    }

    pub fn dense(&self, handle: DenseRef) -> &Dense {
        &self.slot(handle).dense
    }

    pub fn dense_mut(&mut self, handle: DenseRef) -> &mut Dense {
        &mut self.slot_mut(handle).dense
    }

    /// Total of the size heuristic over every live slot.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles in sweep order (ascending slot index).
    pub fn handles(&self) -> impl Iterator<Item = DenseRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| DenseRef(index as u32))
    }

    pub fn is_marked(&self, handle: DenseRef) -> bool {
        self.slot(handle).marked
    }

    pub fn set_marked(&mut self, handle: DenseRef, marked: bool) {
        self.slot_mut(handle).marked = marked;
    }

    /// Frees a slot, subtracting its registered size.
    pub fn free(&mut self, handle: DenseRef) {
        if let Some(slot) = self.slots[handle.0 as usize].take() {
            self.bytes -= slot.size;
            self.free.push(handle.0);
        }
    }

    // Typed accessors. Callers that already validated the shape use the
    // panicking variants; fallible paths go through `dense()` and match.

    pub fn as_string(&self, handle: DenseRef) -> Option<&DenseStr> {
        match self.dense(handle) {
            Dense::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn string_bytes(&self, handle: DenseRef) -> &[u8] {
        match self.dense(handle) {
            Dense::Str(s) => &s.bytes,
            _ => unreachable!("handle does not reference a string"),
        }
    }

    pub fn as_function(&self, handle: DenseRef) -> Option<&Rc<Function>> {
        match self.dense(handle) {
            Dense::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// Mutable access to a heap and its interned-string table.
///
/// Implemented by the VM (whose string table is the interning authority)
/// and by [`ScratchHeap`] for compiling or deserializing without a running
/// interpreter.
pub trait HeapContext {
    fn heap(&self) -> &Heap;

    /// Resolves-or-creates the unique string for `bytes`.
    fn intern(&mut self, bytes: &[u8]) -> DenseRef;

    /// Registers a freshly built dense value.
    fn register(&mut self, dense: Dense) -> DenseRef;
}

/// A detached heap plus intern table, for tools that work on clusters
/// outside a VM (tests, the disassembler, offline deserialization).
#[derive(Default)]
pub struct ScratchHeap {
    pub heap: Heap,
    pub strings: Map,
}

impl ScratchHeap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeapContext for ScratchHeap {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn intern(&mut self, bytes: &[u8]) -> DenseRef {
        let hash = fnv1a(bytes);

        if let Some(existing) = self.strings.find(&self.heap, bytes, hash) {
            return existing;
        }

        let handle = self.heap.register(Dense::string(bytes));
        self.strings.set(&self.heap, handle, Value::Null);
        handle
    }

    fn register(&mut self, dense: Dense) -> DenseRef {
        self.heap.register(dense)
    }
}

/// Deep-copies a value, registering every freshly built node.
///
/// Arrays and objects copy structurally; strings, functions, closures and
/// natives copy by reference. Open upvalues keep their stack reference.
pub fn clone_value(ctx: &mut dyn HeapContext, value: Value) -> Value {
    let handle = match value {
        Value::Dense(handle) => handle,
        other => return other,
    };

    let cloned = match ctx.heap().dense(handle).clone() {
        Dense::Array(items) => {
            let items = items
                .iter()
                .map(|item| clone_value(ctx, *item))
                .collect::<Vec<_>>();
            Dense::Array(items)
        }
        Dense::Object(object) => {
            let mut clone = DenseObject::new();
            for (key, val) in object.entries.iter() {
                let val = clone_value(ctx, *val);
                clone.set(*key, val);
            }
            Dense::Object(clone)
        }
        Dense::Upvalue(upvalue) => {
            let state = match upvalue.state {
                UpvalueState::Open(slot) => UpvalueState::Open(slot),
                UpvalueState::Closed(inner) => UpvalueState::Closed(clone_value(ctx, inner)),
            };
            Dense::Upvalue(DenseUpvalue { state })
        }
        Dense::Str(_) | Dense::Function(_) | Dense::Closure(_) | Dense::Native(_) => {
            return value;
        }
    };

    Value::Dense(ctx.register(cloned))
}
