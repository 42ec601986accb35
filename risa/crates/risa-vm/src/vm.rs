//! The interpreter: value stack, call frames, dispatch loop.

use std::rc::Rc;

use risa_core::bytecode::{
    INSTRUCTION_SIZE, REGISTER_COUNT, REGISTER_NULL, TYPE_LEFT_CONSTANT, TYPE_RIGHT_CONSTANT,
};
use risa_core::heap::{
    clone_value, Dense, DenseRef, DenseUpvalue, Function, HeapContext, NativeId, UpvalueState,
};
use risa_core::map::{fnv1a, Map};
use risa_core::value::{equals, is_falsy, is_truthy};
use risa_core::{Heap, OpCode, Value};
use thiserror::Error;

use crate::disassembler::disassemble_to_string;
use crate::io::RisaIo;

/// Value stack slots.
pub const STACK_SIZE: usize = 16384;

/// Maximum call depth.
pub const CALLFRAME_COUNT: usize = 64;

/// Heap size that triggers the first collection; doubles after each cycle.
const HEAP_THRESHOLD_INITIAL: usize = 1024 * 1024;

/// Host function: `(vm, argc, args) -> value`. Arguments are copied out of
/// the frame; failure is signaled by returning `null`.
pub type NativeFn = fn(&mut Vm, u8, &[Value]) -> Value;

/// A runtime failure, carrying the source offset of the faulting
/// instruction (resolved against the original source by the embedder).
#[derive(Debug, Error)]
#[error("at byte offset {index}: {message}")]
pub struct RuntimeError {
    pub message: String,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VmOptions {
    /// REPL mode: top-level expression statements store their value in the
    /// accumulator.
    pub repl_mode: bool,
}

/// One activation record.
///
/// `base` is the stack slot holding the callee itself; the frame's
/// registers start one past it. An isolated frame halts the interpreter
/// when it returns, which is how the top-level script and native-initiated
/// re-entry terminate.
struct CallFrame {
    callee: DenseRef,
    function: Rc<Function>,
    ip: usize,
    base: usize,
    isolated: bool,
}

pub struct Vm {
    pub io: RisaIo,
    pub options: VmOptions,
    /// REPL accumulator; written by the ACC instruction.
    pub acc: Value,
    pub globals: Map,

    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    stack_top: usize,

    strings: Map,
    heap: Heap,
    heap_threshold: usize,

    /// Open upvalues, sorted by referenced stack slot, descending.
    open_upvalues: Vec<DenseRef>,

    natives: Vec<NativeFn>,
    pending_error: Option<RuntimeError>,

    /// High-water mark of the frame stack since the last script load.
    max_frame_depth: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_io(RisaIo::default())
    }

    pub fn with_io(io: RisaIo) -> Self {
        Self {
            io,
            options: VmOptions::default(),
            acc: Value::Null,
            globals: Map::new(),
            frames: Vec::new(),
            stack: vec![Value::Null; STACK_SIZE],
            stack_top: 0,
            strings: Map::new(),
            heap: Heap::new(),
            heap_threshold: HEAP_THRESHOLD_INITIAL,
            open_upvalues: Vec::new(),
            natives: Vec::new(),
            pending_error: None,
            max_frame_depth: 0,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Deepest call-frame nesting reached since the last script load.
    pub fn max_frame_depth(&self) -> usize {
        self.max_frame_depth
    }

    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    pub(crate) fn gc_roots(&self) -> impl Iterator<Item = Value> + '_ {
        let stack = self.stack[..self.stack_top].iter().copied();
        let frames = self.frames.iter().map(|frame| Value::Dense(frame.callee));
        let upvalues = self.open_upvalues.iter().map(|h| Value::Dense(*h));
        let globals = self
            .globals
            .iter()
            .flat_map(|(key, value)| [Value::Dense(key), value]);

        stack
            .chain(frames)
            .chain(upvalues)
            .chain(globals)
            .chain(std::iter::once(self.acc))
    }

    pub(crate) fn strings_mut(&mut self) -> (&Heap, &mut Map) {
        (&self.heap, &mut self.strings)
    }

    pub(crate) fn heap_threshold(&self) -> usize {
        self.heap_threshold
    }

    pub(crate) fn set_heap_threshold(&mut self, threshold: usize) {
        self.heap_threshold = threshold;
    }

    // ------------------------------------------------------------------
    // Allocation and interning
    // ------------------------------------------------------------------

    /// Resolves-or-creates the unique interned string for `bytes`.
    ///
    /// Does not trigger a collection; callers on allocation-heavy runtime
    /// paths run `gc_check` first, while their operands are still rooted.
    pub fn intern(&mut self, bytes: &[u8]) -> DenseRef {
        let hash = fnv1a(bytes);

        if let Some(existing) = self.strings.find(&self.heap, bytes, hash) {
            return existing;
        }

        let handle = self.heap.register(Dense::string(bytes));

        let Vm { heap, strings, .. } = self;
        strings.set(&*heap, handle, Value::Null);

        handle
    }

    /// Registers a dense value without checking the GC threshold; used
    /// while building structures that are not yet reachable from roots.
    pub fn register_dense(&mut self, dense: Dense) -> DenseRef {
        self.heap.register(dense)
    }

    /// Collection point plus registration, for dispatch-time allocations
    /// whose inputs are rooted in registers.
    fn alloc_dense(&mut self, dense: Dense) -> DenseRef {
        self.gc_check();
        self.heap.register(dense)
    }

    // ------------------------------------------------------------------
    // Globals and natives
    // ------------------------------------------------------------------

    pub fn global_set(&mut self, name: &str, value: Value) {
        let key = self.intern(name.as_bytes());
        self.global_set_handle(key, value);
    }

    pub fn global_set_handle(&mut self, key: DenseRef, value: Value) {
        let Vm { heap, globals, .. } = self;
        globals.set(&*heap, key, value);
    }

    pub fn global_get(&mut self, name: &str) -> Option<Value> {
        let key = self.intern(name.as_bytes());
        self.globals.get(&self.heap, key)
    }

    pub fn global_set_native(&mut self, name: &str, native: NativeFn) {
        let value = self.native_value(native);
        self.global_set(name, value);
    }

    /// Wraps a host function into a value, registering it with the native
    /// table and the heap.
    pub fn native_value(&mut self, native: NativeFn) -> Value {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(native);
        Value::Dense(self.heap.register(Dense::Native(id)))
    }

    /// Stores an error raised inside a native; the dispatch loop picks it
    /// up right after the native returns.
    pub fn set_pending_error(&mut self, error: RuntimeError) {
        self.pending_error = Some(error);
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs a registered script function to completion on a fresh stack.
    pub fn execute_script(&mut self, script: DenseRef) -> Result<Value, RuntimeError> {
        let function = match self.heap.as_function(script) {
            Some(function) => Rc::clone(function),
            None => {
                return Err(RuntimeError {
                    message: "Expected a function".to_string(),
                    index: 0,
                })
            }
        };

        self.frames.clear();
        self.open_upvalues.clear();
        self.stack_top = 0;
        self.max_frame_depth = 0;

        self.stack[0] = Value::Dense(script);
        self.push_frame(0, 0, script, function, true)
            .map_err(|message| RuntimeError { message, index: 0 })?;

        self.run()
    }

    /// Calls back into script code from a native. The callee runs in an
    /// isolated frame above the current stack top; control returns here
    /// when it does.
    pub fn invoke(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let argc = args.len() as u8;
        let base = self.stack_top;

        let handle = match callee {
            Value::Dense(handle) => handle,
            _ => {
                return Err(RuntimeError {
                    message: "Can only call functions".to_string(),
                    index: 0,
                })
            }
        };

        let resolved = self.resolve_callee(handle);

        match resolved {
            Callee::Function(function) | Callee::Closure(function) => {
                if function.arity != argc {
                    return Err(RuntimeError {
                        message: format!(
                            "Invalid argument count: expected {}, got {}",
                            function.arity, argc
                        ),
                        index: 0,
                    });
                }

                if base + 1 + args.len() > STACK_SIZE {
                    return Err(RuntimeError {
                        message: "Stack overflow".to_string(),
                        index: 0,
                    });
                }

                self.stack[base] = callee;
                self.stack[base + 1..base + 1 + args.len()].copy_from_slice(args);

                self.push_frame(base, argc, handle, function, true)
                    .map_err(|message| RuntimeError { message, index: 0 })?;

                self.run()
            }
            Callee::Native(id) => {
                let native = self.natives[id.0 as usize];
                let result = native(self, argc, args);

                match self.pending_error.take() {
                    Some(error) => Err(error),
                    None => Ok(result),
                }
            }
            Callee::NotCallable => Err(RuntimeError {
                message: "Can only call functions".to_string(),
                index: 0,
            }),
        }
    }

    fn resolve_callee(&self, handle: DenseRef) -> Callee {
        match self.heap.dense(handle) {
            Dense::Function(function) => Callee::Function(Rc::clone(function)),
            Dense::Closure(closure) => Callee::Closure(Rc::clone(&closure.function)),
            Dense::Native(id) => Callee::Native(*id),
            _ => Callee::NotCallable,
        }
    }

    /// Pushes a frame whose callee sits at `base`. Registers above the
    /// arguments are nulled so the collector never walks stale slots.
    fn push_frame(
        &mut self,
        base: usize,
        argc: u8,
        callee: DenseRef,
        function: Rc<Function>,
        isolated: bool,
    ) -> Result<(), String> {
        if self.frames.len() == CALLFRAME_COUNT {
            return Err("Stack overflow".to_string());
        }

        let window_end = base + 1 + REGISTER_COUNT as usize;
        if window_end > STACK_SIZE {
            return Err("Stack overflow".to_string());
        }

        for slot in &mut self.stack[base + 1 + argc as usize..window_end] {
            *slot = Value::Null;
        }
        self.stack_top = window_end;

        self.frames.push(CallFrame {
            callee,
            function,
            ip: 0,
            base,
            isolated,
        });
        self.max_frame_depth = self.max_frame_depth.max(self.frames.len());

        Ok(())
    }

    fn frame_context(&self) -> (Rc<Function>, DenseRef, usize, usize) {
        match self.frames.last() {
            Some(frame) => (
                Rc::clone(&frame.function),
                frame.callee,
                frame.base,
                frame.ip,
            ),
            None => unreachable!("dispatch with no call frame"),
        }
    }

    /// The dispatch loop. Returns when an isolated frame returns.
    fn run(&mut self) -> Result<Value, RuntimeError> {
        let (mut function, mut callee, mut base, mut ip) = self.frame_context();

        macro_rules! rt_err {
            ($($arg:tt)*) => {{
                let index = function.cluster.indices.get(ip.wrapping_sub(4)).copied().unwrap_or(0);
                return Err(RuntimeError { message: format!($($arg)*), index });
            }};
        }

        macro_rules! reg_slot {
            ($r:expr) => {{
                let r = $r as usize;
                if r >= REGISTER_COUNT as usize {
                    rt_err!("Invalid register {}", r);
                }
                base + 1 + r
            }};
        }

        macro_rules! get_reg {
            ($r:expr) => {{
                let slot = reg_slot!($r);
                self.stack[slot]
            }};
        }

        macro_rules! set_reg {
            ($r:expr, $v:expr) => {{
                let slot = reg_slot!($r);
                self.stack[slot] = $v;
            }};
        }

        macro_rules! constant {
            ($k:expr) => {{
                match function.cluster.constants.get($k as usize) {
                    Some(value) => *value,
                    None => rt_err!("Invalid constant index {}", $k),
                }
            }};
        }

        macro_rules! constant_string {
            ($k:expr) => {{
                match constant!($k) {
                    Value::Dense(handle) if self.heap.as_string(handle).is_some() => handle,
                    _ => rt_err!("Expected string constant"),
                }
            }};
        }

        loop {
            let code = &function.cluster.bytecode;

            if ip + INSTRUCTION_SIZE > code.len() {
                rt_err!("Instruction pointer out of bounds");
            }

            let instr = [code[ip], code[ip + 1], code[ip + 2], code[ip + 3]];
            ip += INSTRUCTION_SIZE;

            let op = match OpCode::from_byte(instr[0]) {
                Some(op) => op,
                None => rt_err!("Unknown opcode {}", instr[0] & 0x3F),
            };
            let flags = instr[0] & !0x3F;
            let (a, b, c) = (instr[1], instr[2], instr[3]);

            macro_rules! left_operand {
                () => {{
                    if flags & TYPE_LEFT_CONSTANT != 0 {
                        constant!(b)
                    } else {
                        get_reg!(b)
                    }
                }};
            }

            macro_rules! right_operand {
                () => {{
                    if flags & TYPE_RIGHT_CONSTANT != 0 {
                        constant!(c)
                    } else {
                        get_reg!(c)
                    }
                }};
            }

            log::trace!("dispatch {:04} {}", ip - INSTRUCTION_SIZE, op.name());

            match op {
                OpCode::Cnst => {
                    let value = constant!(b);
                    set_reg!(a, value);
                }
                OpCode::Cnstw => {
                    let index = u16::from_le_bytes([b, c]);
                    let value = constant!(index);
                    set_reg!(a, value);
                }
                OpCode::Mov => {
                    let value = get_reg!(b);
                    set_reg!(a, value);
                }
                OpCode::Clone => {
                    let source = left_operand!();
                    self.gc_check();
                    let cloned = clone_value(self, source);
                    set_reg!(a, cloned);
                }
                OpCode::Dglob => {
                    let name = constant_string!(a);
                    let value = left_operand!();

                    let Vm { heap, globals, .. } = &mut *self;
                    globals.set(&*heap, name, value);
                }
                OpCode::Gglob => {
                    let name = constant_string!(b);

                    match self.globals.get(&self.heap, name) {
                        Some(value) => set_reg!(a, value),
                        None => {
                            let text = String::from_utf8_lossy(self.heap.string_bytes(name))
                                .into_owned();
                            rt_err!("Undefined variable '{}'", text)
                        }
                    }
                }
                OpCode::Sglob => {
                    let name = constant_string!(a);
                    let value = left_operand!();

                    if self.globals.get(&self.heap, name).is_none() {
                        let text =
                            String::from_utf8_lossy(self.heap.string_bytes(name)).into_owned();
                        rt_err!("Undefined variable '{}'", text)
                    }

                    let Vm { heap, globals, .. } = &mut *self;
                    globals.set(&*heap, name, value);
                }
                // A stray UPVAL follow-byte outside a CLSR sequence.
                OpCode::Upval => (),
                OpCode::Gupval => {
                    let upvalue = self.frame_upvalue(callee, b);
                    match upvalue {
                        Some(handle) => {
                            let value = match self.heap.dense(handle) {
                                Dense::Upvalue(upvalue) => match upvalue.state {
                                    UpvalueState::Open(slot) => self.stack[slot],
                                    UpvalueState::Closed(value) => value,
                                },
                                _ => rt_err!("Invalid upvalue"),
                            };
                            set_reg!(a, value);
                        }
                        None => rt_err!("Invalid upvalue index {}", b),
                    }
                }
                OpCode::Supval => {
                    let value = get_reg!(b);

                    let handle = match self.frame_upvalue(callee, a) {
                        Some(handle) => handle,
                        None => rt_err!("Invalid upvalue index {}", a),
                    };

                    let state = match self.heap.dense(handle) {
                        Dense::Upvalue(upvalue) => upvalue.state,
                        _ => rt_err!("Invalid upvalue"),
                    };

                    match state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            *self.heap.dense_mut(handle) = Dense::Upvalue(DenseUpvalue {
                                state: UpvalueState::Closed(value),
                            });
                        }
                    }
                }
                OpCode::Cupval => {
                    let slot = reg_slot!(a);
                    self.close_upvalues(slot);
                }
                OpCode::Clsr => {
                    let source = get_reg!(b);
                    let target = match source {
                        Value::Dense(handle) => match self.heap.as_function(handle) {
                            Some(function) => Rc::clone(function),
                            None => rt_err!("Expected a function"),
                        },
                        _ => rt_err!("Expected a function"),
                    };

                    let mut upvalues = Vec::with_capacity(c as usize);

                    for _ in 0..c {
                        let code = &function.cluster.bytecode;
                        if ip + INSTRUCTION_SIZE > code.len() {
                            rt_err!("Truncated closure descriptor");
                        }

                        let line = [code[ip], code[ip + 1], code[ip + 2], code[ip + 3]];
                        ip += INSTRUCTION_SIZE;

                        if OpCode::from_byte(line[0]) != Some(OpCode::Upval) {
                            rt_err!("Malformed closure descriptor");
                        }

                        let index = line[1];
                        let is_local = line[2] != 0;

                        if is_local {
                            let slot = reg_slot!(index);
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            match self.frame_upvalue(callee, index) {
                                Some(handle) => upvalues.push(handle),
                                None => rt_err!("Invalid upvalue index {}", index),
                            }
                        }
                    }

                    let closure = self.alloc_dense(Dense::Closure(risa_core::heap::DenseClosure {
                        function: target,
                        upvalues,
                    }));
                    set_reg!(a, Value::Dense(closure));
                }
                OpCode::Arr => {
                    let array = self.alloc_dense(Dense::Array(Vec::new()));
                    set_reg!(a, Value::Dense(array));
                }
                OpCode::Parr => {
                    let value = left_operand!();
                    let target = get_reg!(a);

                    match target {
                        Value::Dense(handle) => match self.heap.dense_mut(handle) {
                            Dense::Array(items) => items.push(value),
                            _ => rt_err!("Expected an array"),
                        },
                        _ => rt_err!("Expected an array"),
                    }
                }
                OpCode::Len => {
                    let value = get_reg!(b);
                    let length = match value {
                        Value::Dense(handle) => match self.heap.dense(handle) {
                            Dense::Str(s) => s.len() as i64,
                            Dense::Array(items) => items.len() as i64,
                            Dense::Object(object) => object.entries.len() as i64,
                            _ => rt_err!("Expected string, array, or object"),
                        },
                        _ => rt_err!("Expected string, array, or object"),
                    };
                    set_reg!(a, Value::Int(length));
                }
                OpCode::Obj => {
                    let object = self.alloc_dense(Dense::Object(Default::default()));
                    set_reg!(a, Value::Dense(object));
                }
                OpCode::Get => {
                    let source = get_reg!(b);
                    let key = right_operand!();

                    let result = match self.index_value(source, key) {
                        Ok(value) => value,
                        Err(message) => rt_err!("{}", message),
                    };
                    set_reg!(a, result);
                }
                OpCode::Set => {
                    let target = get_reg!(a);
                    let key = left_operand!();
                    let value = right_operand!();

                    if let Err(message) = self.index_assign(target, key, value) {
                        rt_err!("{}", message);
                    }
                }
                OpCode::Null => set_reg!(a, Value::Null),
                OpCode::True => set_reg!(a, Value::Bool(true)),
                OpCode::False => set_reg!(a, Value::Bool(false)),
                OpCode::Not => {
                    let value = left_operand!();
                    set_reg!(a, Value::Bool(is_falsy(&self.heap, value)));
                }
                OpCode::Bnot => {
                    let value = left_operand!();
                    let result = match value {
                        Value::Byte(v) => Value::Byte(!v),
                        Value::Int(v) => Value::Int(!v),
                        _ => rt_err!("Expected byte or int operand"),
                    };
                    set_reg!(a, result);
                }
                OpCode::Neg => {
                    let value = left_operand!();
                    let result = match value {
                        Value::Byte(v) => Value::Int(-i64::from(v)),
                        Value::Int(v) => Value::Int(v.wrapping_neg()),
                        Value::Float(v) => Value::Float(-v),
                        _ => rt_err!("Expected numeric operand"),
                    };
                    set_reg!(a, result);
                }
                OpCode::Inc | OpCode::Dec => {
                    let delta: i64 = if op == OpCode::Inc { 1 } else { -1 };
                    let value = get_reg!(a);
                    let result = match value {
                        Value::Byte(v) => Value::Byte(v.wrapping_add(delta as u8)),
                        Value::Int(v) => Value::Int(v.wrapping_add(delta)),
                        Value::Float(v) => Value::Float(v + delta as f64),
                        _ => rt_err!("Expected numeric operand"),
                    };
                    set_reg!(a, result);
                }
                OpCode::Add => {
                    let left = left_operand!();
                    let right = right_operand!();

                    if let (Value::Dense(l), Value::Dense(r)) = (left, right) {
                        if self.heap.as_string(l).is_some() && self.heap.as_string(r).is_some() {
                            self.gc_check();
                            let mut bytes = self.heap.string_bytes(l).to_vec();
                            bytes.extend_from_slice(self.heap.string_bytes(r));
                            let concat = self.intern(&bytes);
                            set_reg!(a, Value::Dense(concat));
                            continue;
                        }
                    }

                    match arithmetic(op, left, right) {
                        Ok(result) => set_reg!(a, result),
                        Err(message) => rt_err!("{}", message),
                    }
                }
                OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Shl
                | OpCode::Shr
                | OpCode::Band
                | OpCode::Bxor
                | OpCode::Bor => {
                    let left = left_operand!();
                    let right = right_operand!();

                    match arithmetic(op, left, right) {
                        Ok(result) => set_reg!(a, result),
                        Err(message) => rt_err!("{}", message),
                    }
                }
                OpCode::Lt | OpCode::Lte | OpCode::Gt | OpCode::Gte => {
                    let left = left_operand!();
                    let right = right_operand!();

                    match comparison(op, left, right) {
                        Ok(result) => set_reg!(a, result),
                        Err(message) => rt_err!("{}", message),
                    }
                }
                OpCode::Eq => {
                    let left = left_operand!();
                    let right = right_operand!();
                    set_reg!(a, Value::Bool(equals(left, right)));
                }
                OpCode::Neq => {
                    let left = left_operand!();
                    let right = right_operand!();
                    set_reg!(a, Value::Bool(!equals(left, right)));
                }
                OpCode::Test => {
                    let value = get_reg!(a);
                    if is_truthy(&self.heap, value) {
                        ip += INSTRUCTION_SIZE;
                    }
                }
                OpCode::Ntest => {
                    let value = get_reg!(a);
                    if is_falsy(&self.heap, value) {
                        ip += INSTRUCTION_SIZE;
                    }
                }
                OpCode::Jmp => {
                    ip += INSTRUCTION_SIZE * a as usize;
                }
                OpCode::Jmpw => {
                    let distance = u16::from_le_bytes([a, b]) as usize;
                    ip += INSTRUCTION_SIZE * distance;
                }
                OpCode::Bjmp => {
                    let back = INSTRUCTION_SIZE * (a as usize + 1);
                    match ip.checked_sub(back) {
                        Some(target) => ip = target,
                        None => rt_err!("Invalid jump target"),
                    }
                }
                OpCode::Bjmpw => {
                    let distance = u16::from_le_bytes([a, b]) as usize;
                    let back = INSTRUCTION_SIZE * (distance + 1);
                    match ip.checked_sub(back) {
                        Some(target) => ip = target,
                        None => rt_err!("Invalid jump target"),
                    }
                }
                OpCode::Call => {
                    let argc = b;
                    let callee_value = get_reg!(a);
                    let fn_slot = reg_slot!(a);

                    let handle = match callee_value {
                        Value::Dense(handle) => handle,
                        _ => rt_err!("Can only call functions"),
                    };

                    match self.resolve_callee(handle) {
                        Callee::Function(target) | Callee::Closure(target) => {
                            if target.arity != argc {
                                rt_err!(
                                    "Invalid argument count: expected {}, got {}",
                                    target.arity,
                                    argc
                                );
                            }

                            match self.frames.last_mut() {
                                Some(frame) => frame.ip = ip,
                                None => unreachable!("dispatch with no call frame"),
                            }

                            if let Err(message) =
                                self.push_frame(fn_slot, argc, handle, target, false)
                            {
                                rt_err!("{}", message);
                            }

                            (function, callee, base, ip) = self.frame_context();
                        }
                        Callee::Native(id) => {
                            let start = fn_slot + 1;
                            if start + argc as usize > self.stack.len() {
                                rt_err!("Stack overflow");
                            }
                            let args: Vec<Value> =
                                self.stack[start..start + argc as usize].to_vec();

                            let native = match self.natives.get(id.0 as usize) {
                                Some(native) => *native,
                                None => rt_err!("Invalid native reference"),
                            };

                            let result = native(self, argc, &args);

                            if let Some(error) = self.pending_error.take() {
                                return Err(error);
                            }

                            self.stack[fn_slot] = result;
                        }
                        Callee::NotCallable => rt_err!("Can only call functions"),
                    }
                }
                OpCode::Ret => {
                    let result = if a == REGISTER_NULL {
                        Value::Null
                    } else {
                        get_reg!(a)
                    };

                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("dispatch with no call frame"),
                    };

                    self.close_upvalues(frame.base);

                    if frame.isolated {
                        self.stack_top = match self.frames.last() {
                            Some(top) => top.base + 1 + REGISTER_COUNT as usize,
                            None => 0,
                        };
                        return Ok(result);
                    }

                    self.stack[frame.base] = result;

                    self.stack_top = match self.frames.last() {
                        Some(top) => top.base + 1 + REGISTER_COUNT as usize,
                        None => 0,
                    };

                    (function, callee, base, ip) = self.frame_context();
                }
                OpCode::Acc => {
                    let value = if flags & TYPE_LEFT_CONSTANT != 0 {
                        constant!(a)
                    } else {
                        get_reg!(a)
                    };
                    self.acc = value;
                }
                OpCode::Dis => {
                    let text = if a == REGISTER_NULL {
                        disassemble_to_string(&self.heap, &function.cluster)
                    } else {
                        let value = get_reg!(a);
                        let target = match value {
                            Value::Dense(handle) => match self.heap.dense(handle) {
                                Dense::Function(f) => Rc::clone(f),
                                Dense::Closure(c) => Rc::clone(&c.function),
                                _ => rt_err!("Expected a function"),
                            },
                            _ => rt_err!("Expected a function"),
                        };
                        disassemble_to_string(&self.heap, &target.cluster)
                    };
                    self.io.out(&text);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    fn frame_upvalue(&self, callee: DenseRef, index: u8) -> Option<DenseRef> {
        match self.heap.dense(callee) {
            Dense::Closure(closure) => closure.upvalues.get(index as usize).copied(),
            _ => None,
        }
    }

    /// Finds or creates the open upvalue for a stack slot, keeping the
    /// open list sorted by slot, descending.
    fn capture_upvalue(&mut self, slot: usize) -> DenseRef {
        let mut position = 0;

        while position < self.open_upvalues.len() {
            let handle = self.open_upvalues[position];

            match self.heap.dense(handle) {
                Dense::Upvalue(DenseUpvalue {
                    state: UpvalueState::Open(existing),
                }) => {
                    if *existing == slot {
                        return handle;
                    }
                    if *existing < slot {
                        break;
                    }
                }
                _ => break,
            }

            position += 1;
        }

        let handle = self.alloc_dense(Dense::Upvalue(DenseUpvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(position, handle);

        handle
    }

    /// Closes every open upvalue at or above `slot`: the referenced value
    /// moves into the upvalue, and the upvalue leaves the open list.
    pub(crate) fn close_upvalues(&mut self, slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let open_slot = match self.heap.dense(handle) {
                Dense::Upvalue(DenseUpvalue {
                    state: UpvalueState::Open(open_slot),
                }) => *open_slot,
                _ => break,
            };

            if open_slot < slot {
                break;
            }

            let value = self.stack[open_slot];
            *self.heap.dense_mut(handle) = Dense::Upvalue(DenseUpvalue {
                state: UpvalueState::Closed(value),
            });

            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    fn index_value(&self, source: Value, key: Value) -> Result<Value, String> {
        let handle = match source {
            Value::Dense(handle) => handle,
            _ => return Err("Expected string, array, or object".to_string()),
        };

        match self.heap.dense(handle) {
            Dense::Array(items) => {
                let index = integer_key(key)?;

                items
                    .get(index)
                    .copied()
                    .ok_or_else(|| "Index out of bounds".to_string())
            }
            Dense::Str(s) => {
                let index = integer_key(key)?;

                s.bytes
                    .get(index)
                    .map(|byte| Value::Byte(*byte))
                    .ok_or_else(|| "Index out of bounds".to_string())
            }
            Dense::Object(object) => {
                let key = string_key(&self.heap, key)?;

                object
                    .get(key)
                    .ok_or_else(|| "Object key not found".to_string())
            }
            _ => Err("Expected string, array, or object".to_string()),
        }
    }

    fn index_assign(&mut self, target: Value, key: Value, value: Value) -> Result<(), String> {
        let handle = match target {
            Value::Dense(handle) => handle,
            _ => return Err("Expected array or object".to_string()),
        };

        let is_array = matches!(self.heap.dense(handle), Dense::Array(_));
        let is_object = matches!(self.heap.dense(handle), Dense::Object(_));

        if is_array {
            let index = integer_key(key)?;

            match self.heap.dense_mut(handle) {
                Dense::Array(items) => {
                    // Assigning one past the end appends.
                    if index == items.len() {
                        items.push(value);
                        Ok(())
                    } else if index < items.len() {
                        items[index] = value;
                        Ok(())
                    } else {
                        Err("Index out of bounds".to_string())
                    }
                }
                _ => Err("Expected array or object".to_string()),
            }
        } else if is_object {
            let key = string_key(&self.heap, key)?;

            match self.heap.dense_mut(handle) {
                Dense::Object(object) => {
                    object.set(key, value);
                    Ok(())
                }
                _ => Err("Expected array or object".to_string()),
            }
        } else {
            Err("Expected array or object".to_string())
        }
    }
}

enum Callee {
    Function(Rc<Function>),
    Closure(Rc<Function>),
    Native(NativeId),
    NotCallable,
}

impl HeapContext for Vm {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn intern(&mut self, bytes: &[u8]) -> DenseRef {
        Vm::intern(self, bytes)
    }

    fn register(&mut self, dense: Dense) -> DenseRef {
        self.heap.register(dense)
    }
}

fn integer_key(key: Value) -> Result<usize, String> {
    match key {
        Value::Byte(b) => Ok(b as usize),
        Value::Int(i) if i >= 0 => Ok(i as usize),
        Value::Int(_) => Err("Index out of bounds".to_string()),
        _ => Err("Expected an integer index".to_string()),
    }
}

fn string_key(heap: &Heap, key: Value) -> Result<DenseRef, String> {
    match key {
        Value::Dense(handle) if heap.as_string(handle).is_some() => Ok(handle),
        _ => Err("Expected a string key".to_string()),
    }
}

/// Numeric promotion for two operands: byte stays byte only against
/// another byte, anything meeting a float becomes float, otherwise int.
enum Promoted {
    Bytes(u8, u8),
    Ints(i64, i64),
    Floats(f64, f64),
}

fn promote(left: Value, right: Value) -> Option<Promoted> {
    use Value::*;

    let promoted = match (left, right) {
        (Byte(l), Byte(r)) => Promoted::Bytes(l, r),

        (Byte(l), Int(r)) => Promoted::Ints(i64::from(l), r),
        (Int(l), Byte(r)) => Promoted::Ints(l, i64::from(r)),
        (Int(l), Int(r)) => Promoted::Ints(l, r),

        (Byte(l), Float(r)) => Promoted::Floats(f64::from(l), r),
        (Int(l), Float(r)) => Promoted::Floats(l as f64, r),
        (Float(l), Byte(r)) => Promoted::Floats(l, f64::from(r)),
        (Float(l), Int(r)) => Promoted::Floats(l, r as f64),
        (Float(l), Float(r)) => Promoted::Floats(l, r),

        _ => return None,
    };

    Some(promoted)
}

fn arithmetic(op: OpCode, left: Value, right: Value) -> Result<Value, String> {
    let promoted = match promote(left, right) {
        Some(promoted) => promoted,
        None => {
            return Err(match op {
                OpCode::Add => "Expected numeric or string operands".to_string(),
                _ => "Expected numeric operands".to_string(),
            })
        }
    };

    match op {
        OpCode::Add => Ok(match promoted {
            Promoted::Bytes(l, r) => Value::Byte(l.wrapping_add(r)),
            Promoted::Ints(l, r) => Value::Int(l.wrapping_add(r)),
            Promoted::Floats(l, r) => Value::Float(l + r),
        }),
        OpCode::Sub => Ok(match promoted {
            Promoted::Bytes(l, r) => Value::Byte(l.wrapping_sub(r)),
            Promoted::Ints(l, r) => Value::Int(l.wrapping_sub(r)),
            Promoted::Floats(l, r) => Value::Float(l - r),
        }),
        OpCode::Mul => Ok(match promoted {
            Promoted::Bytes(l, r) => Value::Byte(l.wrapping_mul(r)),
            Promoted::Ints(l, r) => Value::Int(l.wrapping_mul(r)),
            Promoted::Floats(l, r) => Value::Float(l * r),
        }),
        OpCode::Div => match promoted {
            Promoted::Bytes(_, 0) => Err("Division by zero".to_string()),
            Promoted::Ints(_, 0) => Err("Division by zero".to_string()),
            Promoted::Floats(_, r) if r == 0.0 => Err("Division by zero".to_string()),
            Promoted::Bytes(l, r) => Ok(Value::Byte(l / r)),
            Promoted::Ints(l, r) => Ok(Value::Int(l.wrapping_div(r))),
            Promoted::Floats(l, r) => Ok(Value::Float(l / r)),
        },
        OpCode::Mod => match promoted {
            Promoted::Bytes(_, 0) => Err("Modulus by zero".to_string()),
            Promoted::Ints(_, 0) => Err("Modulus by zero".to_string()),
            Promoted::Floats(_, r) if r == 0.0 => Err("Modulus by zero".to_string()),
            Promoted::Bytes(l, r) => Ok(Value::Byte(l % r)),
            Promoted::Ints(l, r) => Ok(Value::Int(l.wrapping_rem(r))),
            // fmod semantics: the result has the dividend's sign.
            Promoted::Floats(l, r) => Ok(Value::Float(l % r)),
        },
        OpCode::Shl | OpCode::Shr => {
            let (l, r) = match promoted {
                Promoted::Bytes(l, r) => (i64::from(l), i64::from(r)),
                Promoted::Ints(l, r) => (l, r),
                Promoted::Floats(..) => return Err("Expected byte or int operands".to_string()),
            };

            if r < 0 {
                return Err("Shift amount cannot be negative".to_string());
            }

            let shifted = if op == OpCode::Shl {
                l.wrapping_shl(r as u32)
            } else {
                l.wrapping_shr(r as u32)
            };

            Ok(match promoted {
                Promoted::Bytes(..) => Value::Byte(shifted as u8),
                _ => Value::Int(shifted),
            })
        }
        OpCode::Band | OpCode::Bxor | OpCode::Bor => {
            let apply = |l: i64, r: i64| match op {
                OpCode::Band => l & r,
                OpCode::Bxor => l ^ r,
                _ => l | r,
            };

            match promoted {
                Promoted::Bytes(l, r) => {
                    Ok(Value::Byte(apply(i64::from(l), i64::from(r)) as u8))
                }
                Promoted::Ints(l, r) => Ok(Value::Int(apply(l, r))),
                Promoted::Floats(..) => Err("Expected byte or int operands".to_string()),
            }
        }
        _ => unreachable!("not an arithmetic opcode"),
    }
}

fn comparison(op: OpCode, left: Value, right: Value) -> Result<Value, String> {
    let ordering = match promote(left, right) {
        Some(Promoted::Bytes(l, r)) => l.partial_cmp(&r),
        Some(Promoted::Ints(l, r)) => l.partial_cmp(&r),
        Some(Promoted::Floats(l, r)) => l.partial_cmp(&r),
        None => return Err("Expected numeric operands".to_string()),
    };

    let ordering = match ordering {
        Some(ordering) => ordering,
        None => return Ok(Value::Bool(false)),
    };

    let result = match op {
        OpCode::Lt => ordering.is_lt(),
        OpCode::Lte => ordering.is_le(),
        OpCode::Gt => ordering.is_gt(),
        OpCode::Gte => ordering.is_ge(),
        _ => unreachable!("not a comparison opcode"),
    };

    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_rules() {
        assert!(matches!(
            promote(Value::Byte(1), Value::Byte(2)),
            Some(Promoted::Bytes(1, 2))
        ));
        assert!(matches!(
            promote(Value::Byte(1), Value::Int(2)),
            Some(Promoted::Ints(1, 2))
        ));
        assert!(matches!(
            promote(Value::Int(1), Value::Float(2.0)),
            Some(Promoted::Floats(..))
        ));
        assert!(promote(Value::Null, Value::Int(1)).is_none());
        assert!(promote(Value::Bool(true), Value::Int(1)).is_none());
    }

    #[test]
    fn test_division_by_zero_all_types() {
        assert!(arithmetic(OpCode::Div, Value::Int(1), Value::Int(0)).is_err());
        assert!(arithmetic(OpCode::Div, Value::Byte(1), Value::Byte(0)).is_err());
        assert!(arithmetic(OpCode::Div, Value::Float(0.0), Value::Float(0.0)).is_err());
        assert!(arithmetic(OpCode::Mod, Value::Int(1), Value::Int(0)).is_err());
        assert!(arithmetic(OpCode::Mod, Value::Float(1.0), Value::Float(0.0)).is_err());
    }

    #[test]
    fn test_float_mod_uses_fmod() {
        let result = arithmetic(OpCode::Mod, Value::Float(7.5), Value::Float(2.0));
        assert_eq!(result.ok(), Some(Value::Float(1.5)));
    }

    #[test]
    fn test_comparisons_coerce() {
        assert_eq!(
            comparison(OpCode::Lt, Value::Int(1), Value::Float(1.5)).ok(),
            Some(Value::Bool(true))
        );
        assert_eq!(
            comparison(OpCode::Gte, Value::Byte(2), Value::Int(2)).ok(),
            Some(Value::Bool(true))
        );
        assert!(comparison(OpCode::Lt, Value::Null, Value::Int(1)).is_err());
    }

    #[test]
    fn test_shift_rejects_negative() {
        assert!(arithmetic(OpCode::Shl, Value::Int(1), Value::Int(-1)).is_err());
        assert_eq!(
            arithmetic(OpCode::Shl, Value::Int(1), Value::Int(4)).ok(),
            Some(Value::Int(16))
        );
    }

    #[test]
    fn test_invoke_native() {
        fn double(_vm: &mut Vm, _argc: u8, args: &[Value]) -> Value {
            match args.first() {
                Some(Value::Int(i)) => Value::Int(i * 2),
                _ => Value::Null,
            }
        }

        let mut vm = Vm::with_io(RisaIo::capture().0);
        let callee = vm.native_value(double);

        let result = vm.invoke(callee, &[Value::Int(21)]).expect("invoke");
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_intern_produces_identity() {
        let mut vm = Vm::with_io(RisaIo::capture().0);
        let a = vm.intern(b"hello");
        let b = vm.intern(b"hello");
        let c = vm.intern(b"other");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
