//! The `debug` object: introspection helpers, plus a nested `vm` object
//! for the accumulator, heap and stack statistics, and a manual GC
//! trigger.

use risa_core::heap::Dense;
use risa_core::Value;

use crate::stdlib::object_constant;
use crate::vm::{Vm, STACK_SIZE};

pub fn register(vm: &mut Vm) {
    let acc = vm.native_value(vm_acc);
    let heap_size = vm.native_value(vm_heap_size);
    let stack_size = vm.native_value(vm_stack_size);
    let gc = vm.native_value(vm_gc);

    let vm_object = object_constant(
        vm,
        &[
            ("acc", acc),
            ("heapSize", heap_size),
            ("stackSize", stack_size),
            ("gc", gc),
        ],
    );

    let type_native = vm.native_value(type_of);
    let addr = vm.native_value(addr);

    let debug = object_constant(
        vm,
        &[("vm", vm_object), ("type", type_native), ("addr", addr)],
    );
    vm.global_set("debug", debug);
}

/// Unlike `typeof`, distinguishes functions, closures and natives.
fn type_of(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    if argc == 0 {
        return Value::Null;
    }

    let name = match args[0] {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Byte(_) => "byte",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Dense(handle) => match vm.heap().dense(handle) {
            Dense::Str(_) => "string",
            Dense::Array(_) => "array",
            Dense::Object(_) => "object",
            Dense::Upvalue(_) => "upvalue",
            Dense::Function(_) => "function",
            Dense::Closure(_) => "closure",
            Dense::Native(_) => "native",
        },
    };

    Value::Dense(vm.intern(name.as_bytes()))
}

fn addr(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    if argc == 0 {
        return Value::Null;
    }

    match args[0] {
        Value::Dense(handle) => {
            let text = format!("{:#x}", handle.index());
            Value::Dense(vm.intern(text.as_bytes()))
        }
        _ => Value::Null,
    }
}

fn vm_acc(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    if argc == 0 {
        return vm.acc;
    }

    vm.acc = args[0];
    vm.acc
}

fn vm_heap_size(vm: &mut Vm, _argc: u8, _args: &[Value]) -> Value {
    Value::Int(vm.heap().bytes() as i64)
}

fn vm_stack_size(_vm: &mut Vm, _argc: u8, _args: &[Value]) -> Value {
    Value::Int((STACK_SIZE * std::mem::size_of::<Value>()) as i64)
}

fn vm_gc(vm: &mut Vm, _argc: u8, _args: &[Value]) -> Value {
    vm.gc_run();
    Value::Null
}
