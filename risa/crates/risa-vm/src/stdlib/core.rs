//! `typeof` and `foreach`.

use risa_core::heap::Dense;
use risa_core::Value;

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    vm.global_set_native("typeof", type_of);
    vm.global_set_native("foreach", foreach);
}

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
            Dense::Function(_) | Dense::Closure(_) | Dense::Native(_) => "function",
        },
    };

    Value::Dense(vm.intern(name.as_bytes()))
}

/// `foreach(array, fn)` calls back into script code once per element.
fn foreach(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    if argc < 2 {
        return Value::Null;
    }

    let items = match args[0] {
        Value::Dense(handle) => match vm.heap().dense(handle) {
            Dense::Array(items) => items.clone(),
            _ => return Value::Null,
        },
        _ => return Value::Null,
    };

    let callable = match args[1] {
        Value::Dense(handle) => matches!(
            vm.heap().dense(handle),
            Dense::Function(_) | Dense::Closure(_) | Dense::Native(_)
        ),
        _ => false,
    };

    if !callable {
        return Value::Null;
    }

    for item in items {
        match vm.invoke(args[1], &[item]) {
            Ok(_) => (),
            Err(error) => {
                vm.set_pending_error(error);
                return Value::Null;
            }
        }
    }

    Value::Null
}
