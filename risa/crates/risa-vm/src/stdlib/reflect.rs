//! `reflect`: read, write, or snapshot the global table from script code.

use risa_core::heap::{Dense, DenseObject};
use risa_core::Value;

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    vm.global_set_native("reflect", reflect);
}

/// - `reflect()` returns an object snapshot of every global.
/// - `reflect(name)` reads one global, or `null`.
/// - `reflect(name, value)` writes a global and returns the value.
fn reflect(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    match argc {
        0 => {
            let mut snapshot = DenseObject::new();
            for (key, value) in vm.globals.iter() {
                snapshot.set(key, value);
            }

            Value::Dense(vm.register_dense(Dense::Object(snapshot)))
        }
        1 => {
            let key = match args[0] {
                Value::Dense(handle) if vm.heap().as_string(handle).is_some() => handle,
                _ => return Value::Null,
            };

            vm.globals.get(vm.heap(), key).unwrap_or(Value::Null)
        }
        _ => {
            let key = match args[0] {
                Value::Dense(handle) if vm.heap().as_string(handle).is_some() => handle,
                _ => return Value::Null,
            };

            vm.global_set_handle(key, args[1]);
            args[1]
        }
    }
}
