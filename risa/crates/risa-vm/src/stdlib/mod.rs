//! Standard library natives.
//!
//! Each module registers named natives (or constant objects holding them)
//! into the VM's global table. Natives signal failure by returning `null`.

pub mod core;
pub mod debug;
pub mod io;
pub mod math;
pub mod reflect;
pub mod string;

use risa_core::heap::{Dense, DenseObject};
use risa_core::Value;

use crate::vm::Vm;

/// Registers every standard module.
pub fn register_all(vm: &mut Vm) {
    core::register(vm);
    io::register(vm);
    string::register(vm);
    math::register(vm);
    reflect::register(vm);
    debug::register(vm);
}

/// Builds a constant object from name/value pairs, registered with the
/// heap so it survives collection once stored in a global.
pub(crate) fn object_constant(vm: &mut Vm, entries: &[(&str, Value)]) -> Value {
    let mut object = DenseObject::new();

    for (name, value) in entries {
        let key = vm.intern(name.as_bytes());
        object.set(key, *value);
    }

    Value::Dense(vm.register_dense(Dense::Object(object)))
}
