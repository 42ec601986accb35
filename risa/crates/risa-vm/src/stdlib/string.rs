//! String natives: `substr`, `toUpper`, `toLower`, `beginsWith`,
//! `endsWith`. Strings are byte sequences; case mapping is ASCII-only.

use risa_core::heap::DenseRef;
use risa_core::Value;

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    vm.global_set_native("substr", substr);
    vm.global_set_native("toUpper", to_upper);
    vm.global_set_native("toLower", to_lower);
    vm.global_set_native("beginsWith", begins_with);
    vm.global_set_native("endsWith", ends_with);
}

fn string_arg(vm: &Vm, value: Value) -> Option<DenseRef> {
    match value {
        Value::Dense(handle) if vm.heap().as_string(handle).is_some() => Some(handle),
        _ => None,
    }
}

fn numeric_arg(value: Value) -> Option<i64> {
    match value {
        Value::Byte(b) => Some(i64::from(b)),
        Value::Int(i) => Some(i),
        Value::Float(f) => Some(f as i64),
        _ => None,
    }
}

fn substr(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    let handle = match args.first().copied().and_then(|arg| string_arg(vm, arg)) {
        Some(handle) => handle,
        None => return Value::Null,
    };

    if argc == 1 {
        return args[0];
    }

    let total = vm.heap().string_bytes(handle).len() as i64;

    let index = match numeric_arg(args[1]) {
        Some(index) if index >= 0 && index < total => index,
        _ => return Value::Null,
    };

    let length = if argc >= 3 {
        match numeric_arg(args[2]) {
            Some(length) if length > 0 && index + length <= total => length,
            _ => return Value::Null,
        }
    } else {
        total - index
    };

    let bytes =
        vm.heap().string_bytes(handle)[index as usize..(index + length) as usize].to_vec();
    Value::Dense(vm.intern(&bytes))
}

fn to_upper(vm: &mut Vm, _argc: u8, args: &[Value]) -> Value {
    map_case(vm, args, u8::to_ascii_uppercase)
}

fn to_lower(vm: &mut Vm, _argc: u8, args: &[Value]) -> Value {
    map_case(vm, args, u8::to_ascii_lowercase)
}

fn map_case(vm: &mut Vm, args: &[Value], map: fn(&u8) -> u8) -> Value {
    let handle = match args.first().copied().and_then(|arg| string_arg(vm, arg)) {
        Some(handle) => handle,
        None => return Value::Null,
    };

    let bytes: Vec<u8> = vm.heap().string_bytes(handle).iter().map(map).collect();
    Value::Dense(vm.intern(&bytes))
}

fn begins_with(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    match prefix_args(vm, argc, args) {
        Some((string, prefix)) => {
            let string = vm.heap().string_bytes(string);
            let prefix = vm.heap().string_bytes(prefix);
            Value::Bool(string.starts_with(prefix))
        }
        None => Value::Null,
    }
}

fn ends_with(vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    match prefix_args(vm, argc, args) {
        Some((string, suffix)) => {
            let string = vm.heap().string_bytes(string);
            let suffix = vm.heap().string_bytes(suffix);
            Value::Bool(string.ends_with(suffix))
        }
        None => Value::Null,
    }
}

fn prefix_args(vm: &Vm, argc: u8, args: &[Value]) -> Option<(DenseRef, DenseRef)> {
    if argc < 2 {
        return None;
    }

    let string = string_arg(vm, args[0])?;
    let other = string_arg(vm, args[1])?;
    Some((string, other))
}
