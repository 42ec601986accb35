//! The `math` object: `min` and `max` with full numeric coercion.

use risa_core::Value;

use crate::stdlib::object_constant;
use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    let min = vm.native_value(min);
    let max = vm.native_value(max);

    let math = object_constant(vm, &[("min", min), ("max", max)]);
    vm.global_set("math", math);
}

/// Numeric less-than across byte/int/float; `None` for non-numerics.
fn less_than(left: Value, right: Value) -> Option<bool> {
    use Value::*;

    let result = match (left, right) {
        (Byte(l), Byte(r)) => l < r,
        (Byte(l), Int(r)) => i64::from(l) < r,
        (Byte(l), Float(r)) => f64::from(l) < r,

        (Int(l), Byte(r)) => l < i64::from(r),
        (Int(l), Int(r)) => l < r,
        (Int(l), Float(r)) => (l as f64) < r,

        (Float(l), Byte(r)) => l < f64::from(r),
        (Float(l), Int(r)) => l < (r as f64),
        (Float(l), Float(r)) => l < r,

        _ => return None,
    };

    Some(result)
}

fn extremum(argc: u8, args: &[Value], keep_left: fn(Value, Value) -> Option<bool>) -> Value {
    if argc == 0 {
        return Value::Null;
    }

    let mut best = match args[0] {
        value @ (Value::Byte(_) | Value::Int(_) | Value::Float(_)) => value,
        _ => return Value::Null,
    };

    for arg in &args[1..argc as usize] {
        match keep_left(*arg, best) {
            Some(true) => best = *arg,
            Some(false) => (),
            None => return Value::Null,
        }
    }

    best
}

fn min(_vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    extremum(argc, args, less_than)
}

fn max(_vm: &mut Vm, argc: u8, args: &[Value]) -> Value {
    extremum(argc, args, |left, right| less_than(right, left))
}
