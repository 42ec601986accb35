//! Tracing mark-and-sweep collection.
//!
//! Triggered from allocation points when the heap passes its threshold;
//! the threshold doubles after every cycle. Roots are the live stack, the
//! callee of every frame, the open upvalues, the globals (keys and values)
//! and the accumulator. The interned-string table is weak: strings only
//! survive through real references, and dead entries are erased from the
//! table between marking and sweeping.

use risa_core::heap::{Dense, DenseRef, UpvalueState};
use risa_core::Value;

use crate::vm::Vm;

impl Vm {
    /// Collection point: runs a cycle when the heap has outgrown the
    /// threshold, then doubles it.
    pub fn gc_check(&mut self) {
        if self.heap().bytes() >= self.heap_threshold() {
            self.gc_run();

            let threshold = self.heap_threshold() * 2;
            self.set_heap_threshold(threshold);
        }
    }

    /// One full mark-and-sweep cycle.
    pub fn gc_run(&mut self) {
        let before = self.heap().bytes();

        // Mark phase, with an explicit worklist instead of recursion;
        // cycles terminate on the mark bit.
        let mut gray: Vec<DenseRef> = self
            .gc_roots()
            .filter_map(|value| value.as_dense())
            .collect();

        while let Some(handle) = gray.pop() {
            if self.heap().is_marked(handle) {
                continue;
            }
            self.heap_mut().set_marked(handle, true);

            trace_children(self, handle, &mut gray);
        }

        // The string table holds its keys weakly.
        let (heap, strings) = self.strings_mut();
        let dead: Vec<DenseRef> = strings
            .iter()
            .map(|(key, _)| key)
            .filter(|key| !heap.is_marked(*key))
            .collect();

        for key in dead {
            let (heap, strings) = self.strings_mut();
            strings.erase(heap, key);
        }

        // Sweep in ascending slot order, clearing marks on survivors.
        let handles: Vec<DenseRef> = self.heap().handles().collect();

        for handle in handles {
            if self.heap().is_marked(handle) {
                self.heap_mut().set_marked(handle, false);
            } else {
                self.heap_mut().free(handle);
            }
        }

        log::debug!(
            "gc cycle: {} -> {} bytes, {} live objects",
            before,
            self.heap().bytes(),
            self.heap().len()
        );
    }
}

/// Pushes every dense value directly reachable from `handle`.
fn trace_children(vm: &Vm, handle: DenseRef, gray: &mut Vec<DenseRef>) {
    let mut push_value = |gray: &mut Vec<DenseRef>, value: Value| {
        if let Value::Dense(child) = value {
            gray.push(child);
        }
    };

    match vm.heap().dense(handle) {
        Dense::Str(_) | Dense::Native(_) => (),
        Dense::Array(items) => {
            for item in items {
                push_value(gray, *item);
            }
        }
        Dense::Object(object) => {
            for (key, value) in object.entries.iter() {
                gray.push(*key);
                push_value(gray, *value);
            }
        }
        Dense::Upvalue(upvalue) => {
            if let UpvalueState::Closed(value) = upvalue.state {
                push_value(gray, value);
            }
        }
        Dense::Function(function) => {
            if let Some(name) = function.name {
                gray.push(name);
            }
            for constant in &function.cluster.constants {
                push_value(gray, *constant);
            }
        }
        // The function travels by `Rc` inside the closure, so its name and
        // constants are traced through the closure itself.
        Dense::Closure(closure) => {
            if let Some(name) = closure.function.name {
                gray.push(name);
            }
            for constant in &closure.function.cluster.constants {
                push_value(gray, *constant);
            }
            for upvalue in &closure.upvalues {
                gray.push(*upvalue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RisaIo;

    fn test_vm() -> Vm {
        Vm::with_io(RisaIo::capture().0)
    }

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut vm = test_vm();

        vm.register_dense(Dense::Array(vec![Value::Int(1)]));
        let live = vm.register_dense(Dense::Array(vec![Value::Int(2)]));
        vm.global_set("keep", Value::Dense(live));

        vm.gc_run();

        // The kept array survived; the orphan did not.
        assert!(vm
            .heap()
            .handles()
            .any(|handle| handle == live));
        assert_eq!(
            vm.heap()
                .handles()
                .filter(|handle| matches!(vm.heap().dense(*handle), Dense::Array(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_marks_are_reset_after_cycle() {
        let mut vm = test_vm();

        let live = vm.register_dense(Dense::Array(vec![]));
        vm.global_set("keep", Value::Dense(live));

        vm.gc_run();

        for handle in vm.heap().handles() {
            assert!(!vm.heap().is_marked(handle));
        }
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut vm = test_vm();

        // a[0] = b, b[0] = a, neither reachable from a root.
        let a = vm.register_dense(Dense::Array(vec![]));
        let b = vm.register_dense(Dense::Array(vec![Value::Dense(a)]));
        match vm.heap_mut().dense_mut(a) {
            Dense::Array(items) => items.push(Value::Dense(b)),
            _ => unreachable!(),
        }

        let before = vm.heap().len();
        assert_eq!(before, 2);

        vm.gc_run();
        assert_eq!(vm.heap().len(), 0);
    }

    #[test]
    fn test_weak_string_table() {
        let mut vm = test_vm();

        let kept = vm.intern(b"kept");
        vm.global_set("name", Value::Dense(kept));
        vm.intern(b"orphan");

        vm.gc_run();

        // "kept" still resolves to the same handle; "orphan" was erased
        // and re-interning it builds a fresh string.
        assert_eq!(vm.intern(b"kept"), kept);
        assert!(vm.heap().handles().all(|handle| {
            vm.heap().as_string(handle).map(|s| &*s.bytes) != Some(b"orphan".as_slice())
        }));
    }

    #[test]
    fn test_heap_bytes_match_slot_sizes() {
        let mut vm = test_vm();

        vm.intern(b"abc");
        let arr = vm.register_dense(Dense::Array(vec![]));
        vm.global_set("a", Value::Dense(arr));

        vm.gc_run();

        let expected: usize = vm
            .heap()
            .handles()
            .map(|handle| vm.heap().dense(handle).size())
            .sum();
        assert_eq!(vm.heap().bytes(), expected);
    }

    #[test]
    fn test_accumulator_is_a_root() {
        let mut vm = test_vm();

        let value = vm.register_dense(Dense::Array(vec![Value::Int(9)]));
        vm.acc = Value::Dense(value);

        vm.gc_run();

        assert!(vm.heap().handles().any(|handle| handle == value));
    }

    #[test]
    fn test_threshold_doubles() {
        let mut vm = test_vm();
        vm.set_heap_threshold(1);

        vm.intern(b"trigger");
        vm.gc_check();

        assert_eq!(vm.heap_threshold(), 2);
    }
}
