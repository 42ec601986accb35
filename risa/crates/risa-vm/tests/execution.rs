//! End-to-end execution tests: source text through the compiler and the
//! interpreter, asserting on captured output.

use std::cell::RefCell;
use std::rc::Rc;

use risa_compiler::{compile, CompilerOptions};
use risa_core::heap::{Dense, Function};
use risa_core::{OpCode, Value};
use risa_vm::io::RisaIo;
use risa_vm::vm::RuntimeError;
use risa_vm::{stdlib, Vm};

struct Session {
    vm: Vm,
    out: Rc<RefCell<String>>,
    #[allow(dead_code)]
    err: Rc<RefCell<String>>,
}

fn session() -> Session {
    let (io, out, err) = RisaIo::capture();
    let mut vm = Vm::with_io(io);
    stdlib::register_all(&mut vm);

    Session { vm, out, err }
}

impl Session {
    fn interpret(&mut self, source: &str) -> Result<Value, RuntimeError> {
        let script = compile(source, &mut self.vm, CompilerOptions::default())
            .unwrap_or_else(|error| panic!("compile failed: {:?}", error.diagnostics));

        let handle = self.vm.register_dense(Dense::Function(script));
        self.vm.execute_script(handle)
    }

    fn output(&self) -> String {
        self.out.borrow().clone()
    }
}

/// Runs a source string and returns captured stdout; panics on errors.
fn run(source: &str) -> String {
    let mut session = session();
    session.interpret(source).expect("execution failed");
    session.output()
}

/// Runs a source string expecting a runtime error.
fn run_error(source: &str) -> RuntimeError {
    let mut session = session();
    session
        .interpret(source)
        .expect_err("expected a runtime error")
}

// ============================================================================
// CORE SCENARIOS
// ============================================================================

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run("println(1 + 2 * 3);"), "7\n");
}

#[test]
fn test_string_concatenation() {
    assert_eq!(
        run("var s = \"hello\"; println(s + \" world\");"),
        "hello world\n"
    );
}

#[test]
fn test_recursive_factorial() {
    let source =
        "function fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } println(fact(6));";

    let mut session = session();
    session.interpret(source).expect("execution failed");

    assert_eq!(session.output(), "720\n");
    // fact(6) nests six frames over the script frame.
    assert!(session.vm.max_frame_depth() <= 7);
}

#[test]
fn test_closure_captures_value() {
    let source = "function mk(x) { return () => x; } var f = mk(42); println(f());";

    let mut session = session();
    session.interpret(source).expect("execution failed");

    assert_eq!(session.output(), "42\n");

    // Exactly one closure exists, holding exactly one upvalue.
    let heap = session.vm.heap();
    let closures: Vec<_> = heap
        .handles()
        .filter_map(|handle| match heap.dense(handle) {
            Dense::Closure(closure) => Some(closure.upvalues.len()),
            _ => None,
        })
        .collect();
    assert_eq!(closures, vec![1]);

    // The captured local was closed when mk returned.
    assert_eq!(session.vm.open_upvalue_count(), 0);
}

#[test]
fn test_for_loop_array_sum() {
    let source =
        "var a = [10,20,30]; var s = 0; for (var i = 0; i < 3; i = i + 1) s = s + a[i]; println(s);";
    assert_eq!(run(source), "60\n");
}

#[test]
fn test_object_index_assignment() {
    assert_eq!(
        run("var o = {}; o[\"k\"] = \"v\"; println(o[\"k\"]);"),
        "v\n"
    );
}

// ============================================================================
// EXPRESSIONS AND OPERATORS
// ============================================================================

#[test]
fn test_short_circuit_operators() {
    assert_eq!(run("println(true && false);"), "false\n");
    assert_eq!(run("println(false || 3);"), "3\n");
    // The right side must not run when short-circuited.
    assert_eq!(
        run("function boom() { return 0 / 0; } var x = false; println(x && boom());"),
        "false\n"
    );
}

#[test]
fn test_ternary_arms_share_register() {
    assert_eq!(run("println((false ? 1 : 2) + 10);"), "12\n");
    assert_eq!(run("println((true ? 1 : 2) + 10);"), "11\n");
}

#[test]
fn test_comparisons_and_equality() {
    assert_eq!(run("println(1 == 1.0);"), "true\n");
    assert_eq!(run("println(1 != 2);"), "true\n");
    assert_eq!(run("println(2 >= 2);"), "true\n");
    assert_eq!(run("println(1 > 2);"), "false\n");
}

#[test]
fn test_bitwise_and_shift() {
    assert_eq!(run("println(6 & 3);"), "2\n");
    assert_eq!(run("println(6 | 3);"), "7\n");
    assert_eq!(run("println(6 ^ 3);"), "5\n");
    assert_eq!(run("println(1 << 4);"), "16\n");
    assert_eq!(run("println(16 >> 2);"), "4\n");
    assert_eq!(run("println(~0);"), "-1\n");
}

#[test]
fn test_unary_operators() {
    assert_eq!(run("println(-5);"), "-5\n");
    assert_eq!(run("println(!true);"), "false\n");
    assert_eq!(run("println(!0);"), "true\n");
}

#[test]
fn test_numeric_promotion() {
    assert_eq!(run("println(1 + 2.5);"), "3.5\n");
    assert_eq!(run("println(10b + 5b);"), "15\n");
    assert_eq!(run("println(7 / 2);"), "3\n");
    assert_eq!(run("println(7.0 / 2);"), "3.5\n");
    assert_eq!(run("println(7 % 3);"), "1\n");
}

#[test]
fn test_compound_assignment() {
    assert_eq!(run("var x = 10; x += 5; println(x);"), "15\n");
    assert_eq!(run("var x = 10; x -= 5; println(x);"), "5\n");
    assert_eq!(run("var x = 10; x *= 2; println(x);"), "20\n");
    assert_eq!(run("var x = 10; x /= 2; println(x);"), "5\n");
    assert_eq!(run("var a = [1]; a[0] += 9; println(a[0]);"), "10\n");
}

#[test]
fn test_increment_decrement() {
    assert_eq!(run("var i = 1; println(i++); println(i);"), "1\n2\n");
    assert_eq!(run("var i = 1; println(++i); println(i);"), "2\n2\n");
    assert_eq!(run("var i = 1; println(i--); println(i);"), "1\n0\n");
    assert_eq!(run("var a = [5]; println(a[0]++); println(a[0]);"), "5\n6\n");
}

#[test]
fn test_comma_operator() {
    assert_eq!(run("println((1, 2, 3));"), "3\n");
}

#[test]
fn test_clone_is_deep_for_containers() {
    assert_eq!(
        run("var a = [1]; var b = clone a; b[0] = 2; println(a[0]); println(b[0]);"),
        "1\n2\n"
    );
}

// ============================================================================
// STATEMENTS
// ============================================================================

#[test]
fn test_if_else() {
    assert_eq!(run("if (1 < 2) println(\"yes\"); else println(\"no\");"), "yes\n");
    assert_eq!(run("if (1 > 2) println(\"yes\"); else println(\"no\");"), "no\n");
}

#[test]
fn test_while_loop() {
    assert_eq!(
        run("var i = 0; while (i < 5) { i = i + 1; } println(i);"),
        "5\n"
    );
}

#[test]
fn test_break_and_continue() {
    let source = "var s = 0; \
                  for (var i = 0; i < 10; i = i + 1) { \
                      if (i == 3) continue; \
                      if (i == 8) break; \
                      s = s + i; \
                  } \
                  println(s);";
    assert_eq!(run(source), "25\n");
}

#[test]
fn test_continue_with_depth() {
    let source = "var c = 0; \
                  for (var i = 0; i < 3; i = i + 1) { \
                      for (var j = 0; j < 3; j = j + 1) { \
                          if (j == 1) continue 2; \
                          c = c + 1; \
                      } \
                      c = c + 10; \
                  } \
                  println(c);";
    assert_eq!(run(source), "3\n");
}

#[test]
fn test_break_zero_targets_outermost() {
    let source = "var c = 0; \
                  while (c < 100) { c = c + 1; } \
                  for (var i = 0; i < 5; i = i + 1) { \
                      for (var j = 0; j < 5; j = j + 1) { \
                          break 0; \
                      } \
                      c = c + 1000; \
                  } \
                  println(c);";
    assert_eq!(run(source), "100\n");
}

#[test]
fn test_block_scoping() {
    assert_eq!(
        run("var x = 1; { var y = 2; println(x + y); } println(x);"),
        "3\n1\n"
    );
}

// ============================================================================
// FUNCTIONS AND CLOSURES
// ============================================================================

#[test]
fn test_arrow_function_body() {
    assert_eq!(run("function double(x) => x * 2; println(double(21));"), "42\n");
}

#[test]
fn test_lambda_with_parameters() {
    assert_eq!(run("var add = (a, b) => a + b; println(add(2, 3));"), "5\n");
}

#[test]
fn test_lambda_with_block_body() {
    assert_eq!(
        run("var f = (n) => { return n + 1; }; println(f(9));"),
        "10\n"
    );
}

#[test]
fn test_grouping_is_not_lambda() {
    assert_eq!(run("println((1 + 2) * 3);"), "9\n");
}

#[test]
fn test_shared_upvalue_mutation() {
    let source = "function mk() { \
                      var count = 0; \
                      var inc = () => { count = count + 1; return count; }; \
                      var get = () => count; \
                      inc(); inc(); \
                      return get(); \
                  } \
                  println(mk());";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_fibonacci() {
    let source = "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } \
                  println(fib(10));";
    assert_eq!(run(source), "55\n");
}

// ============================================================================
// STDLIB
// ============================================================================

#[test]
fn test_typeof() {
    assert_eq!(run("println(typeof(1));"), "int\n");
    assert_eq!(run("println(typeof(\"s\"));"), "string\n");
    assert_eq!(run("println(typeof([1]));"), "array\n");
    assert_eq!(run("println(typeof(null));"), "null\n");
    assert_eq!(run("println(typeof(typeof));"), "function\n");
}

#[test]
fn test_foreach_reenters_vm() {
    let source = "var total = 0; \
                  function add(v) { total = total + v; } \
                  foreach([1, 2, 3], add); \
                  println(total);";
    assert_eq!(run(source), "6\n");
}

#[test]
fn test_string_natives() {
    assert_eq!(run("println(toUpper(\"abc\"));"), "ABC\n");
    assert_eq!(run("println(toLower(\"AbC\"));"), "abc\n");
    assert_eq!(run("println(substr(\"hello\", 1, 3));"), "ell\n");
    assert_eq!(run("println(substr(\"hello\", 1));"), "ello\n");
    assert_eq!(run("println(beginsWith(\"hello\", \"he\"));"), "true\n");
    assert_eq!(run("println(endsWith(\"hello\", \"lo\"));"), "true\n");
    assert_eq!(run("println(substr(\"hi\", 9));"), "null\n");
}

#[test]
fn test_math_object() {
    assert_eq!(run("println(math.min(3, 1.5, 2));"), "1.5\n");
    assert_eq!(run("println(math.max(3, 1.5, 2));"), "3\n");
}

#[test]
fn test_reflect() {
    assert_eq!(
        run("reflect(\"answer\", 42); println(reflect(\"answer\"));"),
        "42\n"
    );
    assert_eq!(run("println(reflect(\"no_such_global\"));"), "null\n");
}

#[test]
fn test_debug_object() {
    assert_eq!(run("println(debug.type(debug));"), "object\n");
    assert_eq!(run("debug.vm.gc(); println(1);"), "1\n");
}

#[test]
fn test_print_without_newline() {
    assert_eq!(run("print(1, 2); print(3);"), "123");
}

// ============================================================================
// RUNTIME ERRORS
// ============================================================================

#[test]
fn test_division_by_zero_family() {
    assert_eq!(run_error("var x = 1 / 0;").message, "Division by zero");
    assert_eq!(run_error("var x = 1b / 0b;").message, "Division by zero");
    assert_eq!(run_error("var x = 0.0 / 0.0;").message, "Division by zero");
    assert_eq!(run_error("var x = 1 % 0;").message, "Modulus by zero");
}

#[test]
fn test_undefined_variable() {
    let error = run_error("println(no_such_thing);");
    assert_eq!(error.message, "Undefined variable 'no_such_thing'");
}

#[test]
fn test_call_errors() {
    assert_eq!(run_error("var x = 1; x();").message, "Can only call functions");
    assert_eq!(
        run_error("function f(a) { return a; } f(1, 2);").message,
        "Invalid argument count: expected 1, got 2"
    );
}

#[test]
fn test_index_errors() {
    assert_eq!(run_error("var a = [1]; println(a[5]);").message, "Index out of bounds");
    assert_eq!(run_error("var a = [1]; a[5] = 2;").message, "Index out of bounds");
    assert_eq!(
        run_error("var o = {}; println(o[\"missing\"]);").message,
        "Object key not found"
    );
}

#[test]
fn test_array_append_one_past_end() {
    assert_eq!(run("var a = [1]; a[1] = 2; println(a);"), "[1, 2]\n");
}

#[test]
fn test_type_errors() {
    assert_eq!(
        run_error("var x = 1 + true;").message,
        "Expected numeric or string operands"
    );
    assert_eq!(
        run_error("var x = 1.5 & 2;").message,
        "Expected byte or int operands"
    );
}

#[test]
fn test_stack_overflow() {
    let error = run_error("function f() { return f(); } f();");
    assert_eq!(error.message, "Stack overflow");
}

#[test]
fn test_error_carries_source_index() {
    let source = "var x = 1;\nvar y = x / 0;";
    let error = run_error(source);

    // The index points inside the second line.
    assert!(error.index as usize > source.find('\n').unwrap());
}

// ============================================================================
// VALUES AND INTERNING
// ============================================================================

#[test]
fn test_repeated_literals_intern_to_one_string() {
    let mut session = session();
    session
        .interpret("var a = \"twin\"; var b = \"twin\"; println(a == b);")
        .expect("execution failed");

    assert_eq!(session.output(), "true\n");

    let heap = session.vm.heap();
    let twins = heap
        .handles()
        .filter(|handle| {
            heap.as_string(*handle).map(|s| &*s.bytes) == Some(b"twin".as_slice())
        })
        .count();
    assert_eq!(twins, 1);
}

#[test]
fn test_array_and_object_printing() {
    assert_eq!(run("println([1, \"two\", null]);"), "[1, two, null]\n");
    assert_eq!(run("println({ a: 1, b: 2 });"), "{ \"a\": 1, \"b\": 2 }\n");
    assert_eq!(run("println({});"), "{  }\n");
}

#[test]
fn test_function_printing() {
    assert_eq!(run("function f() { return 0; } println(f);"), "<fn f>\n");
    assert_eq!(run("println(println);"), "<native fn>\n");
}

#[test]
fn test_dot_and_index_access_agree() {
    assert_eq!(
        run("var o = { k: 3 }; println(o.k); println(o[\"k\"]); o.k = 4; println(o.k);"),
        "3\n3\n4\n"
    );
}

#[test]
fn test_byte_literals() {
    assert_eq!(run("println(255b);"), "255\n");
    assert_eq!(run("println(typeof(7b));"), "byte\n");
}

#[test]
fn test_string_indexing_yields_bytes() {
    assert_eq!(run("var s = \"A\"; println(s[0]);"), "65\n");
}

// ============================================================================
// HAND-BUILT CLUSTERS
// ============================================================================

/// Builds, registers and executes a function from raw instructions.
fn run_cluster(
    session: &mut Session,
    constants: &[Value],
    instructions: &[[u8; 4]],
) -> Result<Value, RuntimeError> {
    let mut cluster = risa_core::Cluster::new();

    for constant in constants {
        cluster.constants.push(*constant);
    }
    for instr in instructions {
        for byte in instr {
            cluster.write(*byte, 0);
        }
    }

    let handle = session.vm.register_dense(Dense::Function(Rc::new(Function {
        name: None,
        arity: 0,
        cluster,
    })));

    session.vm.execute_script(handle)
}

#[test]
fn test_len_instruction() {
    let mut session = session();
    let s = session.vm.intern(b"abcde");

    let result = run_cluster(
        &mut session,
        &[Value::Dense(s)],
        &[
            [OpCode::Cnst as u8, 0, 0, 0],
            [OpCode::Len as u8, 1, 0, 0],
            [OpCode::Ret as u8, 1, 0, 0],
        ],
    );

    assert_eq!(result.expect("execution failed"), Value::Int(5));
}

#[test]
fn test_constant_operand_flags() {
    use risa_core::bytecode::{TYPE_LEFT_CONSTANT, TYPE_RIGHT_CONSTANT};

    let mut session = session();

    // ADD with both operands taken from the constant pool.
    let result = run_cluster(
        &mut session,
        &[Value::Int(30), Value::Int(12)],
        &[
            [
                OpCode::Add as u8 | TYPE_LEFT_CONSTANT | TYPE_RIGHT_CONSTANT,
                0,
                0,
                1,
            ],
            [OpCode::Ret as u8, 0, 0, 0],
        ],
    );

    assert_eq!(result.expect("execution failed"), Value::Int(42));
}

#[test]
fn test_dis_instruction_writes_listing() {
    use risa_core::bytecode::REGISTER_NULL;

    let mut session = session();
    let result = run_cluster(
        &mut session,
        &[],
        &[
            [OpCode::Dis as u8, REGISTER_NULL, 0, 0],
            [OpCode::Ret as u8, REGISTER_NULL, 0, 0],
        ],
    );

    result.expect("execution failed");
    assert!(session.output().contains("OFFS INDX OP"));
    assert!(session.output().contains("DIS"));
}

#[test]
fn test_malformed_bytecode_is_an_error() {
    let mut session = session();

    let result = run_cluster(&mut session, &[], &[[0x3F, 0, 0, 0]]);
    assert!(result.is_err());
}

// ============================================================================
// REPL MODE AND THE ACCUMULATOR
// ============================================================================

#[test]
fn test_repl_mode_stores_accumulator() {
    let (io, _, _) = RisaIo::capture();
    let mut vm = Vm::with_io(io);
    stdlib::register_all(&mut vm);

    let script = compile("1 + 2;", &mut vm, CompilerOptions { repl_mode: true })
        .expect("compile failed");
    let handle = vm.register_dense(Dense::Function(script));
    vm.execute_script(handle).expect("execution failed");

    assert_eq!(vm.acc, Value::Int(3));
}

#[test]
fn test_globals_persist_across_scripts() {
    let mut session = session();
    session.interpret("var x = 41;").expect("first script");
    session.interpret("println(x + 1);").expect("second script");

    assert_eq!(session.output(), "42\n");
}

// ============================================================================
// PERSISTENCE THROUGH A LIVE VM
// ============================================================================

#[test]
fn test_serialized_script_runs_identically() {
    use risa_core::serial::{deserialize_cluster, serialize_cluster};

    let source = "println(\"persisted \" + \"output\");";

    // Compile and serialize in one VM.
    let mut first = session();
    let script = compile(source, &mut first.vm, CompilerOptions::default())
        .expect("compile failed");
    let bytes = serialize_cluster(first.vm.heap(), &script.cluster).expect("serialize");

    // Reload and execute in a completely fresh VM.
    let mut second = session();
    let cluster = deserialize_cluster(&mut second.vm, &bytes).expect("deserialize");
    let handle = second.vm.register_dense(Dense::Function(Rc::new(Function {
        name: None,
        arity: 0,
        cluster,
    })));
    second.vm.execute_script(handle).expect("execution failed");

    assert_eq!(second.output(), "persisted output\n");
}

#[test]
fn test_gc_during_execution_preserves_live_data() {
    let source = "var keep = []; \
                  for (var i = 0; i < 100; i = i + 1) { \
                      var junk = [i, i, i]; \
                      keep[i] = i * 2; \
                      debug.vm.gc(); \
                  } \
                  println(keep[99]);";
    assert_eq!(run(source), "198\n");
}
