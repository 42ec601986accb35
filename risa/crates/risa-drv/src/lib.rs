//! risa-drv - The `risa` binary's REPL and file runner.
//!
//! Thin glue over the pipeline: compile a source string through the VM's
//! heap, execute it, and map failures to messages and exit codes.

use std::path::Path;

use anyhow::Result;
use risa_compiler::{compile, CompilerOptions};
use risa_core::heap::Dense;
use risa_util::line_column;
use risa_vm::{stdlib, RisaIo, Vm};

/// Exit code for a bad command line.
pub const EXIT_USAGE: i32 = 64;

/// Exit code for an unreadable input file.
pub const EXIT_NO_INPUT: i32 = 74;

/// Exit code reserved for out-of-memory aborts.
pub const EXIT_OOM: i32 = 137;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpretStatus {
    Ok,
    CompileError,
    RuntimeError,
}

/// A VM with the standard library registered.
pub fn create_vm(io: RisaIo) -> Vm {
    let mut vm = Vm::with_io(io);
    stdlib::register_all(&mut vm);
    vm
}

/// Compiles and runs one source string on the given VM. Errors print
/// through the VM's `err` handler with `line:column` positions.
pub fn interpret(vm: &mut Vm, source: &str) -> InterpretStatus {
    let options = CompilerOptions {
        repl_mode: vm.options.repl_mode,
    };

    let script = match compile(source, vm, options) {
        Ok(script) => script,
        Err(error) => {
            for diagnostic in &error.diagnostics {
                vm.io.err(&diagnostic.render(source));
                vm.io.err("\n");
            }
            return InterpretStatus::CompileError;
        }
    };

    let handle = vm.register_dense(Dense::Function(script));

    match vm.execute_script(handle) {
        Ok(_) => InterpretStatus::Ok,
        Err(error) => {
            let (line, column) = line_column(source, error.index);
            vm.io
                .err(&format!("at {}:{} in script: {}\n", line, column, error.message));
            InterpretStatus::RuntimeError
        }
    }
}

/// Runs a script file; returns the process exit code.
pub fn run_file(path: &Path) -> i32 {
    let io = RisaIo::default();

    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            io.err(&format!("Cannot open file '{}'\n", path.display()));
            return EXIT_NO_INPUT;
        }
    };

    let mut vm = create_vm(io);

    match interpret(&mut vm, &source) {
        InterpretStatus::Ok => 0,
        InterpretStatus::CompileError | InterpretStatus::RuntimeError => 1,
    }
}

/// The interactive loop. Each line runs as a statement; `exit` quits.
pub fn run_repl() -> Result<()> {
    let io = RisaIo::default();
    io.out(&format!(
        "Risa v{} '{}'\n(c) The Risa Developers\n\n",
        env!("CARGO_PKG_VERSION"),
        "Initus"
    ));

    let mut vm = create_vm(io);
    vm.options.repl_mode = true;

    let mut editor = rustyline::DefaultEditor::new()?;

    loop {
        let line = match editor.readline("#>") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" {
            break;
        }

        editor.add_history_entry(trimmed)?;

        // A line is a statement; insert the terminator when it is missing.
        let mut source = trimmed.to_string();
        if !source.ends_with(';') && !source.ends_with('}') {
            source.push(';');
        }

        vm.acc = risa_core::Value::Null;

        if interpret(&mut vm, &source) == InterpretStatus::Ok && !vm.acc.is_null() {
            let text = risa_core::value::to_display_string(vm.heap(), vm.acc);
            vm.io.out(&text);
            vm.io.out("\n");
        }
    }

    Ok(())
}
