//! The single-pass register compiler.
//!
//! Compilation state is a stack of per-function compilers sharing one
//! parser: compiling a nested function pushes a fresh state, compiles the
//! body into its own cluster, then pops and emits the finished function as
//! a constant of the enclosing cluster.
//!
//! Register discipline: every expression leaves its result in the highest
//! reserved register; binary operators fold two registers into one.
//! Register usage is stack-shaped within an expression, and locals pin the
//! registers they were declared in until their scope ends.

mod expr;

use std::rc::Rc;

use risa_core::bytecode::{
    INSTRUCTION_SIZE, REGISTER_COUNT, REGISTER_NULL, TYPE_LEFT_CONSTANT, TYPE_RIGHT_CONSTANT,
};
use risa_core::heap::{Dense, DenseRef, Function, HeapContext};
use risa_core::{Cluster, OpCode, Value};
use risa_lex::TokenKind;
use risa_util::Diagnostic;
use thiserror::Error;

use crate::parser::Parser;

/// Compilation failed; the diagnostics carry every reported error.
#[derive(Debug, Error)]
#[error("compilation failed")]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompilerOptions {
    /// Emit `ACC` after top-level expression statements so a REPL can show
    /// the last value.
    pub repl_mode: bool,
}

/// Compiles a source string into the top-level script function.
///
/// Strings and nested functions are interned and registered through `ctx`,
/// so a VM passed here sees compile-time strings as its own.
pub fn compile(
    source: &str,
    ctx: &mut dyn HeapContext,
    options: CompilerOptions,
) -> Result<Rc<Function>, CompileError> {
    let mut compiler = Compiler {
        parser: Parser::new(source),
        ctx,
        stack: vec![FunctionState::new(None)],
        options,
        prefix_incdec: false,
    };

    while !compiler.parser.check(TokenKind::Eof) {
        compiler.compile_declaration();
    }

    compiler.emit_return();

    let state = compiler.pop_state();

    if compiler.parser.handler.has_errors() {
        return Err(CompileError {
            diagnostics: compiler.parser.handler.take(),
        });
    }

    log::debug!(
        "compiled script: {} instructions, {} constants",
        state.cluster.size() / INSTRUCTION_SIZE,
        state.cluster.constants.len()
    );

    Ok(Rc::new(Function {
        name: None,
        arity: 0,
        cluster: state.cluster,
    }))
}

/// A local variable: its name, declaration depth, pinned register, and
/// whether an inner function captured it.
struct Local<'src> {
    name: &'src str,
    depth: i32,
    reg: u8,
    captured: bool,
}

/// One captured variable of the function being compiled.
#[derive(Clone, Copy)]
pub(crate) struct UpvalueRef {
    pub index: u8,
    pub is_local: bool,
}

/// A pending `break`/`continue` awaiting its loop-end patch.
struct Leap {
    index: usize,
    depth: u8,
    is_break: bool,
}

/// Where the last compiled expression can be stored back to.
#[derive(Clone, Copy)]
pub(crate) enum Lval {
    Local { reg: u8 },
    Upvalue { index: u8 },
    Global { name: u8 },
    Property { origin: u8, key: PropKey },
}

/// A property key operand: either a small constant index or a register.
#[derive(Clone, Copy)]
pub(crate) enum PropKey {
    Const(u8),
    Reg(u8),
}

/// Per-function compilation state.
pub(crate) struct FunctionState<'src> {
    name: Option<DenseRef>,
    arity: u8,
    cluster: Cluster,

    reg_index: u8,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    leaps: Vec<Leap>,
    loop_count: u8,
    scope_depth: i32,

    last_lval: Option<Lval>,
}

impl<'src> FunctionState<'src> {
    fn new(name: Option<DenseRef>) -> Self {
        Self {
            name,
            arity: 0,
            cluster: Cluster::new(),
            reg_index: 0,
            locals: Vec::new(),
            upvalues: Vec::new(),
            leaps: Vec::new(),
            loop_count: 0,
            scope_depth: 0,
            last_lval: None,
        }
    }
}

pub(crate) struct Compiler<'src, 'ctx> {
    pub(crate) parser: Parser<'src>,
    pub(crate) ctx: &'ctx mut dyn HeapContext,
    stack: Vec<FunctionState<'src>>,
    options: CompilerOptions,
    /// Set while compiling the operand of a prefix `++`/`--`, so property
    /// reads keep their origin and key registers alive for the store-back.
    pub(crate) prefix_incdec: bool,
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    pub(crate) fn state(&mut self) -> &mut FunctionState<'src> {
        match self.stack.last_mut() {
            Some(state) => state,
            None => unreachable!("compiler state stack is empty"),
        }
    }

    fn state_ref(&self) -> &FunctionState<'src> {
        match self.stack.last() {
            Some(state) => state,
            None => unreachable!("compiler state stack is empty"),
        }
    }

    fn pop_state(&mut self) -> FunctionState<'src> {
        match self.stack.pop() {
            Some(state) => state,
            None => unreachable!("compiler state stack is empty"),
        }
    }

    // ------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------

    pub(crate) fn register_reserve(&mut self) -> bool {
        if self.state_ref().reg_index == REGISTER_COUNT {
            self.parser.error_at_current("Register limit exceeded (250)");
            false
        } else {
            self.state().reg_index += 1;
            true
        }
    }

    pub(crate) fn register_free(&mut self) {
        // Saturating: error recovery can unwind past an expression that
        // never managed to reserve its register.
        let state = self.state();
        state.reg_index = state.reg_index.saturating_sub(1);
    }

    /// The register holding the most recent expression result.
    pub(crate) fn top_reg(&self) -> u8 {
        self.state_ref().reg_index.saturating_sub(1)
    }

    pub(crate) fn clear_lval(&mut self) {
        self.state().last_lval = None;
    }

    pub(crate) fn set_lval(&mut self, lval: Lval) {
        self.state().last_lval = Some(lval);
    }

    pub(crate) fn take_lval(&mut self) -> Option<Lval> {
        self.state().last_lval.take()
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    pub(crate) fn emit(&mut self, op: OpCode, a: u8, b: u8, c: u8) {
        self.emit_flagged(op, 0, a, b, c);
    }

    pub(crate) fn emit_flagged(&mut self, op: OpCode, flags: u8, a: u8, b: u8, c: u8) {
        let index = self.parser.previous.index;
        let cluster = &mut self.state().cluster;

        cluster.write(op as u8 | flags, index);
        cluster.write(a, index);
        cluster.write(b, index);
        cluster.write(c, index);
    }

    /// Emits four zero bytes, to be patched into a jump later.
    pub(crate) fn emit_blank(&mut self) -> usize {
        let index = self.parser.previous.index;
        let cluster = &mut self.state().cluster;

        for _ in 0..INSTRUCTION_SIZE {
            cluster.write(0, index);
        }

        cluster.size() - INSTRUCTION_SIZE
    }

    /// Patches the blank at `index` into a forward jump to the current end.
    ///
    /// The distance is counted in instructions. Byte form when it fits,
    /// word form otherwise; the blank's remaining operand bytes stay zero.
    pub(crate) fn patch_jump(&mut self, index: usize) {
        let size = self.state_ref().cluster.size();
        let diff = (size - index - INSTRUCTION_SIZE) / INSTRUCTION_SIZE;

        let cluster = &mut self.state().cluster;

        if diff <= u8::MAX as usize {
            cluster.bytecode[index] = OpCode::Jmp as u8;
            cluster.bytecode[index + 1] = diff as u8;
        } else if diff <= u16::MAX as usize {
            let word = (diff as u16).to_le_bytes();

            cluster.bytecode[index] = OpCode::Jmpw as u8;
            cluster.bytecode[index + 1] = word[0];
            cluster.bytecode[index + 2] = word[1];
        } else {
            self.parser.error_at_previous("Jump limit exceeded (65535)");
        }
    }

    pub(crate) fn emit_backwards_jump(&mut self, to: usize) {
        let from = self.state_ref().cluster.size();
        self.emit_backwards_jump_from(from, to);
    }

    /// Backward jump from `from` to `to`. When `from` is the current end a
    /// fresh instruction is emitted; otherwise the blank at `from` is
    /// overwritten with the opcode and the 8- or 16-bit distance.
    pub(crate) fn emit_backwards_jump_from(&mut self, from: usize, to: usize) {
        let size = self.state_ref().cluster.size();
        let diff = (from - to) / INSTRUCTION_SIZE;

        if diff <= u8::MAX as usize {
            if from == size {
                self.emit(OpCode::Bjmp, diff as u8, 0, 0);
            } else {
                let cluster = &mut self.state().cluster;
                cluster.bytecode[from] = OpCode::Bjmp as u8;
                cluster.bytecode[from + 1] = diff as u8;
            }
        } else if diff <= u16::MAX as usize {
            let word = (diff as u16).to_le_bytes();

            if from == size {
                let index = self.parser.previous.index;
                let cluster = &mut self.state().cluster;
                cluster.write(OpCode::Bjmpw as u8, index);
                cluster.write(word[0], index);
                cluster.write(word[1], index);
                cluster.write(0, index);
            } else {
                let cluster = &mut self.state().cluster;
                cluster.bytecode[from] = OpCode::Bjmpw as u8;
                cluster.bytecode[from + 1] = word[0];
                cluster.bytecode[from + 2] = word[1];
            }
        } else {
            self.parser.error_at_previous("Jump limit exceeded (65535)");
        }
    }

    pub(crate) fn create_constant(&mut self, value: Value) -> u16 {
        let index = self.state().cluster.write_constant(value);

        if index > u16::MAX as usize {
            self.parser
                .error_at_previous("Constant limit exceeded (65535)");
            return 0;
        }

        index as u16
    }

    pub(crate) fn create_string_constant(&mut self, bytes: &[u8]) -> u16 {
        let handle = self.ctx.intern(bytes);
        self.create_constant(Value::Dense(handle))
    }

    pub(crate) fn create_identifier_constant(&mut self) -> u16 {
        let text = self.parser.previous.text;
        self.create_string_constant(text.as_bytes())
    }

    /// Loads a constant into the top register; wide form past index 255.
    pub(crate) fn emit_constant(&mut self, value: Value) {
        let index = self.create_constant(value);
        let reg = self.top_reg();

        if index <= u8::MAX as u16 {
            self.emit(OpCode::Cnst, reg, index as u8, 0);
        } else {
            let word = index.to_le_bytes();
            self.emit(OpCode::Cnstw, reg, word[0], word[1]);
        }
    }

    pub(crate) fn emit_return(&mut self) {
        self.emit(OpCode::Ret, REGISTER_NULL, 0, 0);
    }

    /// Global name operands ride in a single instruction byte.
    pub(crate) fn global_operand(&mut self, index: u16) -> u8 {
        if index > u8::MAX as u16 {
            self.parser
                .error_at_previous("Global name limit exceeded (255)");
            return 0;
        }

        index as u8
    }

    pub(crate) fn emit_store(&mut self, lval: Lval, src: u8) {
        match lval {
            Lval::Local { reg } => self.emit(OpCode::Mov, reg, src, 0),
            Lval::Upvalue { index } => self.emit(OpCode::Supval, index, src, 0),
            Lval::Global { name } => self.emit(OpCode::Sglob, name, src, 0),
            Lval::Property { origin, key } => self.emit_set(origin, key, src),
        }
    }

    pub(crate) fn emit_get(&mut self, dst: u8, src: u8, key: PropKey) {
        match key {
            PropKey::Const(index) => {
                self.emit_flagged(OpCode::Get, TYPE_RIGHT_CONSTANT, dst, src, index)
            }
            PropKey::Reg(reg) => self.emit(OpCode::Get, dst, src, reg),
        }
    }

    pub(crate) fn emit_set(&mut self, origin: u8, key: PropKey, val: u8) {
        match key {
            PropKey::Const(index) => {
                self.emit_flagged(OpCode::Set, TYPE_LEFT_CONSTANT, origin, index, val)
            }
            PropKey::Reg(reg) => self.emit(OpCode::Set, origin, reg, val),
        }
    }

    // ------------------------------------------------------------------
    // Scopes, locals, upvalues
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;

        loop {
            let scope_depth = self.state_ref().scope_depth;
            let captured = match self.state_ref().locals.last() {
                Some(local) if local.depth > scope_depth => local.captured,
                _ => break,
            };

            if captured {
                let reg = self.top_reg();
                self.emit(OpCode::Cupval, reg, 0, 0);
            }

            self.register_free();
            self.state().locals.pop();
        }
    }

    fn local_add(&mut self, name: &'src str) {
        if self.state_ref().locals.len() == REGISTER_COUNT as usize {
            self.parser
                .error_at_previous("Local variable limit exceeded (250)");
            return;
        }

        let reg = self.state_ref().reg_index;
        self.state().locals.push(Local {
            name,
            depth: -1,
            reg,
            captured: false,
        });
    }

    /// Resolves a name to an initialized local of the function at `level`.
    /// Returns the local's position and register.
    fn local_resolve(&self, level: usize, name: &str) -> Option<(usize, u8)> {
        let state = &self.stack[level];

        state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.depth > -1 && local.name == name)
            .map(|(position, local)| (position, local.reg))
    }

    fn upvalue_add(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let state = &mut self.stack[level];

        for (position, upvalue) in state.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return position as u8;
            }
        }

        if state.upvalues.len() == REGISTER_COUNT as usize {
            self.parser
                .error_at_previous("Closure variable limit exceeded (250)");
            return 0;
        }

        let state = &mut self.stack[level];
        state.upvalues.push(UpvalueRef { index, is_local });
        (state.upvalues.len() - 1) as u8
    }

    /// Resolves a name captured from an enclosing function, adding upvalue
    /// entries down the compiler chain.
    fn upvalue_resolve(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }

        let enclosing = level - 1;

        if let Some((position, reg)) = self.local_resolve(enclosing, name) {
            self.stack[enclosing].locals[position].captured = true;
            return Some(self.upvalue_add(level, reg, true));
        }

        if let Some(upvalue) = self.upvalue_resolve(enclosing, name) {
            return Some(self.upvalue_add(level, upvalue, false));
        }

        None
    }

    pub(crate) fn resolve_name(&mut self, name: &str) -> Resolution {
        let level = self.stack.len() - 1;

        if let Some((_, reg)) = self.local_resolve(level, name) {
            return Resolution::Local(reg);
        }

        if let Some(index) = self.upvalue_resolve(level, name) {
            return Resolution::Upvalue(index);
        }

        let constant = self.create_identifier_constant();
        Resolution::Global(constant)
    }

    /// Consumes an identifier and declares it: as a local in block scope,
    /// or as a global name constant at top level.
    fn declare_variable(&mut self) -> u16 {
        self.parser
            .consume(TokenKind::Identifier, "Expected identifier");

        if self.state_ref().scope_depth > 0 {
            let name = self.parser.previous.text;
            let scope_depth = self.state_ref().scope_depth;

            let duplicate = self
                .state_ref()
                .locals
                .iter()
                .rev()
                .take_while(|local| local.depth == -1 || local.depth >= scope_depth)
                .any(|local| local.name == name);

            if duplicate {
                self.parser
                    .error_at_previous("Variable already declared in this scope");
            }

            self.local_add(name);
            return 0;
        }

        self.create_identifier_constant()
    }

    fn mark_initialized(&mut self) {
        let depth = self.state_ref().scope_depth;
        if let Some(local) = self.state().locals.last_mut() {
            local.depth = depth;
        }
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    pub(crate) fn compile_declaration(&mut self) {
        if self.parser.matches(TokenKind::Var) {
            self.compile_variable_declaration();
        } else if self.parser.matches(TokenKind::Function) {
            self.compile_function_declaration();
        } else {
            self.compile_statement();
        }

        if self.parser.panic {
            self.parser.sync();
        }
    }

    fn compile_variable_declaration(&mut self) {
        let index = self.declare_variable();

        if self.parser.matches(TokenKind::Equal) {
            self.compile_expression();
        } else {
            if !self.register_reserve() {
                return;
            }
            let reg = self.top_reg();
            self.emit(OpCode::Null, reg, 0, 0);
        }

        self.parser.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration",
        );

        if self.state_ref().scope_depth > 0 {
            // The initializer's register becomes the local itself.
            self.mark_initialized();
            return;
        }

        self.register_free();

        let name = self.global_operand(index);
        let value = self.state_ref().reg_index;
        self.emit(OpCode::Dglob, name, value, 0);
    }

    fn compile_function_declaration(&mut self) {
        let index = self.declare_variable();
        let name = self.parser.previous.text;

        if self.state_ref().scope_depth > 0 {
            self.mark_initialized();
        }

        self.compile_function(name);

        if self.state_ref().scope_depth > 0 {
            return;
        }

        self.register_free();

        let name = self.global_operand(index);
        let value = self.state_ref().reg_index;
        self.emit(OpCode::Dglob, name, value, 0);
    }

    fn compile_function(&mut self, name: &str) {
        let interned = self.ctx.intern(name.as_bytes());
        self.stack.push(FunctionState::new(Some(interned)));
        self.begin_scope();

        self.parser
            .consume(TokenKind::LeftParen, "Expected '(' after function name");
        self.compile_parameters("Expected ')' after parameters");

        if self.parser.matches(TokenKind::EqualGreater) {
            self.compile_return_statement();
        } else {
            self.parser
                .consume(TokenKind::LeftBrace, "Expected '{' before function body");
            self.compile_block();
            self.emit_return();
        }

        self.finish_function();
    }

    pub(crate) fn compile_lambda(&mut self) {
        let interned = self.ctx.intern(b"lambda");
        self.stack.push(FunctionState::new(Some(interned)));
        self.begin_scope();

        self.compile_parameters("Expected ')' after lambda parameters");
        self.parser.consume(
            TokenKind::EqualGreater,
            "Expected '=>' after lambda parameters",
        );

        if self.parser.matches(TokenKind::LeftBrace) {
            self.compile_block();
            self.emit_return();
        } else {
            self.compile_return_expression();
        }

        self.finish_function();
    }

    fn compile_parameters(&mut self, closing_message: &str) {
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                if self.state_ref().arity == REGISTER_COUNT {
                    self.parser
                        .error_at_current("Parameter limit exceeded (250)");
                } else {
                    self.state().arity += 1;
                }

                self.declare_variable();
                self.mark_initialized();

                // Arguments arrive in the first registers of the frame.
                self.state().reg_index += 1;

                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.parser.consume(TokenKind::RightParen, closing_message);
    }

    /// Pops the finished function state and emits it into the enclosing
    /// cluster: a plain constant load, or CLSR plus one UPVAL follow-line
    /// per capture.
    fn finish_function(&mut self) {
        let state = self.pop_state();
        let upvalues = state.upvalues.clone();

        let function = Function {
            name: state.name,
            arity: state.arity,
            cluster: state.cluster,
        };
        let handle = self.ctx.register(Dense::Function(Rc::new(function)));

        if !self.register_reserve() {
            return;
        }

        self.emit_constant(Value::Dense(handle));

        if !upvalues.is_empty() {
            let reg = self.top_reg();
            self.emit(OpCode::Clsr, reg, reg, upvalues.len() as u8);

            for upvalue in upvalues {
                self.emit(OpCode::Upval, upvalue.index, u8::from(upvalue.is_local), 0);
            }
        }

        self.clear_lval();
    }

    fn compile_statement(&mut self) {
        if self.parser.matches(TokenKind::If) {
            self.compile_if_statement();
        } else if self.parser.matches(TokenKind::While) {
            self.compile_while_statement();
        } else if self.parser.matches(TokenKind::For) {
            self.compile_for_statement();
        } else if self.parser.matches(TokenKind::Return) {
            self.compile_return_statement();
        } else if self.parser.matches(TokenKind::Continue) {
            self.compile_leap_statement(false);
        } else if self.parser.matches(TokenKind::Break) {
            self.compile_leap_statement(true);
        } else if self.parser.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.compile_block();
            self.end_scope();
        } else {
            self.compile_expression_statement();
        }
    }

    fn compile_if_statement(&mut self) {
        self.parser
            .consume(TokenKind::LeftParen, "Expected '(' after 'if'");
        self.compile_expression();
        self.parser
            .consume(TokenKind::RightParen, "Expected ')' after condition");

        let cond = self.top_reg();
        self.emit(OpCode::Test, cond, 0, 0);
        self.register_free();

        let if_end = self.emit_blank();

        self.compile_statement();

        let else_end = self.emit_blank();
        self.patch_jump(if_end);

        if self.parser.matches(TokenKind::Else) {
            self.compile_statement();
        }

        self.patch_jump(else_end);
    }

    fn compile_while_statement(&mut self) {
        let start = self.state_ref().cluster.size();

        self.parser
            .consume(TokenKind::LeftParen, "Expected '(' after 'while'");
        self.compile_expression();
        self.parser
            .consume(TokenKind::RightParen, "Expected ')' after condition");

        let cond = self.top_reg();
        self.emit(OpCode::Test, cond, 0, 0);
        self.register_free();

        let end = self.emit_blank();

        if !self.enter_loop() {
            return;
        }

        self.compile_statement();

        self.emit_backwards_jump(start);
        self.patch_jump(end);

        self.exit_loop(start);
    }

    fn compile_for_statement(&mut self) {
        self.begin_scope();

        self.parser
            .consume(TokenKind::LeftParen, "Expected '(' after 'for'");

        if self.parser.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.parser.matches(TokenKind::Var) {
            self.compile_variable_declaration();
        } else {
            self.compile_expression_statement();
        }

        let mut start = self.state_ref().cluster.size();
        let mut exit = None;

        if !self.parser.check(TokenKind::Semicolon) {
            self.compile_expression();
            self.parser
                .consume(TokenKind::Semicolon, "Expected ';' after loop condition");

            let cond = self.top_reg();
            self.emit(OpCode::Test, cond, 0, 0);
            self.register_free();

            exit = Some(self.emit_blank());
        } else {
            self.parser.advance();
        }

        if !self.parser.check(TokenKind::RightParen) {
            // The body runs before the post clause; jump over it on the
            // way in, and loop back to it afterwards.
            let body_jump = self.emit_blank();
            let post = self.state_ref().cluster.size();

            self.compile_expression();
            self.register_free();

            self.parser
                .consume(TokenKind::RightParen, "Expected ')' after clauses");

            self.emit_backwards_jump(start);
            start = post;
            self.patch_jump(body_jump);
        } else {
            self.parser.advance();
        }

        if !self.enter_loop() {
            return;
        }

        self.compile_statement();
        self.emit_backwards_jump(start);

        if let Some(exit) = exit {
            self.patch_jump(exit);
        }

        self.exit_loop(start);

        self.end_scope();
    }

    /// Guards the loop counter; pending leaps gain one level of depth for
    /// the duration of this loop's body.
    fn enter_loop(&mut self) -> bool {
        if self.state_ref().loop_count == REGISTER_COUNT {
            self.parser.error_at_previous("Loop limit exceeded (250)");
            return false;
        }

        self.state().loop_count += 1;

        for leap in &mut self.state().leaps {
            leap.depth += 1;
        }

        true
    }

    /// Patches every leap that targets this loop: breaks jump forward to
    /// the current end, continues jump back to `start`.
    fn exit_loop(&mut self, start: usize) {
        let mut leaps = std::mem::take(&mut self.state().leaps);

        for leap in &mut leaps {
            leap.depth -= 1;

            if leap.depth == 0 {
                if leap.is_break {
                    self.patch_jump(leap.index);
                } else {
                    self.emit_backwards_jump_from(leap.index, start);
                }
            }
        }

        leaps.retain(|leap| leap.depth > 0);
        self.state().leaps = leaps;

        self.state().loop_count -= 1;
    }

    fn compile_return_statement(&mut self) {
        if self.state_ref().name.is_none() {
            self.parser
                .error_at_previous("Cannot return from top-level scope");
        }

        if self.parser.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.compile_expression();
            self.parser
                .consume(TokenKind::Semicolon, "Expected ';' after return expression");

            let reg = self.top_reg();
            self.emit(OpCode::Ret, reg, 0, 0);
            self.register_free();
        }
    }

    /// Arrow-form function body: `=> expr` returns the expression.
    fn compile_return_expression(&mut self) {
        if self.parser.check(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.compile_expression();

            let reg = self.top_reg();
            self.emit(OpCode::Ret, reg, 0, 0);
            self.register_free();
        }
    }

    /// `continue [N];` / `break [N];` with N defaulting to 1 and 0 meaning
    /// the outermost enclosing loop.
    fn compile_leap_statement(&mut self, is_break: bool) {
        let verb = if is_break { "break" } else { "continue" };

        if self.state_ref().loop_count == 0 {
            let message = format!("Cannot {} outside of loops", verb);
            self.parser.error_at_previous(&message);
            return;
        }
        if self.state_ref().leaps.len() == REGISTER_COUNT as usize {
            self.parser.error_at_previous("Leap limit exceeded (250)");
            return;
        }

        let index = self.state_ref().cluster.size();

        let depth = if self.parser.matches(TokenKind::Semicolon) {
            1
        } else if self.parser.matches(TokenKind::Int) {
            let num = match risa_core::value::parse_int(self.parser.previous.text) {
                Some(num) => num,
                None => {
                    self.parser
                        .error_at_previous("Number is too large for type 'int'");
                    return;
                }
            };

            if num > i64::from(self.state_ref().loop_count) {
                let message = format!(
                    "Cannot {} from that many loops; consider using '{} 0;'",
                    verb, verb
                );
                self.parser.error_at_previous(&message);
                return;
            }

            let depth = if num == 0 {
                self.state_ref().loop_count
            } else {
                num as u8
            };

            let message = format!("Expected ';' after {} statement", verb);
            self.parser.consume(TokenKind::Semicolon, &message);

            depth
        } else {
            let message = format!("Expected ';' or number after '{}'", verb);
            self.parser.error_at_previous(&message);
            return;
        };

        self.state().leaps.push(Leap {
            index,
            depth,
            is_break,
        });
        self.emit_blank();
    }

    fn compile_block(&mut self) {
        while !self.parser.check(TokenKind::Eof) && !self.parser.check(TokenKind::RightBrace) {
            self.compile_declaration();
        }

        self.parser
            .consume(TokenKind::RightBrace, "Expected '}' after block");
    }

    fn compile_expression_statement(&mut self) {
        self.compile_expression();
        self.parser
            .consume(TokenKind::Semicolon, "Expected ';' after expression");

        if self.options.repl_mode && self.stack.len() == 1 {
            let reg = self.top_reg();
            self.emit(OpCode::Acc, reg, 0, 0);
        }

        self.register_free();
    }
}

/// How an identifier resolved: local register, upvalue index, or global
/// name constant.
#[derive(Clone, Copy)]
pub(crate) enum Resolution {
    Local(u8),
    Upvalue(u8),
    Global(u16),
}
