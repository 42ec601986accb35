//! Pratt expression compilation.
//!
//! A rule table indexed by token kind drives parsing: each token may have a
//! prefix role, an infix role and a precedence. Assignment is only legal
//! while the current precedence allows it; a leftover `=` at a higher level
//! is an "Invalid assignment target" error.

use risa_core::value::{parse_byte, parse_float, parse_int};
use risa_core::{OpCode, Value};
use risa_lex::TokenKind;

use super::{Compiler, Lval, PropKey, Resolution};

/// Expression precedence, lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precedence {
    None,
    Comma,
    Assignment,
    Ternary,
    Or,
    And,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    /// One level tighter; used for left-associative binary operators.
    fn next(self) -> Precedence {
        use Precedence::*;

        match self {
            None => Comma,
            Comma => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => BitwiseOr,
            BitwiseOr => BitwiseXor,
            BitwiseXor => BitwiseAnd,
            BitwiseAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

#[derive(Clone, Copy)]
enum Prefix {
    Grouping,
    ArrayLiteral,
    ObjectLiteral,
    Unary,
    Increment,
    Decrement,
    CloneOf,
    Identifier,
    StringLit,
    ByteLit,
    IntLit,
    FloatLit,
    Literal,
}

#[derive(Clone, Copy)]
enum Infix {
    Call,
    Index,
    Dot,
    Binary,
    And,
    Or,
    Ternary,
    Comma,
}

struct Rule {
    prefix: Option<Prefix>,
    infix: Option<Infix>,
    precedence: Precedence,
}

const fn rule(prefix: Option<Prefix>, infix: Option<Infix>, precedence: Precedence) -> Rule {
    Rule {
        prefix,
        infix,
        precedence,
    }
}

fn rule_for(kind: TokenKind) -> Rule {
    use Precedence as P;
    use TokenKind as T;

    match kind {
        T::LeftParen => rule(Some(Prefix::Grouping), Some(Infix::Call), P::Call),
        T::LeftBracket => rule(Some(Prefix::ArrayLiteral), Some(Infix::Index), P::Call),
        T::LeftBrace => rule(Some(Prefix::ObjectLiteral), None, P::None),
        T::Dot => rule(None, Some(Infix::Dot), P::Call),
        T::Comma => rule(None, Some(Infix::Comma), P::Comma),

        T::Minus => rule(Some(Prefix::Unary), Some(Infix::Binary), P::Term),
        T::Plus => rule(None, Some(Infix::Binary), P::Term),
        T::Slash | T::Star | T::Percent => rule(None, Some(Infix::Binary), P::Factor),
        T::MinusMinus => rule(Some(Prefix::Decrement), None, P::None),
        T::PlusPlus => rule(Some(Prefix::Increment), None, P::None),

        T::Tilde => rule(Some(Prefix::Unary), None, P::None),
        T::Bang => rule(Some(Prefix::Unary), None, P::None),
        T::Caret => rule(None, Some(Infix::Binary), P::BitwiseXor),
        T::Ampersand => rule(None, Some(Infix::Binary), P::BitwiseAnd),
        T::Pipe => rule(None, Some(Infix::Binary), P::BitwiseOr),

        T::Question => rule(None, Some(Infix::Ternary), P::Ternary),

        T::BangEqual | T::EqualEqual => rule(None, Some(Infix::Binary), P::Equality),
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
            rule(None, Some(Infix::Binary), P::Comparison)
        }
        T::GreaterGreater | T::LessLess => rule(None, Some(Infix::Binary), P::Shift),

        T::AmpersandAmpersand => rule(None, Some(Infix::And), P::And),
        T::PipePipe => rule(None, Some(Infix::Or), P::Or),

        T::Identifier => rule(Some(Prefix::Identifier), None, P::None),
        T::String => rule(Some(Prefix::StringLit), None, P::None),
        T::Byte => rule(Some(Prefix::ByteLit), None, P::None),
        T::Int => rule(Some(Prefix::IntLit), None, P::None),
        T::Float => rule(Some(Prefix::FloatLit), None, P::None),
        T::True | T::False | T::Null => rule(Some(Prefix::Literal), None, P::None),
        T::Clone => rule(Some(Prefix::CloneOf), None, P::None),

        _ => rule(None, None, P::None),
    }
}

fn compound_op(kind: TokenKind) -> Option<OpCode> {
    match kind {
        TokenKind::PlusEqual => Some(OpCode::Add),
        TokenKind::MinusEqual => Some(OpCode::Sub),
        TokenKind::StarEqual => Some(OpCode::Mul),
        TokenKind::SlashEqual => Some(OpCode::Div),
        TokenKind::PercentEqual => Some(OpCode::Mod),
        TokenKind::CaretEqual => Some(OpCode::Bxor),
        TokenKind::PipeEqual => Some(OpCode::Bor),
        TokenKind::AmpersandEqual => Some(OpCode::Band),
        _ => None,
    }
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    pub(crate) fn compile_expression(&mut self) {
        self.compile_expression_precedence(Precedence::Comma);
    }

    pub(crate) fn compile_expression_precedence(&mut self, precedence: Precedence) {
        self.parser.advance();

        let prefix = match rule_for(self.parser.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.parser.error_at_previous("Expected expression");
                return;
            }
        };

        let allow_assignment = precedence <= Precedence::Assignment;
        self.clear_lval();
        self.run_prefix(prefix, allow_assignment);

        while precedence <= rule_for(self.parser.current.kind).precedence {
            self.parser.advance();

            if let Some(infix) = rule_for(self.parser.previous.kind).infix {
                self.run_infix(infix, allow_assignment);
            }
        }

        if allow_assignment && self.parser.check(TokenKind::Equal) {
            self.parser.error_at_previous("Invalid assignment target");
        }
    }

    fn run_prefix(&mut self, prefix: Prefix, allow_assignment: bool) {
        match prefix {
            Prefix::Grouping => self.compile_grouping_or_lambda(),
            Prefix::ArrayLiteral => self.compile_array_literal(),
            Prefix::ObjectLiteral => self.compile_object_literal(),
            Prefix::Unary => self.compile_unary(),
            Prefix::Increment => self.compile_prefix_incdec(OpCode::Inc),
            Prefix::Decrement => self.compile_prefix_incdec(OpCode::Dec),
            Prefix::CloneOf => self.compile_clone(),
            Prefix::Identifier => self.compile_identifier(allow_assignment),
            Prefix::StringLit => self.compile_string(),
            Prefix::ByteLit => self.compile_byte(),
            Prefix::IntLit => self.compile_int(),
            Prefix::FloatLit => self.compile_float(),
            Prefix::Literal => self.compile_literal(),
        }
    }

    fn run_infix(&mut self, infix: Infix, allow_assignment: bool) {
        match infix {
            Infix::Call => self.compile_call(),
            Infix::Index => self.compile_index(allow_assignment),
            Infix::Dot => self.compile_dot(allow_assignment),
            Infix::Binary => self.compile_binary(),
            Infix::And => self.compile_and(),
            Infix::Or => self.compile_or(),
            Infix::Ternary => self.compile_ternary(),
            Infix::Comma => self.compile_comma(),
        }
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    fn compile_int(&mut self) {
        if !self.register_reserve() {
            return;
        }

        match parse_int(self.parser.previous.text) {
            Some(num) => self.emit_constant(Value::Int(num)),
            None => self
                .parser
                .error_at_previous("Number is too large for type 'int'"),
        }
    }

    fn compile_byte(&mut self) {
        if !self.register_reserve() {
            return;
        }

        match parse_byte(self.parser.previous.text) {
            Some(num) => self.emit_constant(Value::Byte(num)),
            None => self
                .parser
                .error_at_previous("Number is too large for type 'byte'"),
        }
    }

    fn compile_float(&mut self) {
        if !self.register_reserve() {
            return;
        }

        match parse_float(self.parser.previous.text) {
            Some(num) => self.emit_constant(Value::Float(num)),
            None => self
                .parser
                .error_at_previous("Number is too small or too large for type 'float'"),
        }
    }

    fn compile_string(&mut self) {
        if !self.register_reserve() {
            return;
        }

        let token = self.parser.previous;
        let raw = &token.text.as_bytes()[1..token.text.len() - 1];

        let mut bytes = Vec::with_capacity(raw.len());
        let mut i = 0;

        while i < raw.len() {
            if raw[i] == b'\\' && i + 1 < raw.len() {
                let escaped = match raw[i + 1] {
                    b'a' => Some(0x07),
                    b'b' => Some(0x08),
                    b'f' => Some(0x0C),
                    b'n' => Some(b'\n'),
                    b'r' => Some(b'\r'),
                    b't' => Some(b'\t'),
                    b'v' => Some(0x0B),
                    b'\\' => Some(b'\\'),
                    b'\'' => Some(b'\''),
                    b'"' => Some(b'"'),
                    _ => None,
                };

                match escaped {
                    Some(byte) => bytes.push(byte),
                    None => {
                        self.parser
                            .handler
                            .warning("Invalid escape sequence", token.index + 1 + i as u32);
                    }
                }

                i += 2;
            } else {
                bytes.push(raw[i]);
                i += 1;
            }
        }

        let handle = self.ctx.intern(&bytes);
        self.emit_constant(Value::Dense(handle));
    }

    fn compile_literal(&mut self) {
        if !self.register_reserve() {
            return;
        }

        let op = match self.parser.previous.kind {
            TokenKind::Null => OpCode::Null,
            TokenKind::True => OpCode::True,
            TokenKind::False => OpCode::False,
            _ => return,
        };

        let reg = self.top_reg();
        self.emit(op, reg, 0, 0);
    }

    // ------------------------------------------------------------------
    // Names and assignment
    // ------------------------------------------------------------------

    fn compile_identifier(&mut self, allow_assignment: bool) {
        let resolution = self.resolve_name(self.parser.previous.text);

        if allow_assignment && self.parser.matches(TokenKind::Equal) {
            self.compile_expression();

            let src = self.top_reg();
            self.emit_resolved_store(resolution, src);
            self.clear_lval();
            return;
        }

        if allow_assignment {
            if let Some(op) = compound_op(self.parser.current.kind) {
                self.parser.advance();

                if !self.register_reserve() {
                    return;
                }
                let reg = self.top_reg();
                self.emit_resolved_load(resolution, reg);

                self.compile_expression_precedence(Precedence::Assignment);

                self.register_free();
                let reg = self.top_reg();
                self.emit(op, reg, reg, reg + 1);

                self.emit_resolved_store(resolution, reg);
                self.clear_lval();
                return;
            }
        }

        // Postfix increment/decrement binds directly to the name.
        if let Some(op) = postfix_op(self.parser.current.kind) {
            self.parser.advance();

            if !self.register_reserve() {
                return;
            }
            let old = self.top_reg();
            self.emit_resolved_load(resolution, old);

            if !self.register_reserve() {
                return;
            }
            let tmp = self.top_reg();
            self.emit(OpCode::Mov, tmp, old, 0);
            self.emit(op, tmp, 0, 0);
            self.emit_resolved_store(resolution, tmp);
            self.register_free();

            self.clear_lval();
            return;
        }

        if !self.register_reserve() {
            return;
        }
        let reg = self.top_reg();
        self.emit_resolved_load(resolution, reg);

        let lval = match resolution {
            Resolution::Local(local) => Lval::Local { reg: local },
            Resolution::Upvalue(index) => Lval::Upvalue { index },
            Resolution::Global(constant) => {
                let name = self.global_operand(constant);
                Lval::Global { name }
            }
        };
        self.set_lval(lval);
    }

    fn emit_resolved_load(&mut self, resolution: Resolution, dst: u8) {
        match resolution {
            Resolution::Local(reg) => self.emit(OpCode::Mov, dst, reg, 0),
            Resolution::Upvalue(index) => self.emit(OpCode::Gupval, dst, index, 0),
            Resolution::Global(constant) => {
                let name = self.global_operand(constant);
                self.emit(OpCode::Gglob, dst, name, 0);
            }
        }
    }

    fn emit_resolved_store(&mut self, resolution: Resolution, src: u8) {
        match resolution {
            Resolution::Local(reg) => self.emit(OpCode::Mov, reg, src, 0),
            Resolution::Upvalue(index) => self.emit(OpCode::Supval, index, src, 0),
            Resolution::Global(constant) => {
                let name = self.global_operand(constant);
                self.emit(OpCode::Sglob, name, src, 0);
            }
        }
    }

    // ------------------------------------------------------------------
    // Grouping and lambdas
    // ------------------------------------------------------------------

    /// `(` opens either a parenthesized expression or a lambda's parameter
    /// list. Try the grouping parse; when `=>` follows the closing
    /// parenthesis, rewind and compile a lambda instead.
    fn compile_grouping_or_lambda(&mut self) {
        let snapshot = self.parser.snapshot();
        let bytecode_len = self.state().cluster.size();
        let constants_len = self.state().cluster.constants.len();
        let reg_index = self.state().reg_index;

        if !self.parser.check(TokenKind::RightParen) {
            self.compile_expression();
            self.parser
                .consume(TokenKind::RightParen, "Expected ')' after expression");

            if self.parser.check(TokenKind::EqualGreater) {
                self.rewind(snapshot, bytecode_len, constants_len, reg_index);
                self.compile_lambda();
            }
        } else {
            self.parser.advance();

            if self.parser.check(TokenKind::EqualGreater) {
                self.rewind(snapshot, bytecode_len, constants_len, reg_index);
                self.compile_lambda();
            } else {
                self.parser
                    .error_at_previous("Unexpected empty parentheses group");
            }
        }
    }

    fn rewind(
        &mut self,
        snapshot: crate::parser::ParserSnapshot<'src>,
        bytecode_len: usize,
        constants_len: usize,
        reg_index: u8,
    ) {
        self.parser.restore(snapshot);

        let state = self.state();
        state.cluster.bytecode.truncate(bytecode_len);
        state.cluster.indices.truncate(bytecode_len);
        state.cluster.constants.truncate(constants_len);
        state.reg_index = reg_index;
        state.last_lval = None;
    }

    // ------------------------------------------------------------------
    // Container literals
    // ------------------------------------------------------------------

    fn compile_array_literal(&mut self) {
        if !self.register_reserve() {
            return;
        }
        let array = self.top_reg();
        self.emit(OpCode::Arr, array, 0, 0);

        if !self.parser.check(TokenKind::RightBracket) {
            loop {
                self.compile_expression_precedence(Precedence::Assignment);

                let element = self.top_reg();
                self.emit(OpCode::Parr, array, element, 0);
                self.register_free();

                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(TokenKind::RightBracket, "Expected ']' after array elements");
        self.clear_lval();
    }

    fn compile_object_literal(&mut self) {
        if !self.register_reserve() {
            return;
        }
        let object = self.top_reg();
        self.emit(OpCode::Obj, object, 0, 0);

        if !self.parser.check(TokenKind::RightBrace) {
            loop {
                let constant = if self.parser.matches(TokenKind::Identifier) {
                    self.create_identifier_constant()
                } else if self.parser.matches(TokenKind::String) {
                    let text = self.parser.previous.text;
                    let content = &text.as_bytes()[1..text.len() - 1];
                    self.create_string_constant(content)
                } else {
                    self.parser.error_at_current("Expected property name");
                    break;
                };

                let key = self.prop_key_operand(constant);

                self.parser
                    .consume(TokenKind::Colon, "Expected ':' after property name");

                self.compile_expression_precedence(Precedence::Assignment);

                let value = self.top_reg();
                self.emit_set(object, key, value);
                self.register_free();

                if let PropKey::Reg(_) = key {
                    self.register_free();
                }

                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(TokenKind::RightBrace, "Expected '}' after object entries");
        self.clear_lval();
    }

    /// Encodes a property-name constant as an operand: inline when it fits
    /// a byte, otherwise materialized into a register.
    fn prop_key_operand(&mut self, constant: u16) -> PropKey {
        if constant <= u8::MAX as u16 {
            return PropKey::Const(constant as u8);
        }

        if !self.register_reserve() {
            return PropKey::Const(0);
        }

        let reg = self.top_reg();
        let word = constant.to_le_bytes();
        self.emit(OpCode::Cnstw, reg, word[0], word[1]);

        PropKey::Reg(reg)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn compile_unary(&mut self) {
        let operator = self.parser.previous.kind;

        self.compile_expression_precedence(Precedence::Unary);

        let op = match operator {
            TokenKind::Bang => OpCode::Not,
            TokenKind::Tilde => OpCode::Bnot,
            TokenKind::Minus => OpCode::Neg,
            _ => return,
        };

        let reg = self.top_reg();
        self.emit(op, reg, reg, 0);
        self.clear_lval();
    }

    fn compile_clone(&mut self) {
        self.compile_expression_precedence(Precedence::Unary);

        let reg = self.top_reg();
        self.emit(OpCode::Clone, reg, reg, 0);
        self.clear_lval();
    }

    /// Prefix `++`/`--`: compile the operand, bump it in place, store it
    /// back. The operand must have resolved to an assignable place.
    fn compile_prefix_incdec(&mut self, op: OpCode) {
        let outer = self.prefix_incdec;
        self.prefix_incdec = true;
        self.compile_expression_precedence(Precedence::Unary);
        self.prefix_incdec = outer;

        match self.take_lval() {
            Some(Lval::Property { origin, key }) => {
                let value = self.top_reg();
                self.emit(op, value, 0, 0);
                self.emit_set(origin, key, value);

                self.emit(OpCode::Mov, origin, value, 0);
                self.register_free();
                if let PropKey::Reg(_) = key {
                    self.register_free();
                }
            }
            Some(lval) => {
                let value = self.top_reg();
                self.emit(op, value, 0, 0);
                self.emit_store(lval, value);
            }
            None => self.parser.error_at_previous("Invalid assignment target"),
        }
    }

    fn compile_binary(&mut self) {
        let operator = self.parser.previous.kind;
        let precedence = rule_for(operator).precedence;

        self.compile_expression_precedence(precedence.next());

        let op = match operator {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Sub,
            TokenKind::Star => OpCode::Mul,
            TokenKind::Slash => OpCode::Div,
            TokenKind::Percent => OpCode::Mod,
            TokenKind::LessLess => OpCode::Shl,
            TokenKind::GreaterGreater => OpCode::Shr,
            TokenKind::Greater => OpCode::Gt,
            TokenKind::GreaterEqual => OpCode::Gte,
            TokenKind::Less => OpCode::Lt,
            TokenKind::LessEqual => OpCode::Lte,
            TokenKind::EqualEqual => OpCode::Eq,
            TokenKind::BangEqual => OpCode::Neq,
            TokenKind::Ampersand => OpCode::Band,
            TokenKind::Caret => OpCode::Bxor,
            TokenKind::Pipe => OpCode::Bor,
            _ => return,
        };

        self.register_free();
        let reg = self.top_reg();
        self.emit(op, reg, reg, reg + 1);
        self.clear_lval();
    }

    /// `&&`: if the left side fails the truth test, skip over the right.
    fn compile_and(&mut self) {
        let reg = self.top_reg();
        self.emit(OpCode::Test, reg, 0, 0);
        self.register_free();

        let end = self.emit_blank();

        self.compile_expression_precedence(Precedence::And);

        self.patch_jump(end);
        self.clear_lval();
    }

    /// `||`: if the left side passes the truth test, skip over the right.
    fn compile_or(&mut self) {
        let reg = self.top_reg();
        self.emit(OpCode::Ntest, reg, 0, 0);
        self.register_free();

        let end = self.emit_blank();

        self.compile_expression_precedence(Precedence::Or);

        self.patch_jump(end);
        self.clear_lval();
    }

    /// `cond ? a : b` — both arms land in the register the condition
    /// occupied, so the result register is branch-independent.
    fn compile_ternary(&mut self) {
        let reg = self.top_reg();
        self.emit(OpCode::Test, reg, 0, 0);
        self.register_free();

        let first = self.emit_blank();

        self.compile_expression();

        self.parser.consume(
            TokenKind::Colon,
            "Expected ':' after ternary operator expression",
        );

        self.register_free();

        let second = self.emit_blank();
        self.patch_jump(first);

        self.compile_expression();

        self.patch_jump(second);
        self.clear_lval();
    }

    fn compile_comma(&mut self) {
        self.register_free();
        self.compile_expression_precedence(Precedence::Comma);
    }

    // ------------------------------------------------------------------
    // Calls and property access
    // ------------------------------------------------------------------

    fn compile_call(&mut self) {
        let function_reg = self.top_reg();
        let argc = self.compile_arguments();

        self.emit(OpCode::Call, function_reg, argc, 0);

        for _ in 0..argc {
            self.register_free();
        }

        self.clear_lval();
    }

    fn compile_arguments(&mut self) -> u8 {
        let mut argc: u16 = 0;

        if !self.parser.check(TokenKind::RightParen) {
            loop {
                self.compile_expression_precedence(Precedence::Assignment);

                if argc == 255 {
                    self.parser
                        .error_at_previous("Argument limit exceeded (255)");
                } else {
                    argc += 1;
                }

                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(TokenKind::RightParen, "Expected ')' after arguments");

        argc as u8
    }

    fn compile_index(&mut self, allow_assignment: bool) {
        let origin = self.top_reg();

        self.compile_expression();
        self.parser
            .consume(TokenKind::RightBracket, "Expected ']' after index");

        let key = PropKey::Reg(self.top_reg());
        self.compile_property_tail(origin, key, allow_assignment);
    }

    fn compile_dot(&mut self, allow_assignment: bool) {
        let origin = self.top_reg();

        self.parser
            .consume(TokenKind::Identifier, "Expected property name after '.'");
        let constant = self.create_identifier_constant();
        let key = self.prop_key_operand(constant);

        self.compile_property_tail(origin, key, allow_assignment);
    }

    /// Common tail of `a[i]` and `o.k`: plain read, assignment, compound
    /// assignment, or postfix `++`/`--`. Reads collapse back into the
    /// origin register so the expression nets exactly one register.
    fn compile_property_tail(&mut self, origin: u8, key: PropKey, allow_assignment: bool) {
        if allow_assignment && self.parser.matches(TokenKind::Equal) {
            self.compile_expression();

            let value = self.top_reg();
            self.emit_set(origin, key, value);

            self.emit(OpCode::Mov, origin, value, 0);
            self.register_free();
            if let PropKey::Reg(_) = key {
                self.register_free();
            }

            self.clear_lval();
            return;
        }

        if allow_assignment {
            if let Some(op) = compound_op(self.parser.current.kind) {
                self.parser.advance();

                if !self.register_reserve() {
                    return;
                }
                let current = self.top_reg();
                self.emit_get(current, origin, key);

                self.compile_expression_precedence(Precedence::Assignment);

                self.register_free();
                let reg = self.top_reg();
                self.emit(op, reg, reg, reg + 1);

                self.emit_set(origin, key, reg);

                self.emit(OpCode::Mov, origin, reg, 0);
                self.register_free();
                if let PropKey::Reg(_) = key {
                    self.register_free();
                }

                self.clear_lval();
                return;
            }
        }

        if let Some(op) = postfix_op(self.parser.current.kind) {
            self.parser.advance();

            if !self.register_reserve() {
                return;
            }
            let old = self.top_reg();
            self.emit_get(old, origin, key);

            if !self.register_reserve() {
                return;
            }
            let tmp = self.top_reg();
            self.emit(OpCode::Mov, tmp, old, 0);
            self.emit(op, tmp, 0, 0);
            self.emit_set(origin, key, tmp);
            self.register_free();

            self.emit(OpCode::Mov, origin, old, 0);
            self.register_free();
            if let PropKey::Reg(_) = key {
                self.register_free();
            }

            self.clear_lval();
            return;
        }

        if self.prefix_incdec {
            // Keep origin and key alive; the prefix handler stores back.
            if !self.register_reserve() {
                return;
            }
            let value = self.top_reg();
            self.emit_get(value, origin, key);
            self.set_lval(Lval::Property { origin, key });
            return;
        }

        self.emit_get(origin, origin, key);
        if let PropKey::Reg(_) = key {
            self.register_free();
        }
        self.clear_lval();
    }
}

fn postfix_op(kind: TokenKind) -> Option<OpCode> {
    match kind {
        TokenKind::PlusPlus => Some(OpCode::Inc),
        TokenKind::MinusMinus => Some(OpCode::Dec),
        _ => None,
    }
}
