//! Main lexer implementation.
//!
//! The lexer walks the source as raw bytes (Risa strings are byte
//! sequences) and hands out one token per call to [`Lexer::next_token`].
//! Whitespace and comments are consumed between tokens; malformed input
//! produces [`TokenKind::Error`] tokens that the parser reports and skips.

use crate::token::{keyword_from_identifier, Token, TokenKind};

/// Lexer over a single source string.
///
/// Cloning captures the position, which is how the compiler backtracks when
/// disambiguating groupings from lambdas.
#[derive(Clone)]
pub struct Lexer<'src> {
    source: &'src str,
    /// Start of the token currently being scanned.
    start: usize,
    /// Current scan position.
    current: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    fn peek(&self, offset: usize) -> u8 {
        *self
            .source
            .as_bytes()
            .get(self.current + offset)
            .unwrap_or(&0)
    }

    fn at_end(&self, offset: usize) -> bool {
        self.current + offset >= self.source.len()
    }

    fn advance(&mut self, amount: usize) {
        self.current += amount;
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end(0) || self.peek(0) != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    fn emit(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            text: &self.source[self.start..self.current],
            index: self.start as u32,
        }
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            text: message,
            index: self.current as u32,
        }
    }

    /// Returns the next token, consuming leading whitespace and comments.
    pub fn next_token(&mut self) -> Token<'src> {
        loop {
            match self.peek(0) {
                b' ' | b'\t' | b'\r' | b'\n' => self.advance(1),
                b'/' if self.peek(1) == b'/' => {
                    self.advance(2);
                    while !self.at_end(0) && self.peek(0) != b'\n' {
                        self.advance(1);
                    }
                }
                b'/' if self.peek(1) == b'*' => {
                    self.advance(2);
                    while !self.at_end(0) {
                        if self.peek(0) == b'*' && self.peek(1) == b'/' {
                            break;
                        }
                        self.advance(1);
                    }

                    if self.at_end(0) {
                        return self.error("Expected end of comment block");
                    }

                    self.advance(2);
                }
                _ => break,
            }

            if self.at_end(0) {
                break;
            }
        }

        self.start = self.current;

        if self.at_end(0) {
            return self.emit(TokenKind::Eof);
        }

        let c = self.peek(0);
        self.advance(1);

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.next_identifier();
        }
        if c.is_ascii_digit() {
            return self.next_number();
        }

        match c {
            b'(' => self.emit(TokenKind::LeftParen),
            b')' => self.emit(TokenKind::RightParen),
            b'[' => self.emit(TokenKind::LeftBracket),
            b']' => self.emit(TokenKind::RightBracket),
            b'{' => self.emit(TokenKind::LeftBrace),
            b'}' => self.emit(TokenKind::RightBrace),
            b':' => self.emit(TokenKind::Colon),
            b';' => self.emit(TokenKind::Semicolon),
            b',' => self.emit(TokenKind::Comma),
            b'.' => self.emit(TokenKind::Dot),
            b'~' => self.emit(TokenKind::Tilde),
            b'?' => self.emit(TokenKind::Question),
            b'$' => self.emit(TokenKind::Dollar),
            b'-' => {
                let kind = if self.matches(b'-') {
                    TokenKind::MinusMinus
                } else if self.matches(b'=') {
                    TokenKind::MinusEqual
                } else {
                    TokenKind::Minus
                };
                self.emit(kind)
            }
            b'+' => {
                let kind = if self.matches(b'+') {
                    TokenKind::PlusPlus
                } else if self.matches(b'=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                };
                self.emit(kind)
            }
            b'/' => {
                let kind = if self.matches(b'=') {
                    TokenKind::SlashEqual
                } else {
                    TokenKind::Slash
                };
                self.emit(kind)
            }
            b'*' => {
                let kind = if self.matches(b'=') {
                    TokenKind::StarEqual
                } else {
                    TokenKind::Star
                };
                self.emit(kind)
            }
            b'^' => {
                let kind = if self.matches(b'=') {
                    TokenKind::CaretEqual
                } else {
                    TokenKind::Caret
                };
                self.emit(kind)
            }
            b'%' => {
                let kind = if self.matches(b'=') {
                    TokenKind::PercentEqual
                } else {
                    TokenKind::Percent
                };
                self.emit(kind)
            }
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.emit(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else if self.matches(b'>') {
                    TokenKind::EqualGreater
                } else {
                    TokenKind::Equal
                };
                self.emit(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') {
                    TokenKind::LessEqual
                } else if self.matches(b'<') {
                    TokenKind::LessLess
                } else {
                    TokenKind::Less
                };
                self.emit(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else if self.matches(b'>') {
                    TokenKind::GreaterGreater
                } else {
                    TokenKind::Greater
                };
                self.emit(kind)
            }
            b'&' => {
                let kind = if self.matches(b'&') {
                    TokenKind::AmpersandAmpersand
                } else if self.matches(b'=') {
                    TokenKind::AmpersandEqual
                } else {
                    TokenKind::Ampersand
                };
                self.emit(kind)
            }
            b'|' => {
                let kind = if self.matches(b'|') {
                    TokenKind::PipePipe
                } else if self.matches(b'=') {
                    TokenKind::PipeEqual
                } else {
                    TokenKind::Pipe
                };
                self.emit(kind)
            }
            b'"' => self.next_string(),
            _ => self.error("Unexpected character"),
        }
    }

    fn next_identifier(&mut self) -> Token<'src> {
        while !self.at_end(0) && (self.peek(0).is_ascii_alphanumeric() || self.peek(0) == b'_') {
            self.advance(1);
        }

        let text = &self.source[self.start..self.current];

        match keyword_from_identifier(text) {
            Some(keyword) => self.emit(keyword),
            None => self.emit(TokenKind::Identifier),
        }
    }

    /// Scans an int, byte or float literal.
    ///
    /// The `b` and `f` suffixes are consumed but excluded from the lexeme,
    /// so the compiler can parse the digits directly.
    fn next_number(&mut self) -> Token<'src> {
        let mut kind = TokenKind::Int;

        while !self.at_end(0) && self.peek(0).is_ascii_digit() {
            self.advance(1);
        }

        let mut suffix = 0;

        match self.peek(0) {
            b'.' => {
                kind = TokenKind::Float;

                if self.peek(1).is_ascii_digit() {
                    self.advance(1);

                    while !self.at_end(0) && self.peek(0).is_ascii_digit() {
                        self.advance(1);
                    }

                    if self.peek(0) == b'f' {
                        suffix = 1;
                    }
                } else {
                    return self.error("Expected digit after dot");
                }
            }
            b'b' => {
                kind = TokenKind::Byte;
                suffix = 1;
            }
            b'f' => {
                kind = TokenKind::Float;
                suffix = 1;
            }
            _ => (),
        }

        let token = self.emit(kind);
        self.advance(suffix);

        token
    }

    fn next_string(&mut self) -> Token<'src> {
        while !self.at_end(0) {
            if self.peek(0) == b'"' {
                // Lookbehind on the raw byte handles \" inside the literal.
                if self.source.as_bytes()[self.current - 1] != b'\\' {
                    break;
                }
            } else if self.peek(0) == b'\n' {
                return self.error("Expected end of string");
            }

            self.advance(1);
        }

        if self.at_end(0) {
            return self.error("Expected end of string");
        }

        self.advance(1);
        self.emit(TokenKind::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper that collects every token kind up to (excluding) EOF.
    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            kinds.push(token.kind);
        }
        kinds
    }

    fn first_token(source: &str) -> Token<'_> {
        Lexer::new(source).next_token()
    }

    // ========================================================================
    // LITERALS
    // ========================================================================

    #[test]
    fn test_int_literal() {
        let token = first_token("1234");
        assert_eq!(token.kind, TokenKind::Int);
        assert_eq!(token.text, "1234");
    }

    #[test]
    fn test_byte_literal_excludes_suffix() {
        let token = first_token("42b");
        assert_eq!(token.kind, TokenKind::Byte);
        assert_eq!(token.text, "42");
    }

    #[test]
    fn test_float_literals() {
        let token = first_token("3.14");
        assert_eq!(token.kind, TokenKind::Float);
        assert_eq!(token.text, "3.14");

        let token = first_token("3f");
        assert_eq!(token.kind, TokenKind::Float);
        assert_eq!(token.text, "3");

        let token = first_token("2.5f");
        assert_eq!(token.kind, TokenKind::Float);
        assert_eq!(token.text, "2.5");
    }

    #[test]
    fn test_dot_without_digit_is_error() {
        let token = first_token("3.x");
        assert_eq!(token.kind, TokenKind::Error);
    }

    #[test]
    fn test_suffix_does_not_glue_tokens() {
        assert_eq!(
            lex_kinds("42b + 1"),
            vec![TokenKind::Byte, TokenKind::Plus, TokenKind::Int]
        );
    }

    #[test]
    fn test_string_literal_keeps_quotes() {
        let token = first_token("\"hello\"");
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.text, "\"hello\"");
    }

    #[test]
    fn test_string_with_escaped_quote() {
        let token = first_token(r#""a\"b""#);
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.text, r#""a\"b""#);
    }

    #[test]
    fn test_unterminated_string() {
        assert_eq!(first_token("\"abc").kind, TokenKind::Error);
        assert_eq!(first_token("\"ab\nc\"").kind, TokenKind::Error);
    }

    // ========================================================================
    // OPERATORS
    // ========================================================================

    #[test]
    fn test_compound_operators() {
        assert_eq!(first_token("++").kind, TokenKind::PlusPlus);
        assert_eq!(first_token("--").kind, TokenKind::MinusMinus);
        assert_eq!(first_token("+=").kind, TokenKind::PlusEqual);
        assert_eq!(first_token("-=").kind, TokenKind::MinusEqual);
        assert_eq!(first_token("*=").kind, TokenKind::StarEqual);
        assert_eq!(first_token("/=").kind, TokenKind::SlashEqual);
        assert_eq!(first_token("^=").kind, TokenKind::CaretEqual);
        assert_eq!(first_token("%=").kind, TokenKind::PercentEqual);
        assert_eq!(first_token("|=").kind, TokenKind::PipeEqual);
        assert_eq!(first_token("&=").kind, TokenKind::AmpersandEqual);
        assert_eq!(first_token("=>").kind, TokenKind::EqualGreater);
        assert_eq!(first_token("&&").kind, TokenKind::AmpersandAmpersand);
        assert_eq!(first_token("||").kind, TokenKind::PipePipe);
        assert_eq!(first_token("<<").kind, TokenKind::LessLess);
        assert_eq!(first_token(">>").kind, TokenKind::GreaterGreater);
        assert_eq!(first_token("<=").kind, TokenKind::LessEqual);
        assert_eq!(first_token(">=").kind, TokenKind::GreaterEqual);
        assert_eq!(first_token("==").kind, TokenKind::EqualEqual);
        assert_eq!(first_token("!=").kind, TokenKind::BangEqual);
    }

    #[test]
    fn test_single_operators() {
        assert_eq!(
            lex_kinds("( ) [ ] { } , . ; : ? $ + - * / % ^ ~ & | < > = !"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Question,
                TokenKind::Dollar,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Caret,
                TokenKind::Tilde,
                TokenKind::Ampersand,
                TokenKind::Pipe,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::Equal,
                TokenKind::Bang,
            ]
        );
    }

    // ========================================================================
    // COMMENTS AND WHITESPACE
    // ========================================================================

    #[test]
    fn test_line_comment() {
        assert_eq!(lex_kinds("// comment\nvar"), vec![TokenKind::Var]);
    }

    #[test]
    fn test_block_comment() {
        assert_eq!(lex_kinds("/* one\ntwo */ if"), vec![TokenKind::If]);
    }

    #[test]
    fn test_unterminated_block_comment() {
        assert_eq!(first_token("/* never closed").kind, TokenKind::Error);
    }

    #[test]
    fn test_comment_only_source() {
        assert_eq!(lex_kinds("// nothing here"), vec![]);
    }

    // ========================================================================
    // OFFSETS
    // ========================================================================

    #[test]
    fn test_token_indices() {
        let mut lexer = Lexer::new("var x = 10;");

        assert_eq!(lexer.next_token().index, 0); // var
        assert_eq!(lexer.next_token().index, 4); // x
        assert_eq!(lexer.next_token().index, 6); // =
        assert_eq!(lexer.next_token().index, 8); // 10
        assert_eq!(lexer.next_token().index, 10); // ;
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut lexer = Lexer::new("");
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    // ========================================================================
    // PROPERTIES
    // ========================================================================

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The lexer terminates and every token stays inside the source.
            #[test]
            fn lexing_never_panics(source in "\\PC{0,160}") {
                let mut lexer = Lexer::new(&source);

                for _ in 0..1024 {
                    let token = lexer.next_token();

                    if token.kind == TokenKind::Eof {
                        break;
                    }
                    if token.kind != TokenKind::Error {
                        let start = token.index as usize;
                        prop_assert!(start + token.text.len() <= source.len());
                    }
                }
            }

            /// Identifier-shaped inputs lex to a single token.
            #[test]
            fn identifiers_round_trip(name in "[a-zA-Z_][a-zA-Z0-9_]{0,24}") {
                let mut lexer = Lexer::new(&name);
                let token = lexer.next_token();

                if keyword_from_identifier(&name).is_none() {
                    prop_assert_eq!(token.kind, TokenKind::Identifier);
                    prop_assert_eq!(token.text, name.as_str());
                }
                prop_assert_eq!(lexer.next_token().kind, TokenKind::Eof);
            }
        }
    }
}
