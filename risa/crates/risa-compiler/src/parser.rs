//! Parser scaffold: token window, error reporting, panic-mode recovery.

use risa_lex::{Lexer, Token, TokenKind};
use risa_util::Handler;

/// Two-token window over the lexer plus the diagnostic state.
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    pub current: Token<'src>,
    pub previous: Token<'src>,
    /// Set while recovering from a syntax error; suppresses cascades.
    pub panic: bool,
    pub handler: Handler,
}

/// Enough state to rewind the parser, for the grouping/lambda lookahead.
pub struct ParserSnapshot<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    panic: bool,
    diagnostics: usize,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            text: "",
            index: 0,
        };

        let mut parser = Self {
            lexer: Lexer::new(source),
            current: placeholder,
            previous: placeholder,
            panic: false,
            handler: Handler::new(),
        };

        parser.advance();
        parser
    }

    pub fn source(&self) -> &'src str {
        self.lexer.source()
    }

    /// Moves the window forward, reporting and skipping error tokens.
    pub fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.lexer.next_token();

            if self.current.kind != TokenKind::Error {
                break;
            }

            let message = self.current.text;
            self.error_at_current(message);
        }
    }

    pub fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    /// Leaves panic mode and skips forward to the next statement boundary:
    /// right past a semicolon, or right before a statement keyword.
    pub fn sync(&mut self) {
        self.panic = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }

            match self.current.kind {
                TokenKind::Function
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    pub fn error_at(&mut self, token: Token<'_>, message: &str) {
        if self.panic {
            return;
        }
        self.panic = true;

        if token.kind == TokenKind::Eof {
            self.handler.error_at_eof(message);
        } else {
            self.handler.error(message, token.index);
        }
    }

    pub fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    pub fn error_at_previous(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    pub fn snapshot(&self) -> ParserSnapshot<'src> {
        ParserSnapshot {
            lexer: self.lexer.clone(),
            current: self.current,
            previous: self.previous,
            panic: self.panic,
            diagnostics: self.handler.diagnostics().len(),
        }
    }

    /// Rewinds to a snapshot, dropping diagnostics raised since.
    pub fn restore(&mut self, snapshot: ParserSnapshot<'src>) {
        self.lexer = snapshot.lexer;
        self.current = snapshot.current;
        self.previous = snapshot.previous;
        self.panic = snapshot.panic;
        self.handler.truncate(snapshot.diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_window() {
        let mut parser = Parser::new("var x;");
        assert_eq!(parser.current.kind, TokenKind::Var);

        parser.advance();
        assert_eq!(parser.previous.kind, TokenKind::Var);
        assert_eq!(parser.current.kind, TokenKind::Identifier);
    }

    #[test]
    fn test_error_tokens_are_reported_and_skipped() {
        let mut parser = Parser::new("@ var");
        // The '@' error token is consumed during construction.
        assert_eq!(parser.current.kind, TokenKind::Var);
        assert!(parser.handler.has_errors());
        assert!(parser.panic);
    }

    #[test]
    fn test_panic_suppresses_cascades() {
        let mut parser = Parser::new("x");
        parser.error_at_current("first");
        parser.error_at_current("second");
        assert_eq!(parser.handler.diagnostics().len(), 1);
    }

    #[test]
    fn test_sync_stops_after_semicolon() {
        let mut parser = Parser::new("1 2 3 ; var y;");
        parser.error_at_current("boom");
        parser.sync();

        assert!(!parser.panic);
        assert_eq!(parser.previous.kind, TokenKind::Semicolon);
        assert_eq!(parser.current.kind, TokenKind::Var);
    }

    #[test]
    fn test_sync_stops_at_keyword() {
        let mut parser = Parser::new("1 2 if (x) {}");
        parser.error_at_current("boom");
        parser.sync();

        assert_eq!(parser.current.kind, TokenKind::If);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut parser = Parser::new("(a, b) => a");
        let snapshot = parser.snapshot();

        parser.advance();
        parser.advance();
        parser.error_at_current("speculative");

        parser.restore(snapshot);
        assert_eq!(parser.current.kind, TokenKind::LeftParen);
        assert!(!parser.handler.has_errors());
    }
}
