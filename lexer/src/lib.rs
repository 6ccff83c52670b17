pub mod token;

use std::rc::Rc;
use token::{keyword_kind, Token, TokenKind};

/// Scans a source buffer into tokens on demand. Mirrors the `scanToken`
/// contract clox hands its compiler: one token per call, `Error` tokens
/// carry a message instead of a lexeme, `Eof` never ends the stream early.
pub struct Lexer {
    source: Rc<str>,
    chars: Vec<char>,
    start: usize,
    current: usize,
    line: u32,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: Rc::from(source),
            chars: source.chars().collect(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        self.chars.get(self.current).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.chars.get(self.current + 1).copied().unwrap_or('\0')
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.at_end() || self.chars[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Rc::clone(&self.source),
            self.byte_start(),
            self.byte_len(),
            self.line,
        )
    }

    fn error(&self, message: &'static str) -> Token {
        Token::new(TokenKind::Error, Rc::from(message), 0, message.len(), self.line)
    }

    /// Byte offset corresponding to `self.start`'s char index, since
    /// `Token::lexeme` slices the shared `str` by byte range.
    fn byte_start(&self) -> usize {
        self.chars[..self.start].iter().map(|c| c.len_utf8()).sum()
    }

    fn byte_len(&self) -> usize {
        self.chars[self.start..self.current]
            .iter()
            .map(|c| c.len_utf8())
            .sum()
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token {
        while self.peek() != '"' && !self.at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.at_end() {
            return self.error("Unterminated string.");
        }
        self.advance();
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        let kind = keyword_kind(&lexeme).unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;
        if self.at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();
        if c.is_ascii_digit() {
            return self.number();
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return self.identifier();
        }

        use TokenKind::*;
        match c {
            '(' => self.make(LeftParen),
            ')' => self.make(RightParen),
            '{' => self.make(LeftBrace),
            '}' => self.make(RightBrace),
            '[' => self.make(LeftBracket),
            ']' => self.make(RightBracket),
            ';' => self.make(Semicolon),
            ',' => self.make(Comma),
            '.' => self.make(Dot),
            '-' => self.make(Minus),
            '+' => self.make(Plus),
            '/' => self.make(Slash),
            '*' => self.make(Star),
            '!' => {
                let kind = if self.matches('=') { BangEqual } else { Bang };
                self.make(kind)
            }
            '=' => {
                let kind = if self.matches('=') { EqualEqual } else { Equal };
                self.make(kind)
            }
            '<' => {
                let kind = if self.matches('=') { LessEqual } else { Less };
                self.make(kind)
            }
            '>' => {
                let kind = if self.matches('=') {
                    GreaterEqual
                } else {
                    Greater
                };
                self.make(kind)
            }
            '"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

/// Collects the whole token stream, for tooling (golden-listing tests,
/// `--dump-tokens`) that wants it eagerly rather than pulled by the
/// compiler one token at a time.
pub fn lex_all(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = vec![];
    loop {
        let token = lexer.next_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use token::TokenKind::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex_all(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_punctuation_and_operators() {
        assert_eq!(
            kinds("(){}[],.-+;/* ! != = == < <= > >="),
            vec![
                LeftParen, RightParen, LeftBrace, RightBrace, LeftBracket, RightBracket, Comma,
                Dot, Minus, Plus, Semicolon, Slash, Star, Bang, BangEqual, Equal, EqualEqual,
                Less, LessEqual, Greater, GreaterEqual, Eof
            ]
        );
    }

    #[test]
    fn scans_keywords_vs_identifiers() {
        assert_eq!(
            kinds("var x = this.super_thing"),
            vec![Var, Identifier, Equal, This, Dot, Identifier, Eof]
        );
    }

    #[test]
    fn tracks_line_numbers_across_newlines_and_comments() {
        let tokens = lex_all("var a = 1;\n// comment\nvar b = 2;");
        let lines: Vec<u32> = tokens.iter().map(|t| t.line).collect();
        assert_eq!(lines[0], 1);
        let b_idx = tokens.iter().position(|t| t.lexeme() == "b").unwrap();
        assert_eq!(tokens[b_idx].line, 3);
    }

    #[test]
    fn reports_unterminated_string() {
        let tokens = lex_all("\"never closes");
        assert_eq!(tokens[0].kind, Error);
        assert_eq!(tokens[0].error_message(), "Unterminated string.");
    }

    #[test]
    fn scans_number_literals_with_fraction() {
        let tokens = lex_all("3.14 42");
        assert_eq!(tokens[0].kind, Number);
        assert_eq!(tokens[0].lexeme(), "3.14");
        assert_eq!(tokens[1].lexeme(), "42");
    }
}
