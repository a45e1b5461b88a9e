//! Lexer for match expressions
//!
//! Tokenizes a JavaScript-like expression language. The lexer accepts more
//! than the validator allows (keywords, assignment, braces) so that
//! forbidden constructs are reported by name instead of as syntax errors.

use crate::error::{CryostatError, Result};

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub col: usize,
}

/// Token types
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword
    Identifier(String),
    /// String literal, escapes resolved
    Str(String),
    /// Numeric literal
    Number(f64),
    /// Regular expression literal
    Regex {
        /// Pattern between the slashes
        pattern: String,
        /// Trailing flags
        flags: String,
    },
    /// Operator or punctuation
    Punct(&'static str),
    /// End of input
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Identifier(name) => write!(f, "{}", name),
            TokenKind::Str(s) => write!(f, "'{}'", s),
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Regex { pattern, flags } => write!(f, "/{}/{}", pattern, flags),
            TokenKind::Punct(p) => write!(f, "{}", p),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

/// Punctuators, longest first so that maximal munch works by linear scan
const PUNCTUATORS: &[&str] = &[
    ">>>=", "===", "!==", "**=", "<<=", ">>=", ">>>", "...", "=>", "==", "!=", "<=", ">=", "&&", "||", "??",
    "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "**", "<<", ">>", "?.", "(", ")", "{", "}",
    "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

/// Lexer over one expression
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    /// Create a new lexer from input text
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Tokenize the entire input
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::IllegalExpression` for unterminated literals
    /// and characters outside the language.
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens: Vec<Token> = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            if self.pos >= self.input.len() {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line: self.line,
                    col: self.col,
                });
                return Ok(tokens);
            }
            let regex_allowed = tokens.last().map_or(true, |t| regex_may_follow(&t.kind));
            let token = self.next_token(regex_allowed)?;
            tokens.push(token);
        }
    }

    fn next_token(&mut self, regex_allowed: bool) -> Result<Token> {
        let ch = self.input[self.pos];
        let line = self.line;
        let col = self.col;
        let kind = match ch {
            '"' | '\'' => self.read_string(ch)?,
            '`' => return Err(self.error("template literals are not allowed")),
            c if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) => {
                self.read_number()?
            }
            c if is_ident_start(c) => self.read_identifier(),
            '/' if regex_allowed => self.read_regex()?,
            _ => self.read_punct()?,
        };
        Ok(Token { kind, line, col })
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind> {
        let (line, col) = (self.line, self.col);
        self.advance();
        let mut text = String::new();
        loop {
            let Some(c) = self.current() else {
                return Err(positioned(line, col, "unterminated string literal"));
            };
            self.advance();
            match c {
                c if c == quote => return Ok(TokenKind::Str(text)),
                '\n' => return Err(positioned(line, col, "unterminated string literal")),
                '\\' => {
                    let Some(escaped) = self.current() else {
                        return Err(positioned(line, col, "unterminated string literal"));
                    };
                    self.advance();
                    match escaped {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '0' => text.push('\0'),
                        'u' => text.push(self.read_unicode_escape()?),
                        other => text.push(other),
                    }
                }
                other => text.push(other),
            }
        }
    }

    fn read_unicode_escape(&mut self) -> Result<char> {
        let mut hex = String::new();
        for _ in 0..4 {
            match self.current() {
                Some(c) if c.is_ascii_hexdigit() => {
                    hex.push(c);
                    self.advance();
                }
                _ => return Err(self.error("invalid unicode escape")),
            }
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("invalid unicode escape"))
    }

    fn read_number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        if self.current() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let digits_start = self.pos;
            while self.current().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let digits: String = self.input[digits_start..self.pos].iter().collect();
            return u64::from_str_radix(&digits, 16)
                .map(|n| TokenKind::Number(n as f64))
                .map_err(|_| self.error("invalid hexadecimal literal"));
        }
        while self.current().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.current() == Some('.') {
            self.advance();
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        if self.current().is_some_and(is_ident_start) {
            return Err(self.error("identifier directly after number"));
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(&format!("invalid number {}", text)))
    }

    fn read_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while self.current().is_some_and(is_ident_part) {
            self.advance();
        }
        TokenKind::Identifier(self.input[start..self.pos].iter().collect())
    }

    fn read_regex(&mut self) -> Result<TokenKind> {
        let (line, col) = (self.line, self.col);
        self.advance();
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            let Some(c) = self.current() else {
                return Err(positioned(line, col, "unterminated regular expression"));
            };
            self.advance();
            match c {
                '\n' => return Err(positioned(line, col, "unterminated regular expression")),
                '\\' => {
                    pattern.push(c);
                    let Some(escaped) = self.current() else {
                        return Err(positioned(line, col, "unterminated regular expression"));
                    };
                    pattern.push(escaped);
                    self.advance();
                }
                '[' => {
                    in_class = true;
                    pattern.push(c);
                }
                ']' => {
                    in_class = false;
                    pattern.push(c);
                }
                '/' if !in_class => break,
                other => pattern.push(other),
            }
        }
        let mut flags = String::new();
        while self.current().is_some_and(is_ident_part) {
            if let Some(c) = self.current() {
                flags.push(c);
            }
            self.advance();
        }
        Ok(TokenKind::Regex { pattern, flags })
    }

    fn read_punct(&mut self) -> Result<TokenKind> {
        for punct in PUNCTUATORS {
            let len = punct.chars().count();
            if self.pos + len <= self.input.len()
                && punct.chars().zip(&self.input[self.pos..self.pos + len]).all(|(a, b)| a == *b)
            {
                for _ in 0..len {
                    self.advance();
                }
                return Ok(TokenKind::Punct(punct));
            }
        }
        Err(self.error(&format!("unexpected character '{}'", self.input[self.pos])))
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        while let Some(c) = self.current() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '/' && self.peek_at(1) == Some('/') {
                while self.current().is_some_and(|c| c != '\n') {
                    self.advance();
                }
            } else if c == '/' && self.peek_at(1) == Some('*') {
                let (line, col) = (self.line, self.col);
                self.advance();
                self.advance();
                loop {
                    match self.current() {
                        None => return Err(positioned(line, col, "unterminated comment")),
                        Some('*') if self.peek_at(1) == Some('/') => {
                            self.advance();
                            self.advance();
                            break;
                        }
                        Some(_) => self.advance(),
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(c) = self.current() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> anyhow::Error {
        positioned(self.line, self.col, message)
    }
}

fn positioned(line: usize, col: usize, message: &str) -> anyhow::Error {
    CryostatError::IllegalExpression(format!("{} at {}:{}", message, line, col)).into()
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Whether a `/` after this token starts a regular expression rather than
/// a division
fn regex_may_follow(previous: &TokenKind) -> bool {
    match previous {
        TokenKind::Identifier(name) => matches!(
            name.as_str(),
            "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void" | "throw" | "case" | "do" | "else"
        ),
        TokenKind::Str(_) | TokenKind::Number(_) | TokenKind::Regex { .. } => false,
        TokenKind::Punct(p) => !matches!(*p, ")" | "]" | "}" | "++" | "--"),
        TokenKind::Eof => true,
    }
}

/// Tokenizes an expression
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    Lexer::new(input).tokenize()
}
