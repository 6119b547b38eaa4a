//! Tokenizer for the protocol-file grammar (spec.md §6.1).

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(i64),
    Str(Vec<u8>),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semi,
    Eq,
    At,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub tok: Token,
    pub line: u32,
    /// Byte offsets into the original source, used to recover raw text
    /// spans for block bodies ahead of `$N` substitution (spec.md §6.1).
    pub start: usize,
    pub end: usize,
}

pub struct Lexer<'a> {
    path: String,
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(path: impl Into<String>, src: &'a str) -> Self {
        Self {
            path: path.into(),
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::Parse {
            path: self.path.clone(),
            line: self.line,
            msg: msg.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let start = self.pos;
            let Some(b) = self.peek() else {
                out.push(Spanned { tok: Token::Eof, line, start, end: start });
                break;
            };
            let tok = match b {
                b'{' => {
                    self.bump();
                    Token::LBrace
                }
                b'}' => {
                    self.bump();
                    Token::RBrace
                }
                b'(' => {
                    self.bump();
                    Token::LParen
                }
                b')' => {
                    self.bump();
                    Token::RParen
                }
                b',' => {
                    self.bump();
                    Token::Comma
                }
                b';' => {
                    self.bump();
                    Token::Semi
                }
                b'=' => {
                    self.bump();
                    Token::Eq
                }
                b'@' => {
                    self.bump();
                    Token::At
                }
                b'"' => self.lex_string()?,
                b'0'..=b'9' => self.lex_number()?,
                b'-' if self.src.get(self.pos + 1).is_some_and(u8::is_ascii_digit) => {
                    self.lex_number()?
                }
                b if b.is_ascii_alphabetic() || b == b'_' => self.lex_ident(),
                other => {
                    return Err(self.err(format!(
                        "unexpected character: {:?}",
                        other as char
                    )))
                }
            };
            out.push(Spanned { tok, line, start, end: self.pos });
        }
        Ok(out)
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        Token::Ident(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        if self.peek() == Some(b'0') && matches!(self.src.get(self.pos + 1), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            let digit_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[digit_start..self.pos]).unwrap();
            let v = i64::from_str_radix(text, 16)
                .map_err(|e| self.err(format!("bad hex literal: {e}")))?;
            return Ok(Token::Number(v));
        }
        if self.peek() == Some(b'0') && self.src.get(self.pos + 1).is_some_and(u8::is_ascii_digit) {
            self.bump();
            let digit_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[digit_start..self.pos]).unwrap();
            let v = i64::from_str_radix(text, 8)
                .map_err(|e| self.err(format!("bad octal literal: {e}")))?;
            return Ok(Token::Number(v));
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let v: i64 = text
            .parse()
            .map_err(|e| self.err(format!("bad numeric literal: {e}")))?;
        Ok(Token::Number(v))
    }

    fn lex_string(&mut self) -> Result<Token> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| self.err("unterminated escape"))?;
                    match esc {
                        b'n' => bytes.push(b'\n'),
                        b'r' => bytes.push(b'\r'),
                        b't' => bytes.push(b'\t'),
                        b'"' => bytes.push(b'"'),
                        b'\\' => bytes.push(b'\\'),
                        b'x' => {
                            let hi = self.bump().ok_or_else(|| self.err("truncated \\x escape"))?;
                            let lo = self.bump().ok_or_else(|| self.err("truncated \\x escape"))?;
                            let text = [hi, lo];
                            let text = std::str::from_utf8(&text)
                                .map_err(|_| self.err("invalid \\x escape"))?;
                            let v = u8::from_str_radix(text, 16)
                                .map_err(|_| self.err("invalid \\x escape"))?;
                            bytes.push(v);
                        }
                        b'0'..=b'9' => {
                            let mut digits = vec![esc];
                            for _ in 0..2 {
                                if self.peek().is_some_and(|b| b.is_ascii_digit()) {
                                    digits.push(self.bump().unwrap());
                                }
                            }
                            let text = String::from_utf8(digits).unwrap();
                            let v = u32::from_str_radix(&text, 8)
                                .map_err(|_| self.err("invalid \\0NN escape"))?;
                            bytes.push(v as u8);
                        }
                        other => {
                            return Err(self.err(format!("unknown escape: \\{}", other as char)))
                        }
                    }
                }
                Some(b) => bytes.push(b),
            }
        }
        Ok(Token::Str(bytes))
    }
}
