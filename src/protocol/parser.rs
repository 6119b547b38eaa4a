//! Recursive-descent parser: protocol-file text -> [`Ast`].
//!
//! Parsing happens in two passes, mirroring how `StreamCore.cc`'s
//! `parseProtocol` resolves named-block substitution before it ever builds
//! an expression tree for a body: pass one (`split_blocks`) only needs
//! enough structure to find each top-level block's raw source text (so
//! [`crate::protocol::compiler::substitute_args`] can run `$N` replacement
//! over literal text, including inside quoted strings); pass two
//! (`parse_block_body`) fully parses one block's (substituted) body into
//! [`BlockItem`]s.

use super::lexer::{Lexer, Spanned, Token};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum AstValue {
    Number(i64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Assign {
    pub name: String,
    pub value: AstValue,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum CommandSyntax {
    In(Vec<u8>),
    Out(Vec<u8>),
    Wait(u32),
    Event { mask: u32, timeout_ms: u32 },
    Exec(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Handler {
    pub kind_name: String,
    pub body: Vec<BlockItem>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum BlockItem {
    Assign(Assign),
    Command(CommandSyntax),
    Handler(Handler),
}

/// A named top-level block with its raw (pre-substitution) body text, as
/// found by [`split_blocks`].
pub struct RawBlock {
    pub name: String,
    pub line: u32,
    pub raw_body: String,
}

/// Splits a protocol file into top-level assignments and named blocks,
/// without parsing block bodies (that happens only after `$N` substitution,
/// since substitution must see the body's raw text).
pub fn split_blocks(path: &str, source: &str) -> Result<(Vec<Assign>, Vec<RawBlock>)> {
    let tokens = Lexer::new(path, source).tokenize()?;
    let mut assigns = Vec::new();
    let mut blocks = Vec::new();
    let mut i = 0usize;
    while !matches!(tokens[i].tok, Token::Eof) {
        let name = expect_ident(path, &tokens, i)?;
        let line = tokens[i].line;
        match &tokens[i + 1].tok {
            Token::Eq => {
                let (value, next) = parse_value(path, &tokens, i + 2)?;
                expect(path, &tokens, next, &Token::Semi)?;
                assigns.push(Assign { name, value, line });
                i = next + 1;
            }
            Token::LBrace => {
                let body_start = tokens[i + 2].start;
                let (end_idx, body_end_byte) = find_matching_brace(path, &tokens, i + 2)?;
                let raw_body = source[body_start..body_end_byte].to_string();
                blocks.push(RawBlock { name, line, raw_body });
                i = end_idx + 1;
            }
            other => {
                return Err(Error::Parse {
                    path: path.to_string(),
                    line,
                    msg: format!("expected '=' or '{{' after '{name}', got {other:?}"),
                })
            }
        }
    }
    Ok((assigns, blocks))
}

/// Parses one block's (already `$N`-substituted) body text into
/// [`BlockItem`]s.
pub fn parse_block_body(path: &str, source: &str) -> Result<Vec<BlockItem>> {
    let tokens = Lexer::new(path, source).tokenize()?;
    let mut items = Vec::new();
    let mut i = 0usize;
    while !matches!(tokens[i].tok, Token::Eof) {
        let (item, next) = parse_block_item(path, source, &tokens, i)?;
        items.push(item);
        i = next;
    }
    Ok(items)
}

fn parse_block_item(
    path: &str,
    source: &str,
    tokens: &[Spanned],
    i: usize,
) -> Result<(BlockItem, usize)> {
    match &tokens[i].tok {
        Token::At => {
            let kind_name = expect_ident(path, tokens, i + 1)?;
            let line = tokens[i].line;
            expect(path, tokens, i + 2, &Token::LBrace)?;
            let body_start = tokens[i + 3].start;
            let (end_idx, body_end_byte) = find_matching_brace(path, tokens, i + 3)?;
            let raw_body = &source[body_start..body_end_byte];
            let body = parse_block_body(path, raw_body)?;
            Ok((
                BlockItem::Handler(Handler { kind_name, body, line }),
                end_idx + 1,
            ))
        }
        Token::Ident(name) if name == "in" || name == "out" || name == "exec" => {
            let name = name.clone();
            let (Token::Str(bytes), next) = (tokens[i + 1].tok.clone(), i + 2) else {
                return Err(perr(path, tokens[i].line, format!("'{name}' expects a string")));
            };
            expect(path, tokens, next, &Token::Semi)?;
            let cmd = match name.as_str() {
                "in" => CommandSyntax::In(bytes),
                "out" => CommandSyntax::Out(bytes),
                "exec" => CommandSyntax::Exec(bytes),
                _ => unreachable!(),
            };
            Ok((BlockItem::Command(cmd), next + 1))
        }
        Token::Ident(name) if name == "wait" => {
            let ms = expect_number(path, tokens, i + 1)?;
            expect(path, tokens, i + 2, &Token::Semi)?;
            Ok((BlockItem::Command(CommandSyntax::Wait(ms as u32)), i + 3))
        }
        Token::Ident(name) if name == "event" => {
            expect(path, tokens, i + 1, &Token::LParen)?;
            let mask = expect_number(path, tokens, i + 2)?;
            expect(path, tokens, i + 3, &Token::RParen)?;
            let timeout_ms = expect_number(path, tokens, i + 4)?;
            expect(path, tokens, i + 5, &Token::Semi)?;
            Ok((
                BlockItem::Command(CommandSyntax::Event { mask: mask as u32, timeout_ms: timeout_ms as u32 }),
                i + 6,
            ))
        }
        Token::Ident(name) => {
            let name = name.clone();
            let line = tokens[i].line;
            expect(path, tokens, i + 1, &Token::Eq)?;
            let (value, next) = parse_value(path, tokens, i + 2)?;
            expect(path, tokens, next, &Token::Semi)?;
            Ok((BlockItem::Assign(Assign { name, value, line }), next + 1))
        }
        other => Err(perr(path, tokens[i].line, format!("unexpected token in block body: {other:?}"))),
    }
}

fn parse_value(path: &str, tokens: &[Spanned], i: usize) -> Result<(AstValue, usize)> {
    match &tokens[i].tok {
        Token::Number(n) => Ok((AstValue::Number(*n), i + 1)),
        Token::Str(s) => Ok((AstValue::Str(s.clone()), i + 1)),
        other => Err(perr(path, tokens[i].line, format!("expected a value, got {other:?}"))),
    }
}

fn expect_ident(path: &str, tokens: &[Spanned], i: usize) -> Result<String> {
    match &tokens[i].tok {
        Token::Ident(s) => Ok(s.clone()),
        other => Err(perr(path, tokens[i].line, format!("expected identifier, got {other:?}"))),
    }
}

fn expect_number(path: &str, tokens: &[Spanned], i: usize) -> Result<i64> {
    match &tokens[i].tok {
        Token::Number(n) => Ok(*n),
        other => Err(perr(path, tokens[i].line, format!("expected number, got {other:?}"))),
    }
}

fn expect(path: &str, tokens: &[Spanned], i: usize, want: &Token) -> Result<()> {
    if &tokens[i].tok == want {
        Ok(())
    } else {
        Err(perr(
            path,
            tokens[i].line,
            format!("expected {want:?}, got {:?}", tokens[i].tok),
        ))
    }
}

fn perr(path: &str, line: u32, msg: String) -> Error {
    Error::Parse { path: path.to_string(), line, msg }
}

/// Given the index of the token right after an `LBrace`, scans forward
/// (tracking brace depth, since strings/comments were already consumed by
/// the lexer as atomic tokens) to find the matching `RBrace`. Returns its
/// token index and the byte offset of its start (the body's end, exclusive).
fn find_matching_brace(path: &str, tokens: &[Spanned], start: usize) -> Result<(usize, usize)> {
    let mut depth = 1i32;
    let mut i = start;
    loop {
        match &tokens[i].tok {
            Token::LBrace => depth += 1,
            Token::RBrace => {
                depth -= 1;
                if depth == 0 {
                    return Ok((i, tokens[i].start));
                }
            }
            Token::Eof => {
                return Err(Error::Parse {
                    path: path.to_string(),
                    line: tokens[i].line,
                    msg: "unbalanced braces".into(),
                })
            }
            _ => {}
        }
        i += 1;
    }
}
