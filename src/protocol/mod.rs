//! (C) Protocol parser/compiler.
//!
//! Turns protocol-file text (spec.md §6.1) into a [`CompiledProtocol`]:
//! a byte-code main body plus up to five handler bodies, and the resolved
//! [`crate::config::ProtocolVars`] table.

pub mod compiler;
pub mod lexer;
pub mod opcode;
pub mod parser;

use crate::config::ProtocolVars;
use crate::format::StreamFormat;
use std::collections::HashMap;

/// Field path a bare `%conv` conversion (no explicit `(path)`) resolves
/// to: "the record's own channel" of spec.md §4.C's `FORMAT_FIELD`
/// description, as opposed to a named field elsewhere. A [`RecordBridge`]
/// sees this path like any other; it is not special-cased anywhere but
/// the compiler that emits it.
///
/// [`RecordBridge`]: crate::bridge::RecordBridge
pub const DEFAULT_FIELD_PATH: &str = "VAL";

/// Which `@handler` sub-block a body belongs to (spec.md §3, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum HandlerKind {
    Init,
    WriteTimeout,
    ReplyTimeout,
    ReadTimeout,
    Mismatch,
}

impl HandlerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "init" => Some(Self::Init),
            "writetimeout" => Some(Self::WriteTimeout),
            "replytimeout" => Some(Self::ReplyTimeout),
            "readtimeout" => Some(Self::ReadTimeout),
            "mismatch" => Some(Self::Mismatch),
            _ => None,
        }
    }
}

/// An immutable, compiled protocol: a byte-stream main body, optional
/// handler bodies, and the resolved variable table (spec.md §3
/// "Compiled protocol").
#[derive(Debug, Clone)]
pub struct CompiledProtocol {
    pub name: String,
    pub main: Vec<u8>,
    pub handlers: HashMap<HandlerKind, Vec<u8>>,
    pub vars: ProtocolVars,
}

impl CompiledProtocol {
    pub fn handler(&self, kind: HandlerKind) -> Option<&[u8]> {
        self.handlers.get(&kind).map(|v| v.as_slice())
    }
}

/// One decoded step out of a command byte-code stream, as produced by
/// [`Program::decode_commands`].
#[derive(Debug, Clone)]
pub enum CommandStep {
    In(Vec<PatternToken>),
    Out(Vec<PatternToken>),
    Wait(u32),
    Event { mask: u32, timeout_ms: u32 },
    Exec(Vec<PatternToken>),
    End,
}

/// One token inside an `in`/`out` template (spec.md §4.C encoding table).
#[derive(Debug, Clone)]
pub enum PatternToken {
    Literal(u8),
    /// Matches any single byte on input; elided (consumes nothing, emits
    /// nothing) on output, per spec.md §4.D separator semantics note.
    Skip,
    Format {
        format: StreamFormat,
        field: Option<FormatField>,
    },
}

/// A `FORMAT_FIELD` token's extra payload: a field path plus an opaque
/// address blob supplied by the record bridge (spec.md §4.C, §4.F).
#[derive(Debug, Clone)]
pub struct FormatField {
    pub path: String,
    pub address: Vec<u8>,
}

/// Decodes a compiled command stream into a flat list of [`CommandStep`]s,
/// the representation [`crate::session::Session`] walks.
pub fn decode_commands(bytes: &[u8]) -> crate::error::Result<Vec<CommandStep>> {
    use crate::error::Error;
    let mut steps = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let op = bytes[i];
        i += 1;
        match op {
            opcode::END => {
                steps.push(CommandStep::End);
                break;
            }
            opcode::IN => {
                let (tokens, consumed) = decode_pattern(&bytes[i..])?;
                i += consumed;
                steps.push(CommandStep::In(tokens));
            }
            opcode::OUT => {
                let (tokens, consumed) = decode_pattern(&bytes[i..])?;
                i += consumed;
                steps.push(CommandStep::Out(tokens));
            }
            opcode::EXEC => {
                let (tokens, consumed) = decode_pattern(&bytes[i..])?;
                i += consumed;
                steps.push(CommandStep::Exec(tokens));
            }
            opcode::WAIT => {
                if i + 4 > bytes.len() {
                    return Err(Error::Format("truncated WAIT payload".into()));
                }
                let ms = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
                i += 4;
                steps.push(CommandStep::Wait(ms));
            }
            opcode::EVENT => {
                if i + 8 > bytes.len() {
                    return Err(Error::Format("truncated EVENT payload".into()));
                }
                let mask = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
                let ms = u32::from_le_bytes(bytes[i + 4..i + 8].try_into().unwrap());
                i += 8;
                steps.push(CommandStep::Event { mask, timeout_ms: ms });
            }
            other => return Err(Error::Format(format!("unknown opcode: {other}"))),
        }
    }
    Ok(steps)
}

/// Decodes one `in`/`out`/`exec` payload (a string of [`PatternToken`]s
/// terminated by [`opcode::EOS`]) starting at `bytes[0]`. Returns the
/// tokens and the number of bytes consumed, including the terminator.
fn decode_pattern(bytes: &[u8]) -> crate::error::Result<(Vec<PatternToken>, usize)> {
    use crate::error::Error;
    let mut tokens = Vec::new();
    let mut i = 0usize;
    loop {
        if i >= bytes.len() {
            return Err(Error::Format("unterminated pattern".into()));
        }
        let b = bytes[i];
        i += 1;
        match b {
            opcode::EOS => return Ok((tokens, i)),
            opcode::ESC => {
                if i >= bytes.len() {
                    return Err(Error::Format("dangling ESC at end of pattern".into()));
                }
                tokens.push(PatternToken::Literal(bytes[i]));
                i += 1;
            }
            opcode::SKIP => tokens.push(PatternToken::Skip),
            opcode::FORMAT | opcode::FORMAT_FIELD => {
                let is_field = b == opcode::FORMAT_FIELD;
                let (format, field, consumed) = decode_format(&bytes[i..], is_field)?;
                i += consumed;
                tokens.push(PatternToken::Format { format, field });
            }
            lit => tokens.push(PatternToken::Literal(lit)),
        }
    }
}

fn decode_format(
    bytes: &[u8],
    is_field: bool,
) -> crate::error::Result<(StreamFormat, Option<FormatField>, usize)> {
    use crate::error::Error;
    use crate::format::{FormatFlags, FormatKind};

    let mut i = 0usize;
    // fmt_cstr, terminated by EOS (kept for pretty-printing/debugging).
    while bytes.get(i).copied() != Some(opcode::EOS) {
        i += 1;
        if i > bytes.len() {
            return Err(Error::Format("unterminated format fmt_cstr".into()));
        }
    }
    i += 1; // consume EOS

    let need = i + 1 + 1 + 1 + 2 + 2 + 2;
    if bytes.len() < need {
        return Err(Error::Format("truncated StreamFormat struct".into()));
    }
    let conv = bytes[i] as char;
    let kind = match bytes[i + 1] {
        0 => FormatKind::Signed,
        1 => FormatKind::Unsigned,
        2 => FormatKind::Enum,
        3 => FormatKind::Double,
        4 => FormatKind::String,
        5 => FormatKind::Pseudo,
        other => return Err(Error::Format(format!("bad format kind tag: {other}"))),
    };
    let flags = FormatFlags::from_bits_truncate(bytes[i + 2]);
    let width = u16::from_le_bytes(bytes[i + 3..i + 5].try_into().unwrap());
    let prec = i16::from_le_bytes(bytes[i + 5..i + 7].try_into().unwrap());
    let infolen = u16::from_le_bytes(bytes[i + 7..i + 9].try_into().unwrap()) as usize;
    let mut pos = i + 9;
    if bytes.len() < pos + infolen {
        return Err(Error::Format("truncated format info".into()));
    }
    let info = bytes[pos..pos + infolen].to_vec();
    pos += infolen;

    let format = StreamFormat { conv, kind, flags, width, prec, info };

    if !is_field {
        return Ok((format, None, pos));
    }

    let path_start = pos;
    while bytes.get(pos).copied() != Some(0) {
        pos += 1;
        if pos > bytes.len() {
            return Err(Error::Format("unterminated field path".into()));
        }
    }
    let path = String::from_utf8_lossy(&bytes[path_start..pos]).into_owned();
    pos += 1; // nul terminator

    if bytes.len() < pos + 2 {
        return Err(Error::Format("truncated field address length".into()));
    }
    let addrlen = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    if bytes.len() < pos + addrlen {
        return Err(Error::Format("truncated field address".into()));
    }
    let address = bytes[pos..pos + addrlen].to_vec();
    pos += addrlen;

    Ok((format, Some(FormatField { path, address }), pos))
}
