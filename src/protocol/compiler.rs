//! Ast -> [`CompiledProtocol`] byte-code compiler (spec.md §4.C).
//!
//! Two passes, matching `StreamCore.cc`'s `parseProtocol`: (1) split the
//! file into top-level assignments and named raw blocks, (2) for the block
//! actually being compiled, resolve `Name(a,b,c)` substitution textually
//! over the *raw* block source before re-lexing and walking it into
//! opcodes. Substitution must run before lexing since `$1` can appear
//! inside a quoted string or a bare number.

use super::opcode;
use super::parser::{self, AstValue, BlockItem, CommandSyntax, RawBlock};
use super::{CompiledProtocol, HandlerKind};
use crate::config::{ExtraInput, ProtocolVars};
use crate::error::{Error, Result};
use crate::format::{FormatFlags, FormatKind, StreamFormat};
use std::collections::HashMap;

/// Compiles `source` (the text of one protocol file) down to the named
/// block `entry`, resolving any `Name(a,b,c)` invocations it makes.
pub fn compile(path: &str, source: &str, entry: &str) -> Result<CompiledProtocol> {
    let (_assigns, blocks) = parser::split_blocks(path, source)?;
    let by_name: HashMap<&str, &RawBlock> = blocks.iter().map(|b| (b.name.as_str(), b)).collect();

    let (name, args) = split_call(entry);
    let raw = by_name
        .get(name.as_str())
        .ok_or_else(|| Error::UnknownBlock(name.clone()))?;

    let substituted = substitute_args(&raw.raw_body, &args);
    let items = parser::parse_block_body(path, &substituted)?;

    let mut vars = ProtocolVars::default();
    let mut main = Vec::new();
    let mut handlers = HashMap::new();

    for item in items {
        match item {
            BlockItem::Assign(assign) => apply_var(&mut vars, &assign.name, &assign.value, path, assign.line)?,
            BlockItem::Command(cmd) => encode_command(&mut main, &cmd),
            BlockItem::Handler(h) => {
                let kind = HandlerKind::from_name(&h.kind_name).ok_or_else(|| Error::Parse {
                    path: path.to_string(),
                    line: h.line,
                    msg: format!("unknown handler: @{}", h.kind_name),
                })?;
                let mut body = Vec::new();
                for sub in h.body {
                    match sub {
                        BlockItem::Assign(assign) => {
                            apply_var(&mut vars, &assign.name, &assign.value, path, assign.line)?
                        }
                        BlockItem::Command(cmd) => encode_command(&mut body, &cmd),
                        BlockItem::Handler(nested) => {
                            return Err(Error::Parse {
                                path: path.to_string(),
                                line: nested.line,
                                msg: "handlers cannot nest".into(),
                            })
                        }
                    }
                }
                body.push(opcode::END);
                handlers.insert(kind, body);
            }
        }
    }
    main.push(opcode::END);
    vars.finalize();

    Ok(CompiledProtocol {
        name: name.clone(),
        main,
        handlers,
        vars,
    })
}

/// Splits `"Name(a,b,c)"` or a bare `"Name"` into the block name and its
/// (possibly empty) textual argument list.
fn split_call(entry: &str) -> (String, Vec<String>) {
    let entry = entry.trim();
    let Some(open) = entry.find('(') else {
        return (entry.to_string(), Vec::new());
    };
    let Some(close) = entry.rfind(')') else {
        return (entry.to_string(), Vec::new());
    };
    let name = entry[..open].trim().to_string();
    let body = &entry[open + 1..close];
    (name, split_args(body))
}

/// Splits a `Name(...)` argument list on top-level commas, tracking paren
/// depth so an argument containing `,` or `)` inside nested parens is not
/// mistaken for a separator (spec.md §4.C's bracket-depth-aware
/// substitution, per `StreamCore.cc`'s argument scanner).
fn split_args(body: &str) -> Vec<String> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let bytes = body.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b',' if depth == 0 => {
                args.push(body[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(body[start..].trim().to_string());
    args
}

/// Replaces `$1`..`$9` in `body` with the corresponding (already
/// comma-split) argument text, bracket-depth aware so a `$1` that itself
/// expands to something containing `)`/`,` cannot shift later argument
/// boundaries (spec.md §4.C "Named blocks may be invoked as...").
pub fn substitute_args(body: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            let n = (bytes[i + 1] - b'0') as usize;
            if n >= 1 && n <= args.len() {
                out.push_str(&args[n - 1]);
            }
            i += 2;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn apply_var(vars: &mut ProtocolVars, name: &str, value: &AstValue, path: &str, line: u32) -> Result<()> {
    let as_num = || match value {
        AstValue::Number(n) => Ok(*n as u32),
        AstValue::Str(_) => Err(Error::Parse {
            path: path.to_string(),
            line,
            msg: format!("'{name}' expects a number"),
        }),
    };
    let as_bytes = || match value {
        AstValue::Str(s) => Ok(s.clone()),
        AstValue::Number(_) => Err(Error::Parse {
            path: path.to_string(),
            line,
            msg: format!("'{name}' expects a string"),
        }),
    };
    match name {
        "locktimeout" => vars.lock_timeout = as_num()?,
        "writetimeout" => vars.write_timeout = as_num()?,
        "replytimeout" => vars.reply_timeout = as_num()?,
        "readtimeout" => vars.read_timeout = as_num()?,
        "pollperiod" => vars.poll_period = Some(as_num()?),
        "maxinput" => vars.max_input = as_num()? as usize,
        "terminator" => {
            let t = as_bytes()?;
            vars.in_terminator = t.clone();
            vars.out_terminator = t;
        }
        "interminator" => vars.in_terminator = as_bytes()?,
        "outterminator" => vars.out_terminator = as_bytes()?,
        "separator" => vars.separator = as_bytes()?,
        "extrainput" => {
            let s = as_bytes()?;
            vars.extra_input = match s.as_slice() {
                b"error" => ExtraInput::Error,
                b"ignore" => ExtraInput::Ignore,
                _ => {
                    return Err(Error::Parse {
                        path: path.to_string(),
                        line,
                        msg: format!("bad extrainput value: {:?}", String::from_utf8_lossy(&s)),
                    })
                }
            }
        }
        other => {
            return Err(Error::Parse {
                path: path.to_string(),
                line,
                msg: format!("unknown variable: {other}"),
            })
        }
    }
    Ok(())
}

fn encode_command(out: &mut Vec<u8>, cmd: &CommandSyntax) {
    match cmd {
        CommandSyntax::In(s) => {
            out.push(opcode::IN);
            encode_pattern(out, s);
        }
        CommandSyntax::Out(s) => {
            out.push(opcode::OUT);
            encode_pattern(out, s);
        }
        CommandSyntax::Exec(s) => {
            out.push(opcode::EXEC);
            encode_pattern(out, s);
        }
        CommandSyntax::Wait(ms) => {
            out.push(opcode::WAIT);
            out.extend_from_slice(&ms.to_le_bytes());
        }
        CommandSyntax::Event { mask, timeout_ms } => {
            out.push(opcode::EVENT);
            out.extend_from_slice(&mask.to_le_bytes());
            out.extend_from_slice(&timeout_ms.to_le_bytes());
        }
    }
}

/// Encodes an `in`/`out`/`exec` string body into opcodes: `%`-format
/// specifiers become `FORMAT`/`FORMAT_FIELD` tokens, `SKIP` (`$`, the
/// match-any-one wildcard) becomes [`opcode::SKIP`], and any other byte
/// is a literal, escaped if it collides with an opcode value.
fn encode_pattern(out: &mut Vec<u8>, text: &[u8]) {
    let mut i = 0usize;
    while i < text.len() {
        match text[i] {
            b'$' if text.get(i + 1) != Some(&b'$') => {
                out.push(opcode::SKIP);
                i += 1;
            }
            b'$' => {
                opcode::push_escaped_literal(out, &text[i..i + 1]);
                i += 2;
            }
            b'%' if text.get(i + 1) == Some(&b'%') => {
                opcode::push_escaped_literal(out, b"%");
                i += 2;
            }
            b'%' => {
                let (token, consumed) = encode_format(&text[i..]);
                out.extend_from_slice(&token);
                i += consumed;
            }
            b => {
                opcode::push_escaped_literal(out, &[b]);
                i += 1;
            }
        }
    }
    out.push(opcode::EOS);
}

/// Parses one `%[flags][width][.prec]conv` (or `%{a|b|c}` / `%[set]`)
/// specifier starting at `spec[0] == '%'` and encodes it as a `FORMAT`
/// token. Returns the encoded bytes and the number of source bytes
/// consumed.
fn encode_format(spec: &[u8]) -> (Vec<u8>, usize) {
    let fmt_start = 0usize;
    let mut i = 1usize; // skip '%'
    let mut flags = FormatFlags::empty();
    loop {
        match spec.get(i) {
            Some(b'-') => {
                flags |= FormatFlags::LEFT;
                i += 1;
            }
            Some(b'+') => {
                flags |= FormatFlags::SIGN;
                i += 1;
            }
            Some(b' ') => {
                flags |= FormatFlags::SPACE;
                i += 1;
            }
            Some(b'#') => {
                flags |= FormatFlags::ALT;
                i += 1;
            }
            Some(b'0') => {
                flags |= FormatFlags::ZERO;
                i += 1;
            }
            Some(b'*') => {
                flags |= FormatFlags::SKIP;
                i += 1;
            }
            _ => break,
        }
    }
    let width_start = i;
    while spec.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let width: u16 = std::str::from_utf8(&spec[width_start..i]).unwrap_or("0").parse().unwrap_or(0);

    let mut prec: i16 = -1;
    if spec.get(i) == Some(&b'.') {
        i += 1;
        let prec_start = i;
        while spec.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        prec = std::str::from_utf8(&spec[prec_start..i]).unwrap_or("0").parse().unwrap_or(0);
    }

    let (conv, kind, info, consumed_extra) = match spec.get(i) {
        Some(b'{') => {
            let end = spec[i..].iter().position(|&b| b == b'}').map(|p| i + p).unwrap_or(spec.len());
            let info = spec[i + 1..end].to_vec();
            ('{', FormatKind::Enum, info, end + 1 - i)
        }
        Some(b'[') => {
            let end = spec[i..].iter().position(|&b| b == b']').map(|p| i + p).unwrap_or(spec.len());
            let info = spec[i + 1..end].to_vec();
            ('[', FormatKind::String, info, end + 1 - i)
        }
        Some(&c) => (c as char, kind_of(c as char), Vec::new(), 1),
        None => ('s', FormatKind::String, Vec::new(), 0),
    };
    i += consumed_extra;

    // Optional explicit field binding, `%conv(path)` (spec.md §4.C
    // `FORMAT_FIELD`): a path naming a record field other than the
    // session's own channel. Without it, the conversion still binds to a
    // field (the session's own channel, resolved at the bridge by
    // `DEFAULT_FIELD_PATH`) so plain `%d` conversions feed their scanned/
    // printed value to the record instead of being dropped.
    let field_path = if spec.get(i) == Some(&b'(') {
        let end = spec[i..].iter().position(|&b| b == b')').map(|p| i + p);
        match end {
            Some(end) => {
                let path = String::from_utf8_lossy(&spec[i + 1..end]).into_owned();
                i = end + 1;
                path
            }
            None => {
                i = spec.len();
                crate::protocol::DEFAULT_FIELD_PATH.to_string()
            }
        }
    } else {
        crate::protocol::DEFAULT_FIELD_PATH.to_string()
    };

    let format = StreamFormat { conv, kind, flags, width, prec, info };
    let fmt_cstr = &spec[fmt_start..i];

    let mut token = vec![opcode::FORMAT_FIELD];
    opcode::push_escaped_literal(&mut token, fmt_cstr);
    token.push(opcode::EOS);
    token.push(format.conv as u8);
    token.push(match format.kind {
        FormatKind::Signed => 0,
        FormatKind::Unsigned => 1,
        FormatKind::Enum => 2,
        FormatKind::Double => 3,
        FormatKind::String => 4,
        FormatKind::Pseudo => 5,
    });
    token.push(format.flags.bits());
    token.extend_from_slice(&format.width.to_le_bytes());
    token.extend_from_slice(&format.prec.to_le_bytes());
    token.extend_from_slice(&(format.info.len() as u16).to_le_bytes());
    token.extend_from_slice(&format.info);
    token.extend_from_slice(field_path.as_bytes());
    token.push(0); // nul terminator
    token.extend_from_slice(&0u16.to_le_bytes()); // address blob, resolved lazily at bind time

    (token, i)
}

fn kind_of(conv: char) -> FormatKind {
    match conv {
        'd' | 'i' | 'r' | 'D' | 'b' => FormatKind::Signed,
        'u' | 'o' | 'x' | 'X' => FormatKind::Unsigned,
        'f' | 'e' | 'E' | 'g' | 'G' => FormatKind::Double,
        's' | 'c' => FormatKind::String,
        'T' => FormatKind::Pseudo,
        _ => FormatKind::String,
    }
}
