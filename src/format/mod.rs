//! (B) Format descriptors and the converter registry.
//!
//! Mirrors `StreamFormat` (`examples/original_source/StreamDevice-2.0/src/StreamFormat.h`):
//! an immutable per-field descriptor plus a registry of converters keyed by
//! a single character, each converting between text on the wire and one of
//! a small set of value shapes.

pub mod converters;

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;

bitflags! {
    /// printf-style field flags (spec.md §3 `StreamFormat`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatFlags: u8 {
        const LEFT  = 0x01;
        const SIGN  = 0x02;
        const SPACE = 0x04;
        const ALT   = 0x08;
        const ZERO  = 0x10;
        const SKIP  = 0x20;
    }
}

/// The semantic shape of a conversion's value (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FormatKind {
    Signed,
    Unsigned,
    Enum,
    Double,
    String,
    Pseudo,
}

/// Tagged union of values moving through the converter layer (spec.md §9:
/// "values move through a small tagged union").
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Signed(v) => Ok(*v),
            Value::Unsigned(v) => Ok(*v as i64),
            Value::Double(v) => Ok(*v as i64),
            Value::Bytes(_) => Err(Error::Format("expected integer value, got bytes".into())),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::Signed(v) => Ok(*v as u64),
            Value::Unsigned(v) => Ok(*v),
            Value::Double(v) => Ok(*v as u64),
            Value::Bytes(_) => Err(Error::Format("expected integer value, got bytes".into())),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Signed(v) => Ok(*v as f64),
            Value::Unsigned(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Bytes(_) => Err(Error::Format("expected double value, got bytes".into())),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::Format("expected string value, got number".into())),
        }
    }
}

/// Immutable compiled field descriptor (spec.md §3 `StreamFormat`).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFormat {
    pub conv: char,
    pub kind: FormatKind,
    pub flags: FormatFlags,
    pub width: u16,
    /// Signed so "no precision given" can be distinguished (`-1`) from `.0`.
    pub prec: i16,
    /// Opaque converter-specific payload: the set body of `%[...]`, the
    /// branch list of `%{a|b|c}`, etc.
    pub info: Vec<u8>,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%")?;
        if self.flags.contains(FormatFlags::LEFT) {
            write!(f, "-")?;
        }
        if self.width > 0 {
            write!(f, "{}", self.width)?;
        }
        if self.prec >= 0 {
            write!(f, ".{}", self.prec)?;
        }
        write!(f, "{}", self.conv)
    }
}

/// A single-character conversion: converts between text and one value
/// shape, honoring width/precision/flags (spec.md §4.B).
pub trait Converter: Send + Sync {
    /// Writes `value` into `sink` per `format`. Errors on a value/flag
    /// combination the converter cannot express (e.g. printing a
    /// skip-flagged field).
    fn print(&self, format: &StreamFormat, sink: &mut crate::buffer::Buffer, value: &Value) -> Result<()>;

    /// Scans a value out of `source` (starting at byte 0 of the slice)
    /// per `format`. Returns the number of bytes consumed from `source` on
    /// success. A mismatch is reported via `Err`, not a negative return —
    /// `consumed` in spec.md's text is the `Ok` arm of this `Result`.
    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize>;
}

/// Registry of converters keyed by conversion character (spec.md §4.B).
pub struct ConverterRegistry {
    converters: HashMap<char, Box<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registry pre-populated with every built-in conversion spec.md §4.B
    /// requires: `d i o u x X f e E g G c s [ b r D { T`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        converters::register_builtins(&mut reg);
        reg
    }

    /// Registers (or overrides) the converter for `conv`, supporting
    /// "any user-defined letter" per spec.md §4.B.
    pub fn register(&mut self, conv: char, converter: Box<dyn Converter>) {
        self.converters.insert(conv, converter);
    }

    pub fn get(&self, conv: char) -> Option<&dyn Converter> {
        self.converters.get(&conv).map(|b| b.as_ref())
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
