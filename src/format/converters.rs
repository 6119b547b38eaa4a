//! Built-in converters (spec.md §4.B "Required built-in behaviors").

use super::{Converter, ConverterRegistry, FormatFlags, StreamFormat, Value};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use std::fmt::Write as _;

pub fn register_builtins(reg: &mut ConverterRegistry) {
    reg.register('d', Box::new(IntConverter { radix: 10, upper: false, signed: true }));
    reg.register('i', Box::new(IntConverter { radix: 10, upper: false, signed: true }));
    reg.register('u', Box::new(IntConverter { radix: 10, upper: false, signed: false }));
    reg.register('o', Box::new(IntConverter { radix: 8, upper: false, signed: false }));
    reg.register('x', Box::new(IntConverter { radix: 16, upper: false, signed: false }));
    reg.register('X', Box::new(IntConverter { radix: 16, upper: true, signed: false }));
    reg.register('b', Box::new(IntConverter { radix: 2, upper: false, signed: false }));
    reg.register('r', Box::new(RawConverter));
    reg.register('D', Box::new(BcdConverter));
    reg.register('f', Box::new(FloatConverter { style: FloatStyle::Fixed, upper: false }));
    reg.register('e', Box::new(FloatConverter { style: FloatStyle::Exp, upper: false }));
    reg.register('E', Box::new(FloatConverter { style: FloatStyle::Exp, upper: true }));
    reg.register('g', Box::new(FloatConverter { style: FloatStyle::General, upper: false }));
    reg.register('G', Box::new(FloatConverter { style: FloatStyle::General, upper: true }));
    reg.register('s', Box::new(StringConverter));
    reg.register('c', Box::new(CharConverter));
    reg.register('[', Box::new(BracketConverter));
    reg.register('{', Box::new(EnumConverter));
    reg.register('T', Box::new(TimestampConverter));
}

fn apply_skip(format: &StreamFormat, out: &mut Option<Value>, value: Value) {
    if format.flags.contains(FormatFlags::SKIP) {
        *out = None;
    } else {
        *out = Some(value);
    }
}

fn pad_and_append(sink: &mut Buffer, format: &StreamFormat, body: &str) {
    let width = format.width as usize;
    if body.len() >= width {
        sink.append(body.as_bytes());
        return;
    }
    let pad = width - body.len();
    if format.flags.contains(FormatFlags::LEFT) {
        sink.append(body.as_bytes());
        sink.append(&vec![b' '; pad]);
    } else if format.flags.contains(FormatFlags::ZERO) && !body.starts_with(['-', '+', ' ']) {
        sink.append(&vec![b'0'; pad]);
        sink.append(body.as_bytes());
    } else if format.flags.contains(FormatFlags::ZERO) {
        // keep the sign character in front of the zero padding
        let (sign, rest) = body.split_at(1);
        sink.append(sign.as_bytes());
        sink.append(&vec![b'0'; pad]);
        sink.append(rest.as_bytes());
    } else {
        sink.append(&vec![b' '; pad]);
        sink.append(body.as_bytes());
    }
}

/// `d i o u x X b` — printf integer conversions.
struct IntConverter {
    radix: u32,
    upper: bool,
    signed: bool,
}

impl IntConverter {
    fn format_digits(&self, mag: u64, format: &StreamFormat) -> String {
        let mut digits = match self.radix {
            10 => mag.to_string(),
            8 => format!("{:o}", mag),
            16 => {
                if self.upper {
                    format!("{:X}", mag)
                } else {
                    format!("{:x}", mag)
                }
            }
            2 => format!("{:b}", mag),
            _ => unreachable!(),
        };
        if format.prec >= 0 {
            let prec = format.prec as usize;
            while digits.len() < prec {
                digits.insert(0, '0');
            }
        }
        if self.radix == 16 && format.flags.contains(FormatFlags::ALT) && mag != 0 {
            digits.insert_str(0, if self.upper { "0X" } else { "0x" });
        }
        digits
    }
}

impl Converter for IntConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let body = if self.signed {
            let v = value.as_i64()?;
            let mag = v.unsigned_abs();
            let digits = self.format_digits(mag, format);
            if v < 0 {
                format!("-{digits}")
            } else if format.flags.contains(FormatFlags::SIGN) {
                format!("+{digits}")
            } else if format.flags.contains(FormatFlags::SPACE) {
                format!(" {digits}")
            } else {
                digits
            }
        } else {
            self.format_digits(value.as_u64()?, format)
        };
        pad_and_append(sink, format, &body);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let text = std::str::from_utf8(source).map_err(|_| Error::ScanMismatch(0))?;
        let mut i = 0usize;
        let bytes = text.as_bytes();
        let limit = if format.width > 0 {
            (format.width as usize).min(bytes.len())
        } else {
            bytes.len()
        };
        let mut negative = false;
        if i < limit && (bytes[i] == b'-' || bytes[i] == b'+') {
            negative = bytes[i] == b'-';
            i += 1;
        }
        let digit_ok = |b: u8| -> bool {
            match self.radix {
                2 => b == b'0' || b == b'1',
                8 => (b'0'..=b'7').contains(&b),
                10 => b.is_ascii_digit(),
                16 => b.is_ascii_hexdigit(),
                _ => false,
            }
        };
        let digit_start = i;
        while i < limit && digit_ok(bytes[i]) {
            i += 1;
        }
        if i == digit_start {
            return Err(Error::ScanMismatch(0));
        }
        let digits = &text[digit_start..i];
        let mag = u64::from_str_radix(digits, self.radix).map_err(|_| Error::ScanMismatch(0))?;
        let value = if self.signed {
            let signed = mag as i64 * if negative { -1 } else { 1 };
            Value::Signed(signed)
        } else {
            Value::Unsigned(mag)
        };
        apply_skip(format, out, value);
        Ok(i)
    }
}

/// `r` — raw big/little-endian integer, `prec` bytes wide. `Alt` flag
/// selects little-endian; scan sign-extends.
struct RawConverter;

impl Converter for RawConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let n = if format.prec > 0 { format.prec as usize } else { 4 };
        let v = value.as_i64()?;
        let full = v.to_be_bytes();
        let mut bytes = full[8 - n.min(8)..].to_vec();
        if format.flags.contains(FormatFlags::ALT) {
            bytes.reverse();
        }
        sink.append(&bytes);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let n = if format.prec > 0 { format.prec as usize } else { 4 };
        if source.len() < n {
            return Err(Error::ScanMismatch(0));
        }
        let mut be = source[..n].to_vec();
        if format.flags.contains(FormatFlags::ALT) {
            be.reverse();
        }
        let sign_extend = be[0] & 0x80 != 0;
        let mut full = [if sign_extend { 0xffu8 } else { 0u8 }; 8];
        full[8 - n..].copy_from_slice(&be);
        let v = i64::from_be_bytes(full);
        apply_skip(format, out, Value::Signed(v));
        Ok(n)
    }
}

/// `D` — packed BCD, `width` bytes wide (spec.md §8 scenario 3: `%4D` is
/// a 4-byte field), optional sign in the MSB nibble.
struct BcdConverter;

impl Converter for BcdConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let n = if format.width > 0 { format.width as usize } else { 1 };
        let v = value.as_i64()?;
        let mut mag = v.unsigned_abs();
        let mut bytes = vec![0u8; n];
        for byte in bytes.iter_mut().rev() {
            let lo = (mag % 10) as u8;
            mag /= 10;
            let hi = (mag % 10) as u8;
            mag /= 10;
            *byte = (hi << 4) | lo;
        }
        if v < 0 {
            bytes[0] |= 0xa0;
        }
        sink.append(&bytes);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let n = if format.width > 0 { format.width as usize } else { 1 };
        if source.len() < n {
            return Err(Error::ScanMismatch(0));
        }
        let mut mag: i64 = 0;
        let mut negative = false;
        for (idx, &byte) in source[..n].iter().enumerate() {
            let mut hi = byte >> 4;
            let lo = byte & 0x0f;
            if idx == 0 && hi >= 0xa {
                negative = true;
                hi &= 0x0f;
            }
            if hi > 9 || lo > 9 {
                return Err(Error::ScanMismatch(idx));
            }
            mag = mag * 100 + (hi as i64) * 10 + lo as i64;
        }
        let v = if negative { -mag } else { mag };
        apply_skip(format, out, Value::Signed(v));
        Ok(n)
    }
}

enum FloatStyle {
    Fixed,
    Exp,
    General,
}

/// `f e E g G` — floating point conversions.
struct FloatConverter {
    style: FloatStyle,
    upper: bool,
}

impl Converter for FloatConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let v = value.as_f64()?;
        let prec = if format.prec >= 0 { format.prec as usize } else { 6 };
        let mut body = match self.style {
            FloatStyle::Fixed => format!("{:.*}", prec, v),
            FloatStyle::Exp => {
                let s = format!("{:.*e}", prec, v);
                normalize_exp(&s, self.upper)
            }
            FloatStyle::General => {
                let s = format!("{}", v);
                s
            }
        };
        if v >= 0.0 {
            if format.flags.contains(FormatFlags::SIGN) {
                body.insert(0, '+');
            } else if format.flags.contains(FormatFlags::SPACE) {
                body.insert(0, ' ');
            }
        }
        pad_and_append(sink, format, &body);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let text = std::str::from_utf8(source).map_err(|_| Error::ScanMismatch(0))?;
        let bytes = text.as_bytes();
        let limit = if format.width > 0 {
            (format.width as usize).min(bytes.len())
        } else {
            bytes.len()
        };
        let mut i = 0usize;
        if i < limit && (bytes[i] == b'-' || bytes[i] == b'+') {
            i += 1;
        }
        let mut seen_digit = false;
        while i < limit && bytes[i].is_ascii_digit() {
            i += 1;
            seen_digit = true;
        }
        if i < limit && bytes[i] == b'.' {
            i += 1;
            while i < limit && bytes[i].is_ascii_digit() {
                i += 1;
                seen_digit = true;
            }
        }
        if !seen_digit {
            return Err(Error::ScanMismatch(0));
        }
        if i < limit && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < limit && (bytes[j] == b'-' || bytes[j] == b'+') {
                j += 1;
            }
            let exp_start = j;
            while j < limit && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > exp_start {
                i = j;
            }
        }
        let v: f64 = text[..i].parse().map_err(|_| Error::ScanMismatch(0))?;
        apply_skip(format, out, Value::Double(v));
        Ok(i)
    }
}

fn normalize_exp(s: &str, upper: bool) -> String {
    let s = s.replacen('e', if upper { "E" } else { "e" }, 1);
    if let Some(pos) = s.find(['e', 'E']) {
        let (mantissa, exp) = s.split_at(pos);
        let marker = &exp[..1];
        let rest = &exp[1..];
        let (sign, digits) = if let Some(stripped) = rest.strip_prefix('-') {
            ("-", stripped)
        } else if let Some(stripped) = rest.strip_prefix('+') {
            ("+", stripped)
        } else {
            ("+", rest)
        };
        let digits = if digits.len() < 2 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };
        format!("{mantissa}{marker}{sign}{digits}")
    } else {
        s
    }
}

/// `s` — string conversion; consumes up to `width` non-whitespace bytes
/// (or the whole field, when scanning against a literal boundary the
/// template already demarcates).
struct StringConverter;

impl Converter for StringConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let bytes = value.as_bytes()?;
        let mut body = String::from_utf8_lossy(bytes).into_owned();
        if format.prec >= 0 {
            body.truncate(format.prec as usize);
        }
        pad_and_append(sink, format, &body);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let limit = if format.width > 0 {
            (format.width as usize).min(source.len())
        } else {
            source.len()
        };
        let end = source[..limit]
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(limit);
        if end == 0 {
            return Err(Error::ScanMismatch(0));
        }
        apply_skip(format, out, Value::Bytes(source[..end].to_vec()));
        Ok(end)
    }
}

/// `c` — a single character, or `width` characters when `width > 0`.
struct CharConverter;

impl Converter for CharConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        sink.append(value.as_bytes()?);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let n = if format.width > 0 { format.width as usize } else { 1 };
        if source.len() < n {
            return Err(Error::ScanMismatch(0));
        }
        apply_skip(format, out, Value::Bytes(source[..n].to_vec()));
        Ok(n)
    }
}

/// `[...]` — bracket set conversion; `info` is the bracket body, e.g.
/// `0-9a-f` or `^0-9` for negation.
struct BracketConverter;

fn bracket_matches(info: &[u8], b: u8) -> bool {
    let (negate, ranges) = if info.first() == Some(&b'^') {
        (true, &info[1..])
    } else {
        (false, info)
    };
    let mut i = 0;
    let mut found = false;
    while i < ranges.len() {
        if i + 2 < ranges.len() && ranges[i + 1] == b'-' {
            if ranges[i] <= b && b <= ranges[i + 2] {
                found = true;
            }
            i += 3;
        } else {
            if ranges[i] == b {
                found = true;
            }
            i += 1;
        }
    }
    found != negate
}

impl Converter for BracketConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        sink.append(value.as_bytes()?);
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let limit = if format.width > 0 {
            (format.width as usize).min(source.len())
        } else {
            source.len()
        };
        let mut i = 0;
        while i < limit && bracket_matches(&format.info, source[i]) {
            i += 1;
        }
        if i == 0 {
            return Err(Error::ScanMismatch(0));
        }
        apply_skip(format, out, Value::Bytes(source[..i].to_vec()));
        Ok(i)
    }
}

/// `{a|b|c}` — enumerated strings. Prints the branch indexed by the
/// integer value; scans by matching the first branch present at the
/// current position, returning its index.
struct EnumConverter;

fn branches(info: &[u8]) -> Vec<&str> {
    std::str::from_utf8(info).unwrap_or("").split('|').collect()
}

impl Converter for EnumConverter {
    fn print(&self, format: &StreamFormat, sink: &mut Buffer, value: &Value) -> Result<()> {
        if format.flags.contains(FormatFlags::SKIP) {
            return Err(Error::Format("cannot print a skip-flagged field".into()));
        }
        let idx = value.as_i64()? as usize;
        let opts = branches(&format.info);
        let branch = opts
            .get(idx)
            .ok_or_else(|| Error::Format(format!("enum index {idx} out of range")))?;
        sink.append(branch.as_bytes());
        Ok(())
    }

    fn scan(&self, format: &StreamFormat, source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        let opts = branches(&format.info);
        for (idx, branch) in opts.iter().enumerate() {
            if source.starts_with(branch.as_bytes()) {
                apply_skip(format, out, Value::Signed(idx as i64));
                return Ok(branch.len());
            }
        }
        Err(Error::ScanMismatch(0))
    }
}

/// `T` — pseudo conversion: injects the current absolute time into the
/// outgoing buffer rather than transferring a record value.
struct TimestampConverter;

impl Converter for TimestampConverter {
    fn print(&self, _format: &StreamFormat, sink: &mut Buffer, _value: &Value) -> Result<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut s = String::new();
        let _ = write!(s, "{}.{:06}", now.as_secs(), now.subsec_micros());
        sink.append(s.as_bytes());
        Ok(())
    }

    fn scan(&self, _format: &StreamFormat, _source: &[u8], out: &mut Option<Value>) -> Result<usize> {
        // Pseudo conversions run a side effect rather than transfer a
        // value; nothing is consumed on scan.
        *out = None;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatKind;

    fn fmt(conv: char, kind: FormatKind, flags: FormatFlags, width: u16, prec: i16, info: &[u8]) -> StreamFormat {
        StreamFormat { conv, kind, flags, width, prec, info: info.to_vec() }
    }

    #[test]
    fn signed_decimal_round_trips() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('d').unwrap();
        let f = fmt('d', FormatKind::Signed, FormatFlags::empty(), 0, -1, &[]);
        let mut sink = Buffer::new();
        conv.print(&f, &mut sink, &Value::Signed(-42)).unwrap();
        assert_eq!(sink.as_slice(), b"-42");
        let mut out = None;
        let n = conv.scan(&f, sink.as_slice(), &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, Some(Value::Signed(-42)));
    }

    #[test]
    fn raw_little_endian_sign_extends() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('r').unwrap();
        let f = fmt('r', FormatKind::Signed, FormatFlags::ALT, 0, 2, &[]);
        let mut sink = Buffer::new();
        conv.print(&f, &mut sink, &Value::Signed(-1)).unwrap();
        assert_eq!(sink.as_slice(), &[0xff, 0xff]);
        let mut out = None;
        conv.scan(&f, sink.as_slice(), &mut out).unwrap();
        assert_eq!(out, Some(Value::Signed(-1)));
    }

    #[test]
    fn bcd_scan_matches_spec_example() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('D').unwrap();
        let f = fmt('D', FormatKind::Signed, FormatFlags::empty(), 4, -1, &[]);
        let bytes = [0x12, 0x34, 0x56, 0x78];
        let mut out = None;
        let n = conv.scan(&f, &bytes, &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, Some(Value::Signed(12345678)));
    }

    #[test]
    fn bcd_scan_rejects_invalid_nibble() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('D').unwrap();
        let f = fmt('D', FormatKind::Signed, FormatFlags::empty(), 4, -1, &[]);
        let bytes = [0x12, 0x34, 0x56, 0x7a];
        let mut out = None;
        assert!(conv.scan(&f, &bytes, &mut out).is_err());
    }

    #[test]
    fn enum_prints_and_scans_branch() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('{').unwrap();
        let f = fmt('{', FormatKind::Enum, FormatFlags::empty(), 0, -1, b"off|on|auto");
        let mut sink = Buffer::new();
        conv.print(&f, &mut sink, &Value::Signed(1)).unwrap();
        assert_eq!(sink.as_slice(), b"on");
        let mut out = None;
        let n = conv.scan(&f, b"on maybe", &mut out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, Some(Value::Signed(1)));
    }

    #[test]
    fn skip_flag_discards_scanned_value() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('d').unwrap();
        let f = fmt('d', FormatKind::Signed, FormatFlags::SKIP, 0, -1, &[]);
        let mut out = Some(Value::Signed(999));
        conv.scan(&f, b"7", &mut out).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn skip_flag_errors_on_print() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('d').unwrap();
        let f = fmt('d', FormatKind::Signed, FormatFlags::SKIP, 0, -1, &[]);
        let mut sink = Buffer::new();
        assert!(conv.print(&f, &mut sink, &Value::Signed(1)).is_err());
    }

    #[test]
    fn float_fixed_round_trips_to_printed_precision() {
        let reg = ConverterRegistry::with_builtins();
        let conv = reg.get('f').unwrap();
        let f = fmt('f', FormatKind::Double, FormatFlags::empty(), 0, 3, &[]);
        let mut sink = Buffer::new();
        conv.print(&f, &mut sink, &Value::Double(3.14159)).unwrap();
        assert_eq!(sink.as_slice(), b"3.142");
        let mut out = None;
        conv.scan(&f, sink.as_slice(), &mut out).unwrap();
        assert_eq!(out, Some(Value::Double(3.142)));
    }
}

/// Round-trip laws (spec.md §8: "for every supported conversion `c` and
/// every value `v` in its domain, `scan(c, print(c, v)) = v`").
#[cfg(test)]
mod roundtrip_laws {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(conv: char, format: StreamFormat, value: Value) {
        let reg = ConverterRegistry::with_builtins();
        let c = reg.get(conv).unwrap();
        let mut sink = Buffer::new();
        c.print(&format, &mut sink, &value).unwrap();
        let mut out = None;
        let consumed = c.scan(&format, sink.as_slice(), &mut out).unwrap();
        assert_eq!(consumed, sink.len());
        assert_eq!(out, Some(value));
    }

    proptest! {
        #[test]
        fn signed_decimal_roundtrips(v in any::<i32>()) {
            let f = StreamFormat { conv: 'd', kind: FormatKind::Signed, flags: FormatFlags::empty(), width: 0, prec: -1, info: Vec::new() };
            roundtrip('d', f, Value::Signed(v as i64));
        }

        #[test]
        fn unsigned_hex_roundtrips(v in any::<u32>()) {
            let f = StreamFormat { conv: 'x', kind: FormatKind::Unsigned, flags: FormatFlags::empty(), width: 0, prec: -1, info: Vec::new() };
            roundtrip('x', f, Value::Unsigned(v as u64));
        }

        #[test]
        fn unsigned_octal_roundtrips(v in any::<u32>()) {
            let f = StreamFormat { conv: 'o', kind: FormatKind::Unsigned, flags: FormatFlags::empty(), width: 0, prec: -1, info: Vec::new() };
            roundtrip('o', f, Value::Unsigned(v as u64));
        }

        #[test]
        fn raw_big_endian_roundtrips(v in -(1i64 << 31)..(1i64 << 31)) {
            let f = StreamFormat { conv: 'r', kind: FormatKind::Signed, flags: FormatFlags::empty(), width: 0, prec: 4, info: Vec::new() };
            roundtrip('r', f, Value::Signed(v));
        }

        #[test]
        fn raw_little_endian_roundtrips(v in -(1i64 << 31)..(1i64 << 31)) {
            let f = StreamFormat { conv: 'r', kind: FormatKind::Signed, flags: FormatFlags::ALT, width: 0, prec: 4, info: Vec::new() };
            roundtrip('r', f, Value::Signed(v));
        }

        #[test]
        fn bcd_roundtrips(v in 0i64..100_000_000) {
            let f = StreamFormat { conv: 'D', kind: FormatKind::Signed, flags: FormatFlags::empty(), width: 4, prec: -1, info: Vec::new() };
            roundtrip('D', f, Value::Signed(v));
        }

        #[test]
        fn double_fixed_roundtrips_to_printed_precision(v in -1.0e6f64..1.0e6) {
            let f = StreamFormat { conv: 'f', kind: FormatKind::Double, flags: FormatFlags::empty(), width: 0, prec: 6, info: Vec::new() };
            let reg = ConverterRegistry::with_builtins();
            let c = reg.get('f').unwrap();
            let mut sink = Buffer::new();
            c.print(&f, &mut sink, &Value::Double(v)).unwrap();
            let mut out = None;
            c.scan(&f, sink.as_slice(), &mut out).unwrap();
            let Some(Value::Double(roundtripped)) = out else { panic!("expected double") };
            prop_assert!((roundtripped - (v * 1e6).round() / 1e6).abs() < 1e-6);
        }

        #[test]
        fn enum_branch_roundtrips(idx in 0usize..3) {
            let f = StreamFormat { conv: '{', kind: FormatKind::Enum, flags: FormatFlags::empty(), width: 0, prec: -1, info: b"off|on|auto".to_vec() };
            roundtrip('{', f, Value::Signed(idx as i64));
        }
    }
}
