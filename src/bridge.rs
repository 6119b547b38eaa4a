//! (F) Record/field bridge and exec seam (spec.md §4.F, §6.2 `FORMAT_FIELD`).
//!
//! Lets a protocol's `%f(field)`-style conversions read and write named
//! process values instead of the session's own in/out buffers, and lets
//! `exec "..."` hand a line to a host-defined shell-out. Neither trait
//! needs `async-trait`: both model local record-database/process calls,
//! not transport I/O, matching SPEC_FULL.md §5.F's call to keep this seam
//! synchronous while [`crate::bus::Bus`] stays async.

use crate::error::Result;
use crate::format::{StreamFormat, Value};
use crate::protocol::FormatField;

/// Outcome of feeding a scanned [`Value`] back into a record (spec.md
/// §4.F): `DoNotConvert` lets a protocol signal "value accepted, but
/// leave the record's current value untouched" (used by pseudo
/// conversions like the timestamp field), while `Err` rejects the whole
/// input the way a mismatched literal would.
pub enum ReadOutcome {
    Convert,
    DoNotConvert,
    Err(String),
}

/// The thing a protocol's `%f(path)` conversions read from and write to.
/// `path` is the field-address text between the parentheses, exactly as
/// written in the protocol file (spec.md §6.2); a bridge implementation
/// resolves it however it wants (struct field name, map key, device
/// register...).
pub trait RecordBridge: Send + Sync {
    /// Looks up `path` once at bind time, returning an opaque address a
    /// later `format_value`/`match_value` call can use without
    /// re-resolving the name.
    fn get_field_address(&self, path: &str) -> Result<Vec<u8>>;

    /// Produces the value an `out` command's `%f(field)` conversion
    /// should print.
    fn format_value(&mut self, field: &FormatField, format: &StreamFormat) -> Result<Value>;

    /// Feeds a value scanned from an `in` command's `%f(field)` conversion
    /// back into the record.
    fn match_value(
        &mut self,
        field: &FormatField,
        format: &StreamFormat,
        value: Value,
    ) -> ReadOutcome;
}

/// Host hook for `exec "..."` commands (spec.md §4.D, §6.1): runs a line
/// of already-substituted, already-format-expanded text as a local
/// side effect (a shell command, a record-support callback, ...).
pub trait ExecHost: Send + Sync {
    fn exec(&mut self, line: &[u8]) -> Result<()>;
}
