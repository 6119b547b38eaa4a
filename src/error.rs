//! Error and terminal-status types for the engine.
//!
//! `Error` covers everything that can go wrong while building or running a
//! session (I/O, compile errors, programming errors). `Status` is the
//! separate terminal-status taxonomy of spec.md §7 — `Success` included —
//! surfaced to the record bridge when a protocol run finishes.

use thiserror::Error;

/// Errors for the protocol engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{path}:{line}: {msg}")]
    Parse {
        path: String,
        line: u32,
        msg: String,
    },
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown command block: {0}")]
    UnknownBlock(String),
    #[error("max_len: {max_len}, idx: {idx}")]
    BufOverflow { max_len: usize, idx: usize },
    #[error("format error: {0}")]
    Format(String),
    #[error("scan mismatch at byte {0}")]
    ScanMismatch(usize),
    #[error("{0}")]
    InvalidParams(String),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal status of a protocol run (spec.md §7).
///
/// Distinct from [`Error`]: `Success` is a valid, non-error terminal status,
/// and every other variant maps to exactly one handler body
/// (`@writetimeout`, `@replytimeout`, `@readtimeout`, `@mismatch`) if the
/// protocol declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Status {
    Success,
    LockTimeout,
    WriteTimeout,
    ReplyTimeout,
    ReadTimeout,
    ScanError,
    FormatError,
    Abort,
    Fault,
}

impl Status {
    /// The handler body (if any) this status dispatches to, per spec.md §4.D
    /// `finishProtocol`.
    pub fn handler_name(self) -> Option<&'static str> {
        match self {
            Status::WriteTimeout => Some("writetimeout"),
            Status::ReplyTimeout => Some("replytimeout"),
            Status::ReadTimeout => Some("readtimeout"),
            Status::ScanError => Some("mismatch"),
            _ => None,
        }
    }

    /// Fatal statuses clear pending input and cancel outstanding timers,
    /// per spec.md §7.
    pub fn is_fatal_reset(self) -> bool {
        matches!(self, Status::Abort | Status::Fault)
    }
}

/// Bus-level status reported by a [`crate::bus::Bus`] callback (spec.md §6.2).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BusStatus {
    #[default]
    Success,
    Timeout,
    NoReply,
    End,
    Fault,
}
