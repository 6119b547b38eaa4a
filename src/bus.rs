//! (E) Bus interface contract (spec.md §4.E, §6.2) — consumed, not
//! implemented, by the core. Concrete GPIB/CAN/serial/TCP drivers are out
//! of scope (spec.md §1); this module only defines the seam a session
//! drives and the mock transport in [`crate::mock`] that exercises it.

use crate::error::{BusStatus, Result};
use async_trait::async_trait;

/// Which polling discipline an `in` command's read uses (spec.md §4.D):
/// `Sync` blocks the owning session on `(replytimeout, readtimeout)`;
/// `Async` releases the bus and re-polls on `(pollperiod, readtimeout)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Sync,
    Async,
}

/// One delivery out of [`Bus::read_chunk`] — the Rust shape of the
/// original's repeatable `readCallback(status, bytes, n)`. `end` is the
/// transport's own End-of-message signal (spec.md §4.D `readCallback`
/// rule 2), independent of whatever terminator the protocol declares.
#[derive(Debug, Clone, Default)]
pub struct ReadChunk {
    pub status: BusStatus,
    pub bytes: Vec<u8>,
    pub end: bool,
}

/// Abstract transport: lock/unlock, write, read (sync/async), event
/// subscription, connect/disconnect (spec.md §4.E, §6.2).
///
/// Every method is async: suspension here *is* spec.md §5's "the core
/// never blocks on I/O; it posts requests and returns" — awaiting a
/// future does not block the executor thread, so the callback-indirection
/// the original C implementation needs is unnecessary in this translation.
/// Callers are expected to run one [`crate::session::Session`] per async
/// task, serialized by nothing but the session's own `&mut self` (spec.md
/// §5's session mutex).
#[async_trait]
pub trait Bus: Send + Sync {
    /// Requests exclusive transport-level ownership (e.g. a GPIB/CAN bus
    /// lock), distinct from [`crate::arbiter::Arbiter`]'s in-process
    /// priority queue that decides *which* session gets to call this next.
    async fn lock_request(&self, timeout_ms: u32) -> BusStatus;
    async fn unlock(&self);

    async fn write_request(&self, bytes: &[u8], timeout_ms: u32) -> BusStatus;

    /// Reads one chunk, waiting up to `timeout_ms` for the first byte of
    /// this call. A session calls this repeatedly, accumulating bytes and
    /// re-checking for its terminator/byte-count/end-flag after each
    /// delivery, the Rust shape of the original's repeatable
    /// `readCallback`.
    async fn read_chunk(&self, timeout_ms: u32, mode: ReadMode) -> ReadChunk;

    async fn accept_event(&self, mask: u32, timeout_ms: u32) -> BusStatus;

    /// Best-effort: sets the transport's own end-of-message marker. May
    /// silently truncate if the transport's EOS slot is shorter than
    /// `eos` (spec.md §6.2); the core reinserts the missing suffix itself
    /// when matching, so a short acceptance here is not an error.
    fn set_eos(&self, eos: &[u8]);

    /// Drains any bytes the transport already has queued without issuing
    /// a read — the early-input/early-event path of spec.md §4.D ("If
    /// buffered early input exists, tries to parse immediately"). Returns
    /// an empty vec when nothing is pending.
    fn take_buffered(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}
