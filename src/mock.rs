//! In-memory [`Bus`]/[`RecordBridge`]/[`ExecHost`] implementations for
//! tests and the demonstration CLI (SPEC_FULL.md §5: "a mock transport
//! exercises the whole engine without real hardware," mirroring how
//! `jpe`'s own test suite and `src/main.rs` demo stand up a controller
//! without a serial port attached).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::bridge::{ExecHost, ReadOutcome, RecordBridge};
use crate::bus::{Bus, ReadChunk, ReadMode};
use crate::error::{BusStatus, Result};
use crate::format::{StreamFormat, Value};
use crate::protocol::FormatField;

#[derive(Default)]
struct MockState {
    writes: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    early_input: Vec<u8>,
    eos: Vec<u8>,
    stall_replies: bool,
    fault_on_write: bool,
}

/// A transport double: queued canned replies come back one per `in`
/// command, chunked byte-by-byte so tests can exercise the accumulate-
/// until-terminator loop in [`crate::session::Session::do_in`] (via its
/// private `do_in`, exercised indirectly through `Session::run`).
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockState>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes (normally already including the protocol's
    /// terminator) to be delivered, one byte per [`Bus::read_chunk`]
    /// call, against the next `in` command.
    pub fn queue_reply(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().replies.push_back(bytes.into());
    }

    /// Makes these bytes available via [`Bus::take_buffered`] before any
    /// read is issued — the early-input path of spec.md §4.D.
    pub fn queue_early_input(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().early_input = bytes.into();
    }

    /// Makes every subsequent `read_chunk` report [`BusStatus::Timeout`]
    /// with no bytes, until replies are queued again.
    pub fn stall_replies(&self, stall: bool) {
        self.state.lock().unwrap().stall_replies = stall;
    }

    /// Makes the next `write_request` report [`BusStatus::Fault`].
    pub fn fault_next_write(&self) {
        self.state.lock().unwrap().fault_on_write = true;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn lock_request(&self, _timeout_ms: u32) -> BusStatus {
        BusStatus::Success
    }

    async fn unlock(&self) {}

    async fn write_request(&self, bytes: &[u8], _timeout_ms: u32) -> BusStatus {
        let mut state = self.state.lock().unwrap();
        if state.fault_on_write {
            state.fault_on_write = false;
            return BusStatus::Fault;
        }
        state.writes.push(bytes.to_vec());
        BusStatus::Success
    }

    async fn read_chunk(&self, _timeout_ms: u32, _mode: ReadMode) -> ReadChunk {
        let mut state = self.state.lock().unwrap();
        if state.stall_replies {
            return ReadChunk { status: BusStatus::Timeout, bytes: Vec::new(), end: false };
        }
        let Some(front) = state.replies.front_mut() else {
            return ReadChunk { status: BusStatus::Timeout, bytes: Vec::new(), end: false };
        };
        if front.is_empty() {
            state.replies.pop_front();
            return ReadChunk { status: BusStatus::End, bytes: Vec::new(), end: true };
        }
        let byte = front.remove(0);
        let end = front.is_empty();
        if end {
            state.replies.pop_front();
        }
        ReadChunk { status: BusStatus::Success, bytes: vec![byte], end: false }
    }

    async fn accept_event(&self, _mask: u32, _timeout_ms: u32) -> BusStatus {
        BusStatus::Success
    }

    fn set_eos(&self, eos: &[u8]) {
        self.state.lock().unwrap().eos = eos.to_vec();
    }

    fn take_buffered(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().early_input)
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`RecordBridge`] backed by a plain `HashMap`, for tests and the demo
/// CLI — fields are just named [`Value`]s, addressed by path.
#[derive(Default)]
pub struct InMemoryBridge {
    values: HashMap<String, Value>,
}

impl InMemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, path: impl Into<String>, value: Value) -> Self {
        self.values.insert(path.into(), value);
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }
}

impl RecordBridge for InMemoryBridge {
    fn get_field_address(&self, path: &str) -> Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }

    fn format_value(&mut self, field: &FormatField, _format: &StreamFormat) -> Result<Value> {
        Ok(self.values.get(&field.path).cloned().unwrap_or(Value::Signed(0)))
    }

    fn match_value(&mut self, field: &FormatField, _format: &StreamFormat, value: Value) -> ReadOutcome {
        self.values.insert(field.path.clone(), value);
        ReadOutcome::Convert
    }
}

/// An [`ExecHost`] that just records every line it was asked to run, for
/// assertions in tests.
#[derive(Default)]
pub struct MockExecHost {
    pub lines: Vec<Vec<u8>>,
}

impl MockExecHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecHost for MockExecHost {
    fn exec(&mut self, line: &[u8]) -> Result<()> {
        self.lines.push(line.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_reply_is_delivered_byte_by_byte() {
        let bus = MockBus::new();
        bus.queue_reply(b"OK\r\n".to_vec());
        let mut got = Vec::new();
        loop {
            let chunk = bus.read_chunk(10, ReadMode::Sync).await;
            if chunk.status == BusStatus::Timeout {
                break;
            }
            got.extend(chunk.bytes);
        }
        assert_eq!(got, b"OK\r\n");
    }

    #[tokio::test]
    async fn stalled_bus_always_times_out() {
        let bus = MockBus::new();
        bus.queue_reply(b"X".to_vec());
        bus.stall_replies(true);
        let chunk = bus.read_chunk(10, ReadMode::Sync).await;
        assert_eq!(chunk.status, BusStatus::Timeout);
    }

    #[tokio::test]
    async fn fault_next_write_reports_fault_once() {
        let bus = MockBus::new();
        bus.fault_next_write();
        assert_eq!(bus.write_request(b"a", 10).await, BusStatus::Fault);
        assert_eq!(bus.write_request(b"b", 10).await, BusStatus::Success);
        assert_eq!(bus.writes(), vec![b"b".to_vec()]);
    }

    #[test]
    fn in_memory_bridge_round_trips_a_value() {
        let mut bridge = InMemoryBridge::new();
        let field = FormatField { path: "temp".into(), address: Vec::new() };
        let fmt = StreamFormat {
            conv: 'd',
            kind: crate::format::FormatKind::Signed,
            flags: crate::format::FormatFlags::empty(),
            width: 0,
            prec: -1,
            info: Vec::new(),
        };
        bridge.match_value(&field, &fmt, Value::Signed(42));
        assert_eq!(bridge.format_value(&field, &fmt).unwrap(), Value::Signed(42));
    }
}
