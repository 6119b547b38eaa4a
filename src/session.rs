//! (D) Session interpreter: runs one compiled protocol to completion
//! against a [`Bus`], a [`RecordBridge`], and an optional [`ExecHost`]
//! (spec.md §4.D).
//!
//! Every suspension point in spec.md's state-machine description (`lock
//! request`, `write request`, `read callback`, `event callback`, `wait`)
//! becomes a plain `.await` here: the original's callback-driven control
//! flow and this `async fn`'s straight-line code describe the same state
//! machine, just with the compiler generating the resumption points
//! instead of a hand-written dispatch table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::arbiter::{Arbiter, ChannelKey};
use crate::bridge::{ExecHost, ReadOutcome, RecordBridge};
use crate::bus::{Bus, ReadMode};
use crate::buffer::Buffer;
use crate::config::ExtraInput;
use crate::error::{BusStatus, Error, Result, Status};
use crate::format::{ConverterRegistry, FormatFlags};
use crate::protocol::{decode_commands, CommandStep, CompiledProtocol, HandlerKind, PatternToken};
use crate::timer::Timer;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct SessionFlags: u8 {
        const BUS_OWNER       = 0x01;
        const ABORT_REQUESTED = 0x02;
    }
}

/// Whether a session's `in` commands block the caller (`Normal`/`Init`,
/// which share the same read discipline) or release the bus between
/// polls (`Async`), per spec.md §4.D `pollperiod` note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Init,
    Async,
}

type StepResult = std::result::Result<(), Status>;

/// One run of a compiled protocol against a transport. Not `Clone`: a
/// session owns its record bridge and exec host exclusively for the
/// duration of a `run()`.
pub struct Session {
    id: u64,
    program: Arc<CompiledProtocol>,
    channel: ChannelKey,
    priority: i32,
    mode: Mode,
    bus: Arc<dyn Bus>,
    arbiter: Arc<Arbiter>,
    bridge: Box<dyn RecordBridge>,
    exec_host: Option<Box<dyn ExecHost>>,
    converters: Arc<ConverterRegistry>,
    timer: Timer,
    flags: SessionFlags,
    input: Buffer,
    unparsed_input: Buffer,
    output: Buffer,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: Arc<CompiledProtocol>,
        channel: impl Into<ChannelKey>,
        priority: i32,
        mode: Mode,
        bus: Arc<dyn Bus>,
        arbiter: Arc<Arbiter>,
        bridge: Box<dyn RecordBridge>,
        exec_host: Option<Box<dyn ExecHost>>,
        converters: Arc<ConverterRegistry>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            program,
            channel: channel.into(),
            priority,
            mode,
            bus,
            arbiter,
            bridge,
            exec_host,
            converters,
            timer: Timer::new(),
            flags: SessionFlags::empty(),
            input: Buffer::new(),
            unparsed_input: Buffer::new(),
            output: Buffer::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_input(&self) -> &Buffer {
        &self.input
    }

    pub fn last_output(&self) -> &Buffer {
        &self.output
    }

    /// Marks the session for cancellation; the next blocking step it
    /// attempts resolves as [`Status::Abort`] instead of running (spec.md
    /// §7). Also cancels any timer the session is currently parked on.
    pub fn request_abort(&mut self) {
        self.flags.insert(SessionFlags::ABORT_REQUESTED);
        self.timer.cancel();
    }

    /// Runs the protocol's `init` handler (if declared) then its main
    /// body to completion, dispatching to `@writetimeout`/`@replytimeout`/
    /// `@readtimeout`/`@mismatch` on failure per spec.md §4.D
    /// `finishProtocol`, and returns the terminal [`Status`].
    pub async fn run(&mut self) -> Status {
        let lock_status = self
            .arbiter
            .acquire(&self.channel, self.id, self.priority, self.program.vars.lock_timeout)
            .await;
        if lock_status != BusStatus::Success {
            return Status::LockTimeout;
        }

        let bus_lock = self.bus.lock_request(self.program.vars.lock_timeout).await;
        if bus_lock != BusStatus::Success {
            self.arbiter.release(&self.channel, self.id);
            return Status::LockTimeout;
        }
        self.flags.insert(SessionFlags::BUS_OWNER);

        let status = self.run_body().await;

        if self.flags.contains(SessionFlags::BUS_OWNER) {
            self.bus.unlock().await;
            self.flags.remove(SessionFlags::BUS_OWNER);
            self.arbiter.release(&self.channel, self.id);
        }

        status
    }

    /// Releases the bus/arbiter lock this session currently owns, if any
    /// (spec.md §4.D: Async mode gives up the lock while polling so other
    /// sessions can use the channel between reads). A no-op if the session
    /// doesn't currently hold it.
    async fn release_bus_lock(&mut self) {
        if self.flags.contains(SessionFlags::BUS_OWNER) {
            self.bus.unlock().await;
            self.flags.remove(SessionFlags::BUS_OWNER);
            self.arbiter.release(&self.channel, self.id);
        }
    }

    /// Re-requests the lock [`Session::release_bus_lock`] gave up, in the
    /// same priority/timeout terms as [`Session::run`]'s initial acquire.
    async fn reacquire_bus_lock(&mut self) -> StepResult {
        if self.flags.contains(SessionFlags::BUS_OWNER) {
            return Ok(());
        }
        let lock_status = self
            .arbiter
            .acquire(&self.channel, self.id, self.priority, self.program.vars.lock_timeout)
            .await;
        if lock_status != BusStatus::Success {
            return Err(Status::LockTimeout);
        }
        let bus_lock = self.bus.lock_request(self.program.vars.lock_timeout).await;
        if bus_lock != BusStatus::Success {
            self.arbiter.release(&self.channel, self.id);
            return Err(Status::LockTimeout);
        }
        self.flags.insert(SessionFlags::BUS_OWNER);
        Ok(())
    }

    async fn run_body(&mut self) -> Status {
        let program = self.program.clone();

        if let Some(init) = program.handler(HandlerKind::Init) {
            let steps = match decode_commands(init) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(session = self.id, error = %e, "failed to decode init handler");
                    return Status::Fault;
                }
            };
            let init_status = self.exec_steps(&steps).await;
            if init_status != Status::Success {
                return init_status;
            }
        }

        let main_steps = match decode_commands(&program.main) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(session = self.id, error = %e, "failed to decode main body");
                return Status::Fault;
            }
        };

        let raw_status = self.exec_steps(&main_steps).await;
        self.dispatch_handler(raw_status).await
    }

    async fn exec_steps(&mut self, steps: &[CommandStep]) -> Status {
        for step in steps {
            let result: StepResult = match step {
                CommandStep::End => Ok(()),
                CommandStep::Out(tokens) => self.do_out(tokens).await,
                CommandStep::In(tokens) => self.do_in(tokens).await,
                CommandStep::Wait(ms) => self.do_wait(*ms).await,
                CommandStep::Event { mask, timeout_ms } => self.do_event(*mask, *timeout_ms).await,
                CommandStep::Exec(tokens) => self.do_exec(tokens).await,
            };
            if let Err(status) = result {
                return status;
            }
        }
        Status::Success
    }

    /// Implements spec.md §4.D `finishProtocol`'s handler dispatch:
    /// entering a handler records `status` as the run's original failure.
    /// If the handler body itself reaches `Success`, that propagates to
    /// the caller (end-to-end scenario 2: "the original caller sees
    /// Success"). If the handler body fails too, dispatch collapses back
    /// to the *original* triggering status rather than recursing — a
    /// handler's own failure never dispatches to another handler, since
    /// handlers cannot nest (spec.md §4.D).
    async fn dispatch_handler(&mut self, status: Status) -> Status {
        if status == Status::Success {
            return status;
        }
        if status.is_fatal_reset() {
            self.timer.cancel();
            self.input = Buffer::new();
            self.unparsed_input = Buffer::new();
        }
        let Some(name) = status.handler_name() else {
            return status;
        };
        let Some(kind) = HandlerKind::from_name(name) else {
            return status;
        };
        let Some(body) = self.program.handler(kind) else {
            return status;
        };
        let steps = match decode_commands(body) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(session = self.id, error = %e, handler = %kind, "failed to decode handler body");
                return status;
            }
        };
        tracing::debug!(session = self.id, %kind, original = %status, "entering handler");
        match self.exec_steps(&steps).await {
            Status::Success => Status::Success,
            _ => status,
        }
    }

    async fn do_out(&mut self, tokens: &[PatternToken]) -> StepResult {
        if self.flags.contains(SessionFlags::ABORT_REQUESTED) {
            return Err(Status::Abort);
        }
        // OUT clears the input buffer and any carried-over unparsed input
        // (spec.md §4.D) before writing the new command.
        self.input = Buffer::new();
        self.unparsed_input = Buffer::new();
        self.bus.take_buffered();

        let mut out = Buffer::new();
        let format_result = self.format_tokens_into(&mut out, tokens);
        if let Err(e) = format_result {
            tracing::warn!(session = self.id, error = %e, "format error while building output");
            self.output = out;
            return Err(Status::FormatError);
        }
        out.append(&self.program.vars.out_terminator);
        let write_status = self
            .bus
            .write_request(out.as_slice(), self.program.vars.write_timeout)
            .await;
        self.output = out;
        match write_status {
            BusStatus::Success => Ok(()),
            BusStatus::Timeout => Err(Status::WriteTimeout),
            BusStatus::NoReply | BusStatus::End | BusStatus::Fault => Err(Status::Fault),
        }
    }

    async fn do_in(&mut self, tokens: &[PatternToken]) -> StepResult {
        if self.flags.contains(SessionFlags::ABORT_REQUESTED) {
            return Err(Status::Abort);
        }
        let mode = if self.mode == Mode::Async { ReadMode::Async } else { ReadMode::Sync };
        let vars = self.program.vars.clone();

        // Seed from whatever tail a previous `in` left unparsed, then from
        // whatever the transport already has queued (spec.md §4.D early
        // input path).
        let mut acc = std::mem::take(&mut self.unparsed_input);
        acc.append(&self.bus.take_buffered());
        let mut got_any = !acc.is_empty();

        // Async mode releases the bus/arbiter lock for the duration of the
        // polling loop so other sessions can use the channel in between
        // (spec.md §4.D).
        if mode == ReadMode::Async {
            self.release_bus_lock().await;
        }

        let status = loop {
            if self.flags.contains(SessionFlags::ABORT_REQUESTED) {
                break Err(Status::Abort);
            }
            if let Some(at) = find_terminator(acc.as_slice(), &vars.in_terminator) {
                let tail_at = at + vars.in_terminator.len();
                let body = acc.as_slice()[..at].to_vec();
                self.unparsed_input = Buffer::with_content(&acc.as_slice()[tail_at..]);
                self.input = Buffer::with_content(&body);
                break self.finish_in(tokens, &body);
            }
            if vars.max_input > 0 && acc.len() >= vars.max_input {
                let body = acc.as_slice().to_vec();
                self.input = Buffer::with_content(&body);
                break self.finish_in(tokens, &body);
            }

            let timeout_ms = if got_any {
                vars.read_timeout
            } else if mode == ReadMode::Async {
                vars.poll_period()
            } else {
                vars.reply_timeout
            };

            let chunk = self.bus.read_chunk(timeout_ms, mode).await;
            match chunk.status {
                BusStatus::Success | BusStatus::End => {
                    if !chunk.bytes.is_empty() {
                        acc.append(&chunk.bytes);
                        got_any = true;
                    }
                    if chunk.end {
                        let body = acc.as_slice().to_vec();
                        self.input = Buffer::with_content(&body);
                        break self.finish_in(tokens, &body);
                    }
                }
                BusStatus::Timeout if !got_any => break Err(Status::ReplyTimeout),
                BusStatus::Timeout => {
                    // The inter-byte gap expired with nothing more arriving;
                    // still try to parse what accumulated so far (spec.md §8's
                    // late-reply carve-out) before giving up as a read timeout.
                    let body = acc.as_slice().to_vec();
                    self.input = Buffer::with_content(&body);
                    break self.finish_in(tokens, &body).map_err(|_| Status::ReadTimeout);
                }
                BusStatus::NoReply => break Err(Status::ReplyTimeout),
                BusStatus::Fault => break Err(Status::Fault),
            }
        };

        if mode == ReadMode::Async {
            if let Err(e) = self.reacquire_bus_lock().await {
                return Err(e);
            }
        }

        status
    }

    fn finish_in(&mut self, tokens: &[PatternToken], body: &[u8]) -> StepResult {
        match self.match_input(tokens, body) {
            Ok(consumed) => {
                if consumed < body.len() && self.program.vars.extra_input == ExtraInput::Error {
                    Err(Status::ScanError)
                } else {
                    Ok(())
                }
            }
            Err(_) => Err(Status::ScanError),
        }
    }

    async fn do_wait(&mut self, ms: u32) -> StepResult {
        if self.flags.contains(SessionFlags::ABORT_REQUESTED) {
            return Err(Status::Abort);
        }
        let completed = self.timer.wait(ms).await;
        if self.flags.contains(SessionFlags::ABORT_REQUESTED) || !completed {
            return Err(Status::Abort);
        }
        Ok(())
    }

    async fn do_event(&mut self, mask: u32, timeout_ms: u32) -> StepResult {
        if self.flags.contains(SessionFlags::ABORT_REQUESTED) {
            return Err(Status::Abort);
        }
        // A zero-timeout event wait in Async mode releases the lock the
        // same way Async `in` polling does (spec.md §4.D).
        let release = self.mode == Mode::Async && timeout_ms == 0;
        if release {
            self.release_bus_lock().await;
        }
        let event_status = self.bus.accept_event(mask, timeout_ms).await;
        if release {
            self.reacquire_bus_lock().await?;
        }
        match event_status {
            BusStatus::Success => Ok(()),
            BusStatus::Timeout => Err(Status::ReadTimeout),
            BusStatus::NoReply | BusStatus::End | BusStatus::Fault => Err(Status::Fault),
        }
    }

    async fn do_exec(&mut self, tokens: &[PatternToken]) -> StepResult {
        let mut scratch = Buffer::new();
        if let Err(e) = self.format_tokens_into(&mut scratch, tokens) {
            tracing::warn!(session = self.id, error = %e, "format error while building exec line");
            return Err(Status::FormatError);
        }
        let Some(host) = self.exec_host.as_mut() else {
            tracing::warn!(session = self.id, "exec command with no exec host configured");
            return Err(Status::Fault);
        };
        host.exec(scratch.as_slice()).map_err(|_| Status::Fault)
    }

    /// Builds `out`/`exec` bytes into `sink` (spec.md §4.D, §6.2): literal
    /// bytes copy through, [`PatternToken::Skip`] is elided, and each
    /// [`PatternToken::Format`] pulls a value from the record bridge and
    /// prints it. The separator (spec.md §4.D) is emitted before every
    /// value after the first.
    fn format_tokens_into(&mut self, sink: &mut Buffer, tokens: &[PatternToken]) -> Result<()> {
        let separator = self.program.vars.separator.clone();
        let mut first_value = true;
        for tok in tokens {
            match tok {
                PatternToken::Literal(b) => sink.append_byte(*b),
                PatternToken::Skip => {}
                PatternToken::Format { format, field } => {
                    if !separator.is_empty() && !first_value {
                        sink.append(&separator);
                    }
                    first_value = false;

                    if format.flags.contains(FormatFlags::SKIP) {
                        return Err(Error::Format(
                            "cannot print a skip-flagged conversion".into(),
                        ));
                    }
                    let Some(field) = field else {
                        return Err(Error::Format(
                            "out/exec conversion has no bound field".into(),
                        ));
                    };
                    let value = self.bridge.format_value(field, format)?;
                    let converter = self.converters.get(format.conv).ok_or_else(|| {
                        Error::Format(format!("unknown conversion '{}'", format.conv))
                    })?;
                    converter.print(format, sink, &value)?;
                }
            }
        }
        Ok(())
    }

    /// Matches an `in` template against `source` (spec.md §4.D, §6.2),
    /// returning the number of bytes consumed. The separator's leading
    /// space (if any) skips input whitespace greedily before matching the
    /// separator's remaining literal bytes; [`PatternToken::Skip`] is a
    /// single-byte wildcard.
    fn match_input(&mut self, tokens: &[PatternToken], source: &[u8]) -> Result<usize> {
        let separator = self.program.vars.separator.clone();
        let mut first_value = true;
        let mut pos = 0usize;
        for tok in tokens {
            match tok {
                PatternToken::Literal(b) => {
                    if pos >= source.len() || source[pos] != *b {
                        return Err(Error::ScanMismatch(pos));
                    }
                    pos += 1;
                }
                PatternToken::Skip => {
                    if pos >= source.len() {
                        return Err(Error::ScanMismatch(pos));
                    }
                    pos += 1;
                }
                PatternToken::Format { format, field } => {
                    if !separator.is_empty() && !first_value {
                        pos = match_separator(source, pos, &separator)?;
                    }
                    first_value = false;

                    let converter = self.converters.get(format.conv).ok_or_else(|| {
                        Error::Format(format!("unknown conversion '{}'", format.conv))
                    })?;
                    let mut out = None;
                    let consumed = converter.scan(format, &source[pos..], &mut out)?;
                    pos += consumed;
                    if let Some(value) = out {
                        if let Some(field) = field {
                            match self.bridge.match_value(field, format, value) {
                                ReadOutcome::Convert | ReadOutcome::DoNotConvert => {}
                                ReadOutcome::Err(msg) => return Err(Error::Format(msg)),
                            }
                        }
                    }
                }
            }
        }
        Ok(pos)
    }
}

/// A separator whose first byte is a space skips input whitespace
/// greedily first, then the remaining separator bytes must match
/// literally (spec.md §4.D).
fn match_separator(source: &[u8], mut pos: usize, separator: &[u8]) -> Result<usize> {
    let mut rest = separator;
    if separator.first() == Some(&b' ') {
        while pos < source.len() && source[pos].is_ascii_whitespace() {
            pos += 1;
        }
        rest = &separator[1..];
    }
    for &sb in rest {
        if pos >= source.len() || source[pos] != sb {
            return Err(Error::ScanMismatch(pos));
        }
        pos += 1;
    }
    Ok(pos)
}

fn find_terminator(haystack: &[u8], term: &[u8]) -> Option<usize> {
    if term.is_empty() || term.len() > haystack.len() {
        return None;
    }
    haystack.windows(term.len()).position(|w| w == term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ReadOutcome;
    use crate::format::{FormatKind, StreamFormat, Value};
    use crate::protocol::FormatField;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubBus;

    #[async_trait::async_trait]
    impl Bus for StubBus {
        async fn lock_request(&self, _timeout_ms: u32) -> BusStatus {
            BusStatus::Success
        }
        async fn unlock(&self) {}
        async fn write_request(&self, _bytes: &[u8], _timeout_ms: u32) -> BusStatus {
            BusStatus::Success
        }
        async fn read_chunk(&self, _timeout_ms: u32, _mode: ReadMode) -> crate::bus::ReadChunk {
            crate::bus::ReadChunk::default()
        }
        async fn accept_event(&self, _mask: u32, _timeout_ms: u32) -> BusStatus {
            BusStatus::Success
        }
        fn set_eos(&self, _eos: &[u8]) {}
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StubBridge {
        values: Mutex<HashMap<String, Value>>,
    }

    impl RecordBridge for StubBridge {
        fn get_field_address(&self, path: &str) -> Result<Vec<u8>> {
            Ok(path.as_bytes().to_vec())
        }
        fn format_value(&mut self, field: &FormatField, _format: &StreamFormat) -> Result<Value> {
            Ok(self.values.lock().unwrap().get(&field.path).cloned().unwrap_or(Value::Signed(0)))
        }
        fn match_value(&mut self, field: &FormatField, _format: &StreamFormat, value: Value) -> ReadOutcome {
            self.values.lock().unwrap().insert(field.path.clone(), value);
            ReadOutcome::Convert
        }
    }

    fn field(path: &str) -> FormatField {
        FormatField { path: path.to_string(), address: Vec::new() }
    }

    fn int_format() -> StreamFormat {
        StreamFormat {
            conv: 'd',
            kind: FormatKind::Signed,
            flags: crate::format::FormatFlags::empty(),
            width: 0,
            prec: -1,
            info: Vec::new(),
        }
    }

    fn new_session(vars: crate::config::ProtocolVars) -> Session {
        let program = Arc::new(CompiledProtocol {
            name: "test".into(),
            main: Vec::new(),
            handlers: HashMap::new(),
            vars,
        });
        let bridge = Box::new(StubBridge { values: Mutex::new(HashMap::new()) });
        Session::new(
            program,
            "ch",
            0,
            Mode::Normal,
            Arc::new(StubBus),
            Arc::new(Arbiter::new()),
            bridge,
            None,
            Arc::new(ConverterRegistry::with_builtins()),
        )
    }

    #[test]
    fn format_emits_separator_between_values_not_before_first() {
        let mut vars = crate::config::ProtocolVars::default();
        vars.separator = b", ".to_vec();
        let mut s = new_session(vars);
        s.bridge.match_value(&field("a"), &int_format(), Value::Signed(1));
        s.bridge.match_value(&field("b"), &int_format(), Value::Signed(2));
        let tokens = vec![
            PatternToken::Format { format: int_format(), field: Some(field("a")) },
            PatternToken::Format { format: int_format(), field: Some(field("b")) },
        ];
        let mut sink = Buffer::new();
        s.format_tokens_into(&mut sink, &tokens).unwrap();
        assert_eq!(sink.as_slice(), b"1, 2");
    }

    #[test]
    fn match_consumes_separator_between_values() {
        let mut vars = crate::config::ProtocolVars::default();
        vars.separator = b",".to_vec();
        let mut s = new_session(vars);
        let tokens = vec![
            PatternToken::Format { format: int_format(), field: Some(field("a")) },
            PatternToken::Format { format: int_format(), field: Some(field("b")) },
        ];
        let consumed = s.match_input(&tokens, b"1,2").unwrap();
        assert_eq!(consumed, 3);
    }

    #[test]
    fn match_separator_leading_space_skips_whitespace_then_matches_literal() {
        let consumed = match_separator(b"   , 9", 0, b" ,").unwrap();
        assert_eq!(&b"   , 9"[consumed..], b" 9");
    }

    #[test]
    fn literal_mismatch_reports_byte_offset() {
        let mut s = new_session(crate::config::ProtocolVars::default());
        let tokens = vec![PatternToken::Literal(b'A'), PatternToken::Literal(b'B')];
        let err = s.match_input(&tokens, b"AX").unwrap_err();
        match err {
            Error::ScanMismatch(pos) => assert_eq!(pos, 1),
            other => panic!("expected ScanMismatch, got {other:?}"),
        }
    }

    #[test]
    fn skip_token_consumes_one_byte_without_binding() {
        let mut s = new_session(crate::config::ProtocolVars::default());
        let tokens = vec![PatternToken::Skip, PatternToken::Literal(b'X')];
        assert_eq!(s.match_input(&tokens, b"AX").unwrap(), 2);
    }
}
