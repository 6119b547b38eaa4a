//! End-to-end scenarios driving the full `Engine`/`Session` stack against
//! the in-memory mock bus, one per named scenario in spec.md §8.

use std::sync::Arc;
use std::time::Duration;

use streamcore::arbiter::Arbiter;
use streamcore::bridge::{ReadOutcome, RecordBridge};
use streamcore::error::Status;
use streamcore::format::{ConverterRegistry, StreamFormat, Value};
use streamcore::protocol::FormatField;
use streamcore::mock::{InMemoryBridge, MockBus};
use streamcore::protocol::compiler;
use streamcore::session::{Mode, Session};

fn new_session(
    src: &str,
    entry: &str,
    bus: Arc<MockBus>,
    bridge: InMemoryBridge,
    mode: Mode,
) -> Session {
    let compiled = Arc::new(compiler::compile("test.proto", src, entry).unwrap());
    Session::new(
        compiled,
        "test-channel",
        0,
        mode,
        bus,
        Arc::new(Arbiter::new()),
        Box::new(bridge),
        None,
        Arc::new(ConverterRegistry::with_builtins()),
    )
}

/// Scenario 1: a plain command/reply round trip completes with `Success`
/// and the reply is visible to the session once its terminator arrives.
#[tokio::test]
async fn scenario_echo_round_trip() {
    let src = r#"
        echo {
            terminator = "\r\n";
            out "HELLO";
            in "WORLD";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_reply(b"WORLD\r\n".to_vec());

    let mut session = new_session(src, "echo", bus.clone(), InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::Success);
    assert_eq!(bus.writes(), vec![b"HELLO\r\n".to_vec()]);
    assert_eq!(session.last_input().as_slice(), b"WORLD");
}

/// Scenario 2: a reply that never arrives within `replytimeout` dispatches
/// to the `@replytimeout` handler; if that handler's own exchange succeeds,
/// the whole run reports `Success` to the original caller.
#[tokio::test]
async fn scenario_late_reply_recovers_via_handler() {
    let src = r#"
        p {
            replytimeout = 30;
            out "?";
            in "V=%d";
            @replytimeout {
                out "?";
                in "V=%d";
            }
        }
    "#;
    let bus = Arc::new(MockBus::new());
    // No reply queued for the first `in`, so it times out; queue the reply
    // the retry inside @replytimeout will consume.
    bus.queue_reply(b"V=7\r\n".to_vec());

    let mut session = new_session(src, "p", bus.clone(), InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::Success);
    assert_eq!(bus.writes(), vec![b"?".to_vec(), b"?".to_vec()]);
}

/// A reply that never arrives at all, with no handler declared, reports
/// `ReplyTimeout` straight through.
#[tokio::test]
async fn reply_timeout_with_no_handler_is_reported() {
    let src = r#"
        p {
            replytimeout = 20;
            out "?";
            in "V=%d";
        }
    "#;
    let bus = Arc::new(MockBus::new());

    let mut session = new_session(src, "p", bus, InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::ReplyTimeout);
}

/// Scenario 3: a packed-BCD field (`%4D`, spec.md §8's worked example) scans
/// a 4-byte wide field, not a 1-byte one, and round trips through the
/// record bridge.
#[tokio::test]
async fn scenario_packed_bcd_scan() {
    let src = r#"
        p {
            terminator = "\r\n";
            out "?";
            in "%4D";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    // BCD encoding of 1234 packed into 4 bytes, msb-first: 00 00 12 34.
    let mut reply = vec![0x00u8, 0x00, 0x12, 0x34];
    reply.extend_from_slice(b"\r\n");
    bus.queue_reply(reply);

    let mut session = new_session(src, "p", bus, InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::Success);
}

/// Scenario 4: bytes the device sends before any `in` is even issued are
/// picked up as early input instead of being dropped, in both normal and
/// async mode.
#[tokio::test]
async fn scenario_async_mode_consumes_early_input() {
    let src = r#"
        p {
            terminator = "\r\n";
            in "READY";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_early_input(b"READY\r\n".to_vec());

    let mut session = new_session(src, "p", bus, InMemoryBridge::new(), Mode::Async);
    let status = session.run().await;

    assert_eq!(status, Status::Success);
    assert_eq!(session.last_input().as_slice(), b"READY");
}

/// Scenario 5: two sessions contending for the same channel are served in
/// priority order, not arrival order.
#[tokio::test]
async fn scenario_lock_arbitration_honors_priority() {
    let src = r#"
        p {
            terminator = "\r\n";
            out "Q";
            in "A";
        }
    "#;
    let compiled = Arc::new(compiler::compile("p.proto", src, "p").unwrap());
    let arbiter = Arc::new(Arbiter::new());
    let bus_low = Arc::new(MockBus::new());
    bus_low.queue_reply(b"A\r\n".to_vec());
    let bus_high = Arc::new(MockBus::new());
    bus_high.queue_reply(b"A\r\n".to_vec());

    // Occupy the channel first so both sessions below must queue behind it.
    let gate = arbiter.clone();
    assert_eq!(gate.acquire("shared", 999, 0, 1000).await, streamcore::error::BusStatus::Success);

    // Queues behind the gate holder at priority 50; arrives first.
    let mut low = Session::new(
        compiled.clone(),
        "shared",
        50,
        Mode::Normal,
        bus_low,
        arbiter.clone(),
        Box::new(InMemoryBridge::new()),
        None,
        Arc::new(ConverterRegistry::with_builtins()),
    );
    // Queues behind the gate holder at priority 100; arrives second, but
    // its higher priority should still let it run first once the gate
    // releases (spec.md §4.H: priority-ordered, not arrival-ordered).
    let mut high = Session::new(
        compiled,
        "shared",
        100,
        Mode::Normal,
        bus_high,
        arbiter.clone(),
        Box::new(InMemoryBridge::new()),
        None,
        Arc::new(ConverterRegistry::with_builtins()),
    );

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_low = order.clone();
    let low_task = tokio::spawn(async move {
        let status = low.run().await;
        order_low.lock().unwrap().push("low");
        status
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let order_high = order.clone();
    let high_task = tokio::spawn(async move {
        let status = high.run().await;
        order_high.lock().unwrap().push("high");
        status
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    arbiter.release("shared", 999);

    let (low_status, high_status) = tokio::join!(low_task, high_task);
    assert_eq!(low_status.unwrap(), Status::Success);
    assert_eq!(high_status.unwrap(), Status::Success);
    assert_eq!(order.lock().unwrap().as_slice(), &["high", "low"]);
}

/// Scenario 6: a leading-space separator skips arbitrary whitespace before
/// matching its literal remainder, so multi-value replies with inconsistent
/// padding still scan.
#[tokio::test]
async fn scenario_separator_skips_whitespace_before_literal() {
    let src = r#"
        p {
            terminator = "\r\n";
            separator = " ,";
            out "?";
            in "%d%d";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_reply(b"1   ,2\r\n".to_vec());

    let mut session = new_session(src, "p", bus, InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::Success);
}

/// A mismatch with no `@mismatch` handler is reported as `ScanError`, and
/// the bridge never sees a value for the field that failed to scan.
#[tokio::test]
async fn scan_mismatch_with_no_handler_reports_scan_error() {
    let src = r#"
        p {
            terminator = "\r\n";
            out "?";
            in "OK";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_reply(b"NO\r\n".to_vec());

    let mut session = new_session(src, "p", bus, InMemoryBridge::new(), Mode::Normal);
    let status = session.run().await;

    assert_eq!(status, Status::ScanError);
}

/// A [`RecordBridge`] that shares its values with the test through an
/// `Arc<Mutex<_>>`, so a value a session writes is still observable after
/// the session (which owns the `Box<dyn RecordBridge>`) has dropped.
#[derive(Clone, Default)]
struct SharedBridge(std::sync::Arc<std::sync::Mutex<std::collections::HashMap<String, Value>>>);

impl RecordBridge for SharedBridge {
    fn get_field_address(&self, path: &str) -> streamcore::error::Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }
    fn format_value(&mut self, field: &FormatField, _format: &StreamFormat) -> streamcore::error::Result<Value> {
        Ok(self.0.lock().unwrap().get(&field.path).cloned().unwrap_or(Value::Signed(0)))
    }
    fn match_value(&mut self, field: &FormatField, _format: &StreamFormat, value: Value) -> ReadOutcome {
        self.0.lock().unwrap().insert(field.path.clone(), value);
        ReadOutcome::Convert
    }
}

/// Values scanned from a reply actually reach the record bridge: this is
/// the full loop the field-binding compiler fix makes possible, from
/// compiled `%d` token through to `RecordBridge::match_value`.
#[tokio::test]
async fn scanned_value_reaches_the_record_bridge() {
    let src = r#"
        p {
            terminator = "\r\n";
            out "?";
            in "V=%d(setpoint)";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_reply(b"V=42\r\n".to_vec());

    let bridge = SharedBridge::default();
    let compiled = Arc::new(compiler::compile("p.proto", src, "p").unwrap());
    let mut session = Session::new(
        compiled,
        "ch",
        0,
        Mode::Normal,
        bus,
        Arc::new(Arbiter::new()),
        Box::new(bridge.clone()),
        None,
        Arc::new(ConverterRegistry::with_builtins()),
    );
    let status = session.run().await;
    assert_eq!(status, Status::Success);
    assert_eq!(bridge.0.lock().unwrap().get("setpoint"), Some(&Value::Signed(42)));
}

/// A bare `%d` (no explicit field path) binds to the session's own channel
/// value, round tripping a field named after [`streamcore::protocol::DEFAULT_FIELD_PATH`].
#[tokio::test]
async fn bare_conversion_round_trips_through_default_field() {
    let src = r#"
        p {
            terminator = "\r\n";
            out "?";
            in "V=%d";
        }
    "#;
    let bus = Arc::new(MockBus::new());
    bus.queue_reply(b"V=99\r\n".to_vec());

    let bridge = SharedBridge::default();
    let compiled = Arc::new(compiler::compile("p.proto", src, "p").unwrap());
    let mut session = Session::new(
        compiled,
        "ch",
        0,
        Mode::Normal,
        bus,
        Arc::new(Arbiter::new()),
        Box::new(bridge.clone()),
        None,
        Arc::new(ConverterRegistry::with_builtins()),
    );
    let status = session.run().await;
    assert_eq!(status, Status::Success);
    assert_eq!(
        bridge.0.lock().unwrap().get(streamcore::protocol::DEFAULT_FIELD_PATH),
        Some(&Value::Signed(99))
    );
}
