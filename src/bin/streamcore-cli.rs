//! Demo CLI: compiles a protocol file and drives it once against the
//! in-memory mock bus, the same spirit as `jpe`'s `src/main.rs` demo
//! against a real CPSC1 controller but with a simulated device standing
//! in for the concrete serial/TCP transport spec.md §1 keeps out of
//! scope. Useful for sanity-checking a protocol file before wiring it to
//! a real bus adapter.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use streamcore::format::Value;
use streamcore::mock::{InMemoryBridge, MockBus};
use streamcore::session::Mode;
use streamcore::{Engine, Status};

/// Compile and run one streamcore protocol against a simulated device.
#[derive(Parser, Debug)]
#[command(name = "streamcore-cli", version, about)]
struct Cli {
    /// Path to the `.proto` file.
    file: PathBuf,

    /// Name of the block within `file` to run.
    entry: String,

    /// Extra directories to search for `file`, on top of
    /// `STREAM_PROTOCOL_PATH` (spec.md §6.4).
    #[arg(long = "proto-path", env = "STREAM_PROTOCOL_PATH", value_delimiter = ':')]
    proto_path: Vec<PathBuf>,

    /// Arbiter priority to request the channel at (spec.md §4.H).
    #[arg(long, default_value_t = 0)]
    priority: i32,

    /// Logical channel name sessions contend for (spec.md glossary "Channel").
    #[arg(long, default_value = "cli")]
    channel: String,

    /// Run in async (polling) mode instead of normal blocking reads.
    #[arg(long)]
    r#async: bool,

    /// Queue a canned reply, including its terminator, for the device to
    /// send back on the first `in` command. May be repeated.
    #[arg(long = "reply")]
    replies: Vec<String>,

    /// Pre-seed a record field as `name=value` (parsed as an integer,
    /// falling back to a string) before running the protocol.
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, Value)>,
}

fn parse_field(s: &str) -> Result<(String, Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {s:?}"))?;
    let value = if let Ok(i) = value.parse::<i64>() {
        Value::Signed(i)
    } else if let Ok(f) = value.parse::<f64>() {
        Value::Double(f)
    } else {
        Value::Bytes(value.as_bytes().to_vec())
    };
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let engine = Engine::new(cli.proto_path);
    let protocol = match engine.load_protocol(&cli.file.to_string_lossy(), &cli.entry) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to compile {}: {e}", cli.file.display());
            return ExitCode::FAILURE;
        }
    };

    let bus = Arc::new(MockBus::new());
    for reply in &cli.replies {
        bus.queue_reply(reply.as_bytes().to_vec());
    }

    let mut bridge = InMemoryBridge::new();
    for (name, value) in cli.fields {
        bridge = bridge.with_value(name, value);
    }

    let mode = if cli.r#async { Mode::Async } else { Mode::Normal };
    let mut session = engine.create_session(
        protocol,
        cli.channel,
        cli.priority,
        mode,
        bus,
        Box::new(bridge),
        None,
    );

    let status = session.run().await;
    println!("{status}");
    println!("wrote: {:?}", String::from_utf8_lossy(session.last_output().as_slice()));
    println!("read:  {:?}", String::from_utf8_lossy(session.last_input().as_slice()));

    match status {
        Status::Success => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
