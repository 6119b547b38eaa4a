//! streamcore: a generic text-protocol driver engine for serial/network
//! attached laboratory and industrial instruments.
//!
//! The engine compiles a declarative per-instrument protocol description
//! (spec.md §6.1) to byte-code (`protocol`), then drives a reliable
//! request/response conversation against a transport (`bus`) on behalf of
//! a record bridge that supplies outgoing values and receives scanned ones
//! (`bridge`). See `DESIGN.md` for how each module is grounded.
//!
//! # Example
//! This drives a one-shot echo protocol against the in-memory mock bus
//! bundled for tests and the `streamcore-cli` demo binary.
//!
//! ```
//! use streamcore::mock::{InMemoryBridge, MockBus};
//! use streamcore::protocol::compiler;
//! use streamcore::session::{Mode, Session};
//! use streamcore::arbiter::Arbiter;
//! use streamcore::format::ConverterRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let compiled = compiler::compile(
//!         "echo.proto",
//!         r#"echo { terminator = "\r\n"; out "HELLO"; in "WORLD"; }"#,
//!         "echo",
//!     ).unwrap();
//!
//!     let bus = Arc::new(MockBus::new());
//!     bus.queue_reply(b"WORLD\r\n".to_vec());
//!
//!     let mut session = Session::new(
//!         Arc::new(compiled),
//!         "demo-channel",
//!         0,
//!         Mode::Normal,
//!         bus,
//!         Arc::new(Arbiter::new()),
//!         Box::new(InMemoryBridge::new()),
//!         None,
//!         Arc::new(ConverterRegistry::with_builtins()),
//!     );
//!     let status = session.run().await;
//!     assert_eq!(status, streamcore::error::Status::Success);
//! }
//! ```

pub mod arbiter;
pub mod bridge;
pub mod buffer;
pub mod bus;
pub mod config;
pub mod error;
pub mod format;
pub mod mock;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod timer;

pub use error::{Error, Result, Status};
pub use registry::Engine;
pub use session::{Mode, Session};
