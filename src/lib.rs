//! TCP text relay.
//!
//! Clients connect over TCP; every message a client sends is appended to a
//! log sink and rebroadcast to every other connected client.
//!
//! - `server::Relay` owns the listener and the accept loop
//! - `server::registry::Registry` is the set of live connections
//! - `server::session::Session` reads one client's messages and cleans up after it
//! - `server::fanout::Broadcaster` delivers a message to everyone but its sender
//! - `server::frame::FrameReader` turns socket bytes into text messages
//! - `sink` holds the append-only message log
//!
//! ```no_run
//! use chat_relay::{Logger, MemorySink, RelayConfig, run_server, spawn_sink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::default();
//!     let (sink, _writer) = spawn_sink(MemorySink::new(), config.sink_queue_capacity, Logger);
//!     run_server(config, sink, Logger).await?;
//!     Ok(())
//! }
//! ```

// Settings parsed from TOML (listener, framing, timeouts, sink, logger).
pub mod config;

// Error enums for every component.
pub mod error;

// Logging utilities for connection lifecycle and relayed messages.
pub mod logger;

// Accept loop, sessions, registry and fan-out.
pub mod server;

// Append-only message log.
pub mod sink;

pub use config::{Framing, LoggerConfig, OverflowPolicy, RelayConfig, SinkConfig};
pub use error::{ConfigError, FrameError, RegistryError, RelayError, SinkError};
pub use logger::{Logger, init_logger};
pub use server::registry::{ConnId, PeerHandle, Registry};
pub use server::session::SessionEnd;
pub use server::{Relay, run_server};
pub use sink::{DiscardSink, FileSink, LogSink, MemorySink, SinkHandle, spawn_sink};
