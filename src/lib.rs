//! # FlashMux - A Connection Multiplexer for Redis-Compatible Servers
//!
//! FlashMux gives application code one logical handle to a single node, a
//! primary/replica group, or a set of nodes picked by a routing oracle,
//! while keeping only one interactive and one subscription connection open
//! per node. Any number of tasks and threads can issue commands at once;
//! they are pipelined onto those few connections without reordering.
//!
//! ## Features
//!
//! - **Pipelining**: Commands queued by concurrent callers are coalesced into
//!   one write per batch and matched to replies in strict FIFO order
//! - **Timeouts**: A background sweeper fails overdue commands and forces a
//!   reconnect after too many consecutive timeouts
//! - **Recovery**: Lost connections are re-established on a backoff schedule;
//!   commands that were never written survive the reconnect
//! - **Blocking or async**: Wait on a thread, `.await` the handle, or attach
//!   a continuation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Multiplexer                                │
//! │                                                                         │
//! │   submit() ──> RoutingOracle ──> Endpoint (one per node)                │
//! │                                    │                                    │
//! │                    ┌───────────────┴───────────────┐                    │
//! │                    ▼                               ▼                    │
//! │          Bridge (interactive)            Bridge (subscription)          │
//! │          pending queue                   pending queue                  │
//! │                    │                               │                    │
//! │                    ▼                               ▼                    │
//! │          PhysicalConnection              PhysicalConnection             │
//! │          writer ─> FIFO ─> reader        writer ─> FIFO ─> reader       │
//! │                                                         │               │
//! │                                              pushes ────┘               │
//! │                                                                         │
//! │   ┌─────────────────────────────────────────────────────────────────┐   │
//! │   │        TimeoutSweeper (Background Tokio Task)                   │   │
//! │   └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashmux::{Command, Multiplexer, MultiplexerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MultiplexerConfig::new().with_endpoint("127.0.0.1:6379");
//!     let mux = Multiplexer::connect(config).await?;
//!
//!     mux.execute(Command::new("SET").key("name").arg("Ariz")).await?;
//!     let name = mux.execute(Command::new("GET").key("name")).await?;
//!     println!("{:?}", name);
//!
//!     println!("{}", mux.status());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP reply parser, reply types and request framing
//! - [`message`]: In-flight commands and completion delivery
//! - [`connection`]: Streams, handshake and the per-connection reader/writer tasks
//! - [`bridge`]: Pending queues that outlive individual connections
//! - [`endpoint`]: Nodes, their health and role, and reconnection
//! - [`multiplexer`]: Routing, configuration, the sweeper and status
//!
//! ## Design Highlights
//!
//! ### Exactly-once completion
//!
//! A command can be finished by its reply, by the sweeper, or by a
//! teardown. Whichever gets there first wins; the others are no-ops.
//!
//! ### Sent commands are never resent
//!
//! On reconnect, commands that were written fail with `ConnectionLost`.
//! Only commands still in the pending queue move to the new connection.

pub mod bridge;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod multiplexer;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use connection::{ConnectionPurpose, LoggingDecorator, StreamFactory, TcpStreamFactory};
pub use endpoint::{EndpointAddr, HealthState, Role};
pub use error::{ErrorKind, MuxError, MuxResult};
pub use message::{Delivery, MessageStatus, ResponseHandle};
pub use multiplexer::{
    ConnectionObserver, CounterScope, Multiplexer, MultiplexerBuilder, MultiplexerConfig, MuxStatus,
};
pub use protocol::{Command, ReadPreference, RespValue, ResultShape};

/// The default port of a Redis-compatible server
pub const DEFAULT_PORT: u16 = 6379;

/// The default host to connect to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashMux
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
