//! Multiplexer
//!
//! The public face of the crate. A [`Multiplexer`] owns every endpoint,
//! routes submitted commands to a bridge, and runs the timeout sweeper.
//!
//! ```text
//!   callers ──submit──> Multiplexer ──route──> Endpoint ──> Bridge ──> connection
//!                            │
//!                            └── TimeoutSweeper (every sweep_interval)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashmux::{Command, Multiplexer, MultiplexerConfig};
//!
//! let config = MultiplexerConfig::new().with_endpoint("127.0.0.1:6379");
//! let mux = Multiplexer::connect(config).await?;
//! mux.execute(Command::new("SET").key("name").arg("Ariz")).await?;
//! ```

pub mod config;
pub mod mux;
pub mod observer;
pub mod routing;
pub mod status;
pub mod sweep;

pub use config::{CounterScope, MultiplexerConfig};
pub use mux::{Multiplexer, MultiplexerBuilder};
pub use observer::{ConnectionFailedEvent, ConnectionObserver, NoopObserver};
pub use routing::{EndpointView, PrimaryReplicaRouter, Route, RoutingOracle};
pub use status::MuxStatus;
pub use sweep::TimeoutSweeper;
