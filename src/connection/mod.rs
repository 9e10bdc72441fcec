//! Connection Module
//!
//! Everything that touches a single byte stream to a node.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  StreamFactory::connect                     │
//! │           (TCP by default, TLS/auth behind the seam)        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ optional StreamDecorator
//!                        ▼
//!           ┌────────────────────────┐
//!           │       handshake        │  PING, CLIENT SETNAME, ROLE
//!           └────────────┬───────────┘
//!                        │
//!                        │ attach
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PhysicalConnection                         │
//! │                                                             │
//! │  ┌─────────────┐    ┌──────────────────┐   ┌─────────────┐  │
//! │  │ writer task │───>│ outstanding FIFO │<──│ reader task │  │
//! │  └─────────────┘    └──────────────────┘   └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: every queued message is coalesced into one flush
//! - **Positional matching**: replies complete the FIFO head, in order
//! - **Database selection**: `SELECT` is injected when a message targets another database
//! - **Pub/sub**: push frames on subscription connections bypass the FIFO

pub mod handshake;
pub mod outstanding;
pub mod physical;
pub mod stream;

// Re-export commonly used types
pub use handshake::{HandshakeOptions, Negotiated};
pub use physical::{ConnectionOwner, ConnectionSettings, ConnectionStats, PhysicalConnection};
pub use stream::{
    AsyncStream, BoxedStream, ConnectionPurpose, LoggingDecorator, LoggingStream, StreamDecorator,
    StreamFactory, TcpStreamFactory,
};
