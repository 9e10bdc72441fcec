//! Bridges
//!
//! A bridge owns the pending queue for one purpose on one endpoint and
//! holds at most one [`PhysicalConnection`](crate::connection::PhysicalConnection)
//! at a time. Connections come and go; the bridge and its queue stay.
//!
//! ```text
//!  submit ──> pending (VecDeque) ──> writer ──> outstanding FIFO ──> reader
//!                 ▲                                   │
//!                 └── unsent requeued on teardown     └── failed on teardown
//! ```

pub mod queue;

pub use queue::{Bridge, BridgeStatus, PushMessage, SweepOutcome};
