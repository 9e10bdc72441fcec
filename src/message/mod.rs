//! Messages and Completion Delivery
//!
//! A [`Message`] is one command in flight. It is created at submission,
//! travels through a bridge's pending queue into a connection's outstanding
//! FIFO, and is finished exactly once by whichever of these happens first:
//!
//! ```text
//!                    ┌──────────── reply parsed ──────────┐
//!                    │                                    ▼
//! Unsent ─> Queued ─> Sent ─> WaitingForResponse ──> Complete / Failed
//!              │                      │                   ▲
//!              │                      ├─ sweep timeout ───┤
//!              └──────────────────────┴─ teardown ────────┘
//! ```
//!
//! The caller keeps a [`ResponseHandle`] and picks how to observe the result:
//! block on it, `.await` it, or attach continuations.

pub mod completion;
pub mod inflight;

pub use completion::{Completion, Continuation};
pub use inflight::{Delivery, Message, MessageKind, MessageStatus, ResponseHandle};
