//! Role, health and timeout accounting for endpoints.
//!
//! ```text
//!                 ┌──────────────── failed attempt ─────────────────┐
//!                 ▼                                                 │
//!  Disconnected ──────> Connecting ──────> Connected ─────> Failing │
//!        ▲                                     │   ▲            │   │
//!        │                                     │   └─ reply ────┘   │
//!        └──── fatal I/O / protocol error ─────┴── hard threshold ──┘
//! ```
//!
//! `Failing` is not stored: it is `Connected` with the consecutive-timeout
//! counter at or above the warn threshold.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Replication role reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    Primary,
    Replica,
    #[default]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Replica => f.write_str("replica"),
            Role::Unknown => f.write_str("unknown"),
        }
    }
}

/// Observable health of a bridge or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Disconnected,
    Connecting,
    Connected,
    Failing,
}

impl HealthState {
    /// Whether routing may send traffic here.
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthState::Connected | HealthState::Failing)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Disconnected => f.write_str("Disconnected"),
            HealthState::Connecting => f.write_str("Connecting"),
            HealthState::Connected => f.write_str("Connected"),
            HealthState::Failing => f.write_str("Failing"),
        }
    }
}

/// Stored link state of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

#[derive(Debug)]
pub struct AtomicLinkState(AtomicU8);

impl AtomicLinkState {
    pub fn new(state: LinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> LinkState {
        match self.0.load(Ordering::Acquire) {
            2 => LinkState::Connected,
            1 => LinkState::Connecting,
            _ => LinkState::Disconnected,
        }
    }

    pub fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Consecutive and lifetime timeout counts.
///
/// Shared between the bridges of one endpoint when the counter scope says
/// so; otherwise each bridge owns one.
#[derive(Debug, Default)]
pub struct TimeoutCounters {
    consecutive: AtomicU32,
    total: AtomicU64,
}

impl TimeoutCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a timeout and returns the new consecutive count.
    pub fn record_timeout(&self) -> u32 {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.consecutive.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Any reply, late or not, proves the stream is alive.
    pub fn record_reply(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Role cell read freely by routing.
#[derive(Debug, Default)]
pub struct RoleCell(RwLock<Role>);

impl RoleCell {
    pub fn get(&self) -> Role {
        *self.0.read()
    }

    pub fn set(&self, role: Role) {
        *self.0.write() = role;
    }
}
