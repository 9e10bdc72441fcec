//! Status snapshots.

use crate::endpoint::node::EndpointStatus;
use std::fmt;

/// Point-in-time view of a multiplexer.
///
/// The `Display` form is a one-line diagnostic suitable for error messages
/// and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxStatus {
    pub endpoints: Vec<EndpointStatus>,
    pub submitted: u64,
    pub sync_timeouts: u64,
    pub async_timeouts: u64,
    pub disposed: bool,
}

impl MuxStatus {
    pub fn connected_endpoints(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.health.is_usable())
            .count()
    }

    /// Messages waiting to be written, across every bridge.
    pub fn pending(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| e.interactive.pending + e.subscription.as_ref().map_or(0, |s| s.pending))
            .sum()
    }

    /// Messages written and not yet answered, across every bridge.
    pub fn outstanding(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| {
                e.interactive.outstanding + e.subscription.as_ref().map_or(0, |s| s.outstanding)
            })
            .sum()
    }
}

impl fmt::Display for MuxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoints: {}/{} connected; submitted: {}; pending: {}; outstanding: {}; sync timeouts: {}; async timeouts: {};",
            self.connected_endpoints(),
            self.endpoints.len(),
            self.submitted,
            self.pending(),
            self.outstanding(),
            self.sync_timeouts,
            self.async_timeouts,
        )?;
        if self.disposed {
            f.write_str(" disposed;")?;
        }
        for endpoint in &self.endpoints {
            write!(
                f,
                " [{} {} {}: in {}/{}, timeouts {}",
                endpoint.address,
                endpoint.role,
                endpoint.health,
                endpoint.interactive.pending,
                endpoint.interactive.outstanding,
                endpoint.interactive.consecutive_timeouts,
            )?;
            if let Some(latency) = endpoint.interactive.last_heartbeat_latency {
                write!(f, ", ping {}us", latency.as_micros())?;
            }
            if let Some(sub) = &endpoint.subscription {
                write!(f, "; sub {} {}/{}", sub.health, sub.pending, sub.outstanding)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
