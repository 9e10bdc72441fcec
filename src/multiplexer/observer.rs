//! Connection lifecycle events.
//!
//! Observers are called in addition to logging. Every method has a no-op
//! default, so an implementation overrides only what it needs. Methods run
//! on internal tasks and must not block.

use crate::connection::ConnectionPurpose;
use crate::endpoint::EndpointAddr;
use crate::error::ErrorKind;

/// A bridge lost (or failed to establish) its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailedEvent {
    pub endpoint: EndpointAddr,
    pub purpose: ConnectionPurpose,
    pub failure: ErrorKind,
    pub reason: String,
}

pub trait ConnectionObserver: Send + Sync {
    fn connection_failed(&self, _event: &ConnectionFailedEvent) {}

    /// A bridge re-attached after having failed.
    fn connection_restored(&self, _endpoint: &EndpointAddr, _purpose: ConnectionPurpose) {}

    /// A message was failed by the timeout sweep.
    fn message_timeout(&self, _endpoint: &EndpointAddr, _command: &str) {}

    /// Free-form diagnostics.
    fn trace(&self, _message: &str, _category: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
