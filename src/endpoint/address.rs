//! Endpoint addresses.

use std::fmt;
use std::net::SocketAddr;

/// A node address in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddr(String);

impl EndpointAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EndpointAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl AsRef<str> for EndpointAddr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
