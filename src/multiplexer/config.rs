//! Multiplexer configuration.

use crate::connection::{ConnectionSettings, HandshakeOptions};
use crate::endpoint::EndpointAddr;
use std::time::Duration;

/// Whether the interactive and subscription bridges of one endpoint share
/// their timeout counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterScope {
    /// Each bridge counts and tears down on its own.
    #[default]
    PerBridge,
    /// One counter per endpoint; crossing the threshold replaces both
    /// connections.
    Shared,
}

/// Configuration for a [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Nodes to connect to at startup
    pub endpoints: Vec<EndpointAddr>,

    /// Timeout for blocking callers (default: 5s)
    pub sync_timeout: Duration,

    /// Timeout for async callers; falls back to `sync_timeout` when unset
    pub async_timeout: Option<Duration>,

    /// Bound on stream creation plus handshake (default: 5s)
    pub connect_timeout: Duration,

    /// Consecutive timeouts that force a reconnect (default: 10)
    pub timeouts_before_reconnect: u32,

    /// Consecutive timeouts at which a bridge reports `Failing` (default: 3)
    pub failing_warn_threshold: u32,

    /// Interval between timeout sweeps (default: 100ms)
    pub sweep_interval: Duration,

    /// Idle time after which a `PING` is sent; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,

    /// Pending plus outstanding messages per bridge before `QueueFull`
    pub high_water_mark: usize,

    /// How long a disconnected bridge holds new messages (default: zero,
    /// i.e. fail immediately)
    pub disconnected_grace: Duration,

    /// Bytes coalesced into one write (default: 64 KB)
    pub write_budget: usize,

    /// Open a subscription connection per endpoint (default: true)
    pub enable_subscriptions: bool,

    pub counter_scope: CounterScope,

    /// Issue `ROLE` during the handshake (default: true)
    pub detect_role: bool,

    /// Sent with `CLIENT SETNAME` when set
    pub client_name: Option<String>,

    /// Database used by commands that name none (default: 0)
    pub default_database: u32,

    /// Fail `connect()` when no endpoint is reachable (default: true)
    pub abort_on_connect_fail: bool,

    /// Capacity of the pub/sub push channel (default: 1024)
    pub push_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            sync_timeout: Duration::from_secs(5),
            async_timeout: None,
            connect_timeout: Duration::from_secs(5),
            timeouts_before_reconnect: 10,
            failing_warn_threshold: 3,
            sweep_interval: Duration::from_millis(100),
            heartbeat_interval: Some(Duration::from_secs(60)),
            high_water_mark: 100_000,
            disconnected_grace: Duration::ZERO,
            write_budget: 64 * 1024,
            enable_subscriptions: true,
            counter_scope: CounterScope::PerBridge,
            detect_role: true,
            client_name: None,
            default_database: 0,
            abort_on_connect_fail: true,
            push_capacity: 1024,
        }
    }
}

impl MultiplexerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to connect to.
    pub fn with_endpoint(mut self, endpoint: impl Into<EndpointAddr>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeouts_before_reconnect(mut self, threshold: u32) -> Self {
        self.timeouts_before_reconnect = threshold.max(1);
        self
    }

    pub fn with_failing_warn_threshold(mut self, threshold: u32) -> Self {
        self.failing_warn_threshold = threshold.max(1);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_high_water_mark(mut self, limit: usize) -> Self {
        self.high_water_mark = limit.max(1);
        self
    }

    pub fn with_disconnected_grace(mut self, grace: Duration) -> Self {
        self.disconnected_grace = grace;
        self
    }

    pub fn with_write_budget(mut self, bytes: usize) -> Self {
        self.write_budget = bytes.max(1);
        self
    }

    pub fn with_subscriptions(mut self, enabled: bool) -> Self {
        self.enable_subscriptions = enabled;
        self
    }

    pub fn with_counter_scope(mut self, scope: CounterScope) -> Self {
        self.counter_scope = scope;
        self
    }

    pub fn with_role_detection(mut self, enabled: bool) -> Self {
        self.detect_role = enabled;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_default_database(mut self, db: u32) -> Self {
        self.default_database = db;
        self
    }

    pub fn with_abort_on_connect_fail(mut self, abort: bool) -> Self {
        self.abort_on_connect_fail = abort;
        self
    }

    pub fn with_push_capacity(mut self, capacity: usize) -> Self {
        self.push_capacity = capacity.max(1);
        self
    }

    /// Effective async timeout.
    pub fn async_timeout(&self) -> Duration {
        self.async_timeout.unwrap_or(self.sync_timeout)
    }

    pub(crate) fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            client_name: self.client_name.clone(),
            detect_role: self.detect_role,
            timeout: self.connect_timeout,
        }
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            write_budget: self.write_budget,
            default_database: self.default_database,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_timeout_follows_sync_timeout() {
        let config = MultiplexerConfig::new().with_sync_timeout(Duration::from_millis(1000));
        assert_eq!(config.async_timeout(), Duration::from_millis(1000));

        let config = config.with_async_timeout(Duration::from_millis(250));
        assert_eq!(config.async_timeout(), Duration::from_millis(250));
        assert_eq!(config.sync_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_builder_clamps_thresholds() {
        let config = MultiplexerConfig::new()
            .with_endpoint("127.0.0.1:6379")
            .with_timeouts_before_reconnect(0)
            .with_high_water_mark(0);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.timeouts_before_reconnect, 1);
        assert_eq!(config.high_water_mark, 1);
    }

    #[test]
    fn test_defaults() {
        let config = MultiplexerConfig::default();
        assert_eq!(config.disconnected_grace, Duration::ZERO);
        assert_eq!(config.counter_scope, CounterScope::PerBridge);
        assert!(config.enable_subscriptions);
        assert!(config.abort_on_connect_fail);
    }
}
