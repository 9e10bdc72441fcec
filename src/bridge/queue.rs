//! The bridge between callers and a single (replaceable) connection.

use crate::connection::{
    BoxedStream, ConnectionOwner, ConnectionPurpose, ConnectionStats, Negotiated,
    PhysicalConnection,
};
use crate::endpoint::health::{AtomicLinkState, LinkState};
use crate::endpoint::{Endpoint, EndpointAddr, EndpointContext, HealthState, TimeoutCounters};
use crate::error::{MuxError, MuxResult};
use crate::message::{Message, MessageKind};
use crate::protocol::{Command, RespValue};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A frame published on a subscription connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub endpoint: EndpointAddr,
    pub value: RespValue,
}

impl PushMessage {
    /// Channel the frame was published on, for `message`/`smessage` and
    /// `pmessage` frames.
    pub fn channel(&self) -> Option<&[u8]> {
        let items = self.value.as_array()?;
        let kind = items.first()?.as_bytes()?;
        let index = if kind.eq_ignore_ascii_case(b"pmessage") { 2 } else { 1 };
        items.get(index)?.as_bytes()
    }

    /// Payload of the frame.
    pub fn payload(&self) -> Option<&[u8]> {
        self.value.as_array()?.last()?.as_bytes()
    }
}

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Messages failed with `Timeout`
    pub timed_out: usize,
    /// Held messages failed with `ConnectionUnavailable`
    pub expired_held: usize,
    /// Whether the timeout threshold forced a teardown
    pub torn_down: bool,
    /// Whether a heartbeat was queued
    pub heartbeat: bool,
}

/// Point-in-time view of one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub purpose: ConnectionPurpose,
    pub health: HealthState,
    pub connection_id: Option<u64>,
    pub pending: usize,
    pub outstanding: usize,
    pub consecutive_timeouts: u32,
    pub total_timeouts: u64,
    pub connections_opened: u64,
    pub messages_written: u64,
    pub replies_received: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub last_heartbeat_latency: Option<Duration>,
}

/// Pending queue plus the current connection of one purpose on one
/// endpoint.
///
/// The pending queue holds messages not yet written. It survives
/// reconnects: unsent messages are re-offered to the next connection in
/// their original order, while written ones fail with the teardown cause.
pub struct Bridge {
    endpoint: EndpointAddr,
    purpose: ConnectionPurpose,
    owner: Weak<Endpoint>,
    ctx: Arc<EndpointContext>,
    counters: Arc<TimeoutCounters>,
    pending: Mutex<VecDeque<Arc<Message>>>,
    connection: Mutex<Option<Arc<PhysicalConnection>>>,
    link: AtomicLinkState,
    disconnected_since: Mutex<Instant>,
    work: Notify,
    next_connection_id: AtomicU64,
    stats: Arc<ConnectionStats>,
    /// Microseconds; zero until the first heartbeat reply
    heartbeat_latency_us: AtomicU64,
    has_failed: AtomicBool,
    disposed: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("endpoint", &self.endpoint)
            .field("purpose", &self.purpose)
            .field("health", &self.health())
            .field("pending", &self.pending_len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Bridge {
    pub(crate) fn new(
        endpoint: EndpointAddr,
        purpose: ConnectionPurpose,
        owner: Weak<Endpoint>,
        ctx: Arc<EndpointContext>,
        counters: Arc<TimeoutCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            purpose,
            owner,
            ctx,
            counters,
            pending: Mutex::new(VecDeque::new()),
            connection: Mutex::new(None),
            link: AtomicLinkState::new(LinkState::Disconnected),
            disconnected_since: Mutex::new(Instant::now()),
            work: Notify::new(),
            next_connection_id: AtomicU64::new(0),
            stats: Arc::new(ConnectionStats::new()),
            heartbeat_latency_us: AtomicU64::new(0),
            has_failed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    pub fn counters(&self) -> &TimeoutCounters {
        &self.counters
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn health(&self) -> HealthState {
        match self.link.get() {
            LinkState::Disconnected => HealthState::Disconnected,
            LinkState::Connecting => HealthState::Connecting,
            LinkState::Connected
                if self.counters.consecutive() >= self.ctx.config.failing_warn_threshold =>
            {
                HealthState::Failing
            }
            LinkState::Connected => HealthState::Connected,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.current_connection().map_or(0, |c| c.outstanding())
    }

    pub fn last_heartbeat_latency(&self) -> Option<Duration> {
        match self.heartbeat_latency_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    fn current_connection(&self) -> Option<Arc<PhysicalConnection>> {
        self.connection.lock().clone()
    }

    fn unavailable(&self, message: &Message, reason: impl Into<String>) -> MuxError {
        MuxError::ConnectionUnavailable {
            command: message.command().summary(),
            reason: format!("{} ({}/{})", reason.into(), self.endpoint, self.purpose),
        }
    }

    fn lost(&self, reason: impl Into<String>) -> MuxError {
        MuxError::ConnectionLost {
            endpoint: self.endpoint.to_string(),
            purpose: self.purpose,
            reason: reason.into(),
        }
    }

    /// Queues a message for the writer.
    ///
    /// On rejection the message is failed with the returned error before
    /// this returns; it is never silently dropped.
    pub fn enqueue(&self, message: Arc<Message>) -> MuxResult<()> {
        message.assign_endpoint(self.endpoint.as_str());

        let rejection = if self.disposed.load(Ordering::Acquire) {
            Some(MuxError::ConnectionDisposed)
        } else if !self.is_connected() && self.ctx.config.disconnected_grace.is_zero() {
            Some(self.unavailable(&message, "no connection is attached"))
        } else {
            None
        };
        if let Some(error) = rejection {
            message.fail(error.clone());
            return Err(error);
        }

        let outstanding = self.outstanding();
        {
            let mut pending = self.pending.lock();
            // `dispose` sets the flag before draining under this lock, so
            // seeing it clear here means the drain has not run yet.
            if self.disposed.load(Ordering::Acquire) {
                drop(pending);
                message.fail(MuxError::ConnectionDisposed);
                return Err(MuxError::ConnectionDisposed);
            }
            let limit = self.ctx.config.high_water_mark;
            if pending.len() + outstanding >= limit {
                drop(pending);
                let error = MuxError::QueueFull {
                    endpoint: self.endpoint.to_string(),
                    limit,
                };
                message.fail(error.clone());
                return Err(error);
            }
            message.mark_queued();
            trace!(endpoint = %self.endpoint, id = message.id(), command = %message.command(), "Queued");
            pending.push_back(message);
        }

        self.work.notify_one();
        Ok(())
    }

    /// Attaches a handshaken stream as the current connection.
    ///
    /// Resets the timeout counters and wakes the writer so held messages go
    /// out. Returns `true` if this restores a bridge that had failed.
    pub(crate) fn attach(
        self: &Arc<Self>,
        stream: BoxedStream,
        leftover: BytesMut,
        negotiated: Negotiated,
    ) -> MuxResult<bool> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionDisposed);
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.reset();
        self.reconnecting.store(false, Ordering::Release);

        let owner: Arc<dyn ConnectionOwner> = Arc::clone(self) as Arc<dyn ConnectionOwner>;
        let connection = PhysicalConnection::start(
            id,
            self.endpoint.clone(),
            self.purpose,
            stream,
            leftover,
            negotiated,
            self.ctx.config.connection_settings(),
            Arc::clone(&self.stats),
            owner,
        );

        let previous = {
            let mut slot = self.connection.lock();
            let previous = slot.replace(connection);
            self.link.set(LinkState::Connected);
            previous
        };
        if let Some(previous) = previous {
            let cause = self.lost("replaced by a new connection");
            for message in previous.drain() {
                message.fail(cause.clone());
            }
            previous.close();
        }

        // Lost a race with dispose: do not leave a live stream behind.
        if self.disposed.load(Ordering::Acquire) {
            self.detach(None);
            return Err(MuxError::ConnectionDisposed);
        }

        self.work.notify_one();
        self.ctx.observer.trace(
            &format!("{}/{} attached connection #{}", self.endpoint, self.purpose, id),
            "connection",
        );
        Ok(self.has_failed.swap(false, Ordering::AcqRel))
    }

    /// Removes the current connection if its id matches (any id when
    /// `None`) and closes its FIFO.
    fn detach(&self, id: Option<u64>) -> Option<(Arc<PhysicalConnection>, Vec<Arc<Message>>)> {
        let connection = {
            let mut slot = self.connection.lock();
            match slot.as_ref() {
                Some(current) if id.map_or(true, |id| id == current.id()) => {}
                _ => return None,
            }
            let connection = slot.take()?;
            self.link.set(LinkState::Disconnected);
            *self.disconnected_since.lock() = Instant::now();
            connection
        };
        let drained = connection.drain();
        connection.close();
        Some((connection, drained))
    }

    /// Tears down the connection with this id (any when `None`), failing
    /// everything outstanding on it with `cause`.
    ///
    /// The owning endpoint is told exactly once per torn-down connection.
    /// Returns `false` if there was nothing to tear down.
    pub(crate) fn fail_connection(&self, id: Option<u64>, cause: MuxError) -> bool {
        let Some((connection, drained)) = self.detach(id) else {
            return false;
        };

        self.has_failed.store(true, Ordering::Release);
        warn!(
            endpoint = %self.endpoint,
            purpose = %self.purpose,
            connection = connection.id(),
            outstanding = drained.len(),
            reason = %cause,
            "Connection torn down"
        );
        for message in drained {
            message.fail(cause.clone());
        }

        if !self.disposed.load(Ordering::Acquire) {
            if let Some(endpoint) = self.owner.upgrade() {
                endpoint.bridge_failed(self.purpose, &cause);
            }
        }
        true
    }

    pub(crate) fn set_connecting(&self) {
        if !self.is_connected() {
            self.link.set(LinkState::Connecting);
        }
    }

    pub(crate) fn set_disconnected(&self) {
        if !self.is_connected() {
            self.link.set(LinkState::Disconnected);
        }
    }

    /// Claims the right to run the reconnect loop.
    pub(crate) fn begin_reconnect(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && !self.reconnecting.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_reconnect_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            if !previous.is_finished() {
                previous.abort();
            }
        }
    }

    pub(crate) fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::Release);
    }

    /// One sweep pass at `now`.
    ///
    /// 1. Prunes the pending queue: held messages past the grace period fail
    ///    with `ConnectionUnavailable`, queued ones past their timeout with
    ///    `Timeout`.
    /// 2. Fails written messages past their deadline with `Timeout`,
    ///    counting each; reaching the threshold tears the connection down.
    /// 3. Queues a heartbeat `PING` on an idle connection.
    pub(crate) fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        if self.disposed.load(Ordering::Acquire) {
            return outcome;
        }
        let connection = self.current_connection();

        let (held, queued) = self.prune_pending(now, connection.is_some());
        outcome.expired_held = held.len();
        for message in held {
            let error = self.unavailable(&message, "held past the disconnected grace period");
            message.fail(error);
        }
        for message in queued {
            if message.fail(message.timeout_error()) {
                outcome.timed_out += 1;
                if self.timed_out(&message) {
                    outcome.torn_down = true;
                    return outcome;
                }
            }
        }

        let Some(connection) = connection else {
            return outcome;
        };

        for message in connection.fifo().expired(now) {
            if !message.fail(message.timeout_error()) {
                continue;
            }
            outcome.timed_out += 1;
            if self.timed_out(&message) {
                outcome.torn_down = true;
                return outcome;
            }
        }

        if let Some(interval) = self.ctx.config.heartbeat_interval {
            outcome.heartbeat = self.maybe_heartbeat(&connection, now, interval);
        }
        outcome
    }

    /// Splits expired entries out of the pending queue.
    fn prune_pending(
        &self,
        now: Instant,
        connected: bool,
    ) -> (Vec<Arc<Message>>, Vec<Arc<Message>>) {
        let grace = self.ctx.config.disconnected_grace;
        let disconnected_since = *self.disconnected_since.lock();
        let mut held = Vec::new();
        let mut queued = Vec::new();

        self.pending.lock().retain(|message| {
            if message.is_terminal() {
                return false;
            }
            if !connected {
                let held_since = message.created_at().max(disconnected_since);
                if now.saturating_duration_since(held_since) >= grace {
                    held.push(Arc::clone(message));
                    return false;
                }
            }
            if now.saturating_duration_since(message.created_at()) >= message.timeout() {
                queued.push(Arc::clone(message));
                return false;
            }
            true
        });
        (held, queued)
    }

    /// Accounts for a message the sweep just timed out. Returns `true` if
    /// the consecutive-timeout threshold tore the connection down.
    fn timed_out(&self, message: &Message) -> bool {
        if message.kind() == MessageKind::User {
            self.ctx.record_timeout(message.delivery());
        }
        self.ctx
            .observer
            .message_timeout(&self.endpoint, &message.command().summary());
        debug!(
            endpoint = %self.endpoint,
            purpose = %self.purpose,
            id = message.id(),
            command = %message.command(),
            timeout_ms = message.timeout().as_millis() as u64,
            "Message timed out"
        );

        let consecutive = self.counters.record_timeout();
        let threshold = self.ctx.config.timeouts_before_reconnect;
        if consecutive < threshold {
            return false;
        }

        let cause = self.lost(format!(
            "consecutive timeouts threshold reached ({}/{})",
            consecutive, threshold
        ));
        match self.owner.upgrade() {
            Some(endpoint) => endpoint.timeout_threshold_reached(self.purpose, cause),
            None => {
                self.fail_connection(None, cause);
            }
        }
        true
    }

    fn maybe_heartbeat(&self, connection: &PhysicalConnection, now: Instant, interval: Duration) -> bool {
        if connection.outstanding() > 0 || connection.idle_for(now) < interval {
            return false;
        }
        let ping = Arc::new(Message::internal(
            MessageKind::Heartbeat,
            Command::new("PING"),
            self.ctx.config.sync_timeout,
        ));
        ping.assign_endpoint(self.endpoint.as_str());
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                return false;
            }
            ping.mark_queued();
            pending.push_back(ping);
        }
        trace!(endpoint = %self.endpoint, purpose = %self.purpose, "Heartbeat queued");
        self.work.notify_one();
        true
    }

    /// Fails everything with `ConnectionDisposed` and closes the stream.
    /// No events are raised and no reconnect follows.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }

        let mut failed = 0;
        if let Some((_, drained)) = self.detach(None) {
            for message in drained {
                failed += usize::from(message.fail(MuxError::ConnectionDisposed));
            }
        }
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        for message in pending {
            failed += usize::from(message.fail(MuxError::ConnectionDisposed));
        }
        self.link.set(LinkState::Disconnected);

        info!(endpoint = %self.endpoint, purpose = %self.purpose, failed = failed, "Bridge disposed");
    }

    pub fn status(&self) -> BridgeStatus {
        let connection = self.current_connection();
        BridgeStatus {
            purpose: self.purpose,
            health: self.health(),
            connection_id: connection.as_ref().map(|c| c.id()),
            pending: self.pending_len(),
            outstanding: connection.as_ref().map_or(0, |c| c.outstanding()),
            consecutive_timeouts: self.counters.consecutive(),
            total_timeouts: self.counters.total(),
            connections_opened: self.stats.connections_opened.load(Ordering::Relaxed),
            messages_written: self.stats.messages_written.load(Ordering::Relaxed),
            replies_received: self.stats.replies_received.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.stats.bytes_read.load(Ordering::Relaxed),
            last_heartbeat_latency: self.last_heartbeat_latency(),
        }
    }
}

impl ConnectionOwner for Bridge {
    fn work_signal(&self) -> &Notify {
        &self.work
    }

    fn next_batch(&self, byte_budget: usize) -> Vec<Arc<Message>> {
        let mut pending = self.pending.lock();
        let mut batch = Vec::new();
        let mut bytes = 0;
        while let Some(next) = pending.front() {
            if next.is_terminal() {
                pending.pop_front();
                continue;
            }
            let len = next.command().encoded_len();
            if !batch.is_empty() && bytes + len > byte_budget {
                break;
            }
            bytes += len;
            if let Some(message) = pending.pop_front() {
                batch.push(message);
            }
        }
        batch
    }

    fn requeue(&self, messages: Vec<Arc<Message>>) {
        let mut pending = self.pending.lock();
        for message in messages.into_iter().rev() {
            pending.push_front(message);
        }
    }

    fn reply_received(&self, connection_id: u64, message: Arc<Message>, reply: RespValue) {
        self.counters.record_reply();

        match message.kind() {
            MessageKind::Heartbeat => {
                if let Some(sent) = message.sent_at() {
                    let latency = sent.elapsed().as_micros().max(1) as u64;
                    self.heartbeat_latency_us.store(latency, Ordering::Relaxed);
                }
            }
            MessageKind::Select => {
                if let RespValue::Error(e) = &reply {
                    // The server stayed on the old database; later commands
                    // on this stream would run against the wrong one.
                    let cause = MuxError::Protocol(format!("SELECT failed: {}", e));
                    self.fail_connection(Some(connection_id), cause);
                }
            }
            MessageKind::User => {}
        }

        let id = message.id();
        if !message.resolve(reply) {
            trace!(endpoint = %self.endpoint, id = id, "Discarded reply for finished message");
        }
    }

    fn push_received(&self, value: RespValue) {
        // No subscribers is not an error.
        let _ = self.ctx.pushes.send(PushMessage {
            endpoint: self.endpoint.clone(),
            value,
        });
    }

    fn connection_failed(&self, connection_id: u64, cause: MuxError) {
        self.fail_connection(Some(connection_id), cause);
    }
}
