//! A single node and its reconnect logic.

use crate::bridge::{Bridge, BridgeStatus, PushMessage, SweepOutcome};
use crate::connection::{handshake, ConnectionPurpose, StreamDecorator, StreamFactory};
use crate::endpoint::backoff::BackoffPolicy;
use crate::endpoint::health::{HealthState, Role, RoleCell, TimeoutCounters};
use crate::endpoint::EndpointAddr;
use crate::error::{MuxError, MuxResult};
use crate::message::Delivery;
use crate::multiplexer::{ConnectionFailedEvent, ConnectionObserver, CounterScope, MultiplexerConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Collaborators and settings shared by every endpoint of a multiplexer.
pub struct EndpointContext {
    pub(crate) config: MultiplexerConfig,
    pub(crate) factory: Arc<dyn StreamFactory>,
    pub(crate) decorator: Option<Arc<dyn StreamDecorator>>,
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    pub(crate) observer: Arc<dyn ConnectionObserver>,
    pub(crate) pushes: broadcast::Sender<PushMessage>,
    pub(crate) runtime: Handle,
    allow_connect: AtomicBool,
    sync_timeouts: AtomicU64,
    async_timeouts: AtomicU64,
}

impl EndpointContext {
    pub(crate) fn new(
        config: MultiplexerConfig,
        factory: Arc<dyn StreamFactory>,
        decorator: Option<Arc<dyn StreamDecorator>>,
        backoff: Arc<dyn BackoffPolicy>,
        observer: Arc<dyn ConnectionObserver>,
        runtime: Handle,
    ) -> Self {
        let (pushes, _) = broadcast::channel(config.push_capacity);
        Self {
            config,
            factory,
            decorator,
            backoff,
            observer,
            pushes,
            runtime,
            allow_connect: AtomicBool::new(true),
            sync_timeouts: AtomicU64::new(0),
            async_timeouts: AtomicU64::new(0),
        }
    }

    pub fn allow_connect(&self) -> bool {
        self.allow_connect.load(Ordering::Acquire)
    }

    pub(crate) fn set_allow_connect(&self, allow: bool) {
        self.allow_connect.store(allow, Ordering::Release);
    }

    pub(crate) fn record_timeout(&self, delivery: Delivery) {
        match delivery {
            Delivery::Blocking => self.sync_timeouts.fetch_add(1, Ordering::Relaxed),
            Delivery::Async => self.async_timeouts.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn sync_timeouts(&self) -> u64 {
        self.sync_timeouts.load(Ordering::Relaxed)
    }

    pub fn async_timeouts(&self) -> u64 {
        self.async_timeouts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub address: EndpointAddr,
    pub role: Role,
    pub health: HealthState,
    pub interactive: BridgeStatus,
    pub subscription: Option<BridgeStatus>,
}

/// One node: its bridges, its role and its reconnect loops.
///
/// Role and health are written only here (handshake results, teardown,
/// reconnect); routing reads them without coordination.
pub struct Endpoint {
    address: EndpointAddr,
    role: RoleCell,
    interactive: Arc<Bridge>,
    subscription: Option<Arc<Bridge>>,
    ctx: Arc<EndpointContext>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("role", &self.role())
            .field("health", &self.health())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(address: EndpointAddr, ctx: Arc<EndpointContext>) -> Arc<Self> {
        Arc::new_cyclic(|owner: &Weak<Endpoint>| {
            let shared = Arc::new(TimeoutCounters::new());
            let counters = || match ctx.config.counter_scope {
                CounterScope::PerBridge => Arc::new(TimeoutCounters::new()),
                CounterScope::Shared => Arc::clone(&shared),
            };

            let interactive = Bridge::new(
                address.clone(),
                ConnectionPurpose::Interactive,
                owner.clone(),
                Arc::clone(&ctx),
                counters(),
            );
            let subscription = ctx.config.enable_subscriptions.then(|| {
                Bridge::new(
                    address.clone(),
                    ConnectionPurpose::Subscription,
                    owner.clone(),
                    Arc::clone(&ctx),
                    counters(),
                )
            });

            Self {
                address,
                role: RoleCell::default(),
                interactive,
                subscription,
                ctx,
                disposed: AtomicBool::new(false),
            }
        })
    }

    pub fn address(&self) -> &EndpointAddr {
        &self.address
    }

    pub fn role(&self) -> Role {
        self.role.get()
    }

    /// Health of the interactive bridge, which is what routing cares about.
    pub fn health(&self) -> HealthState {
        self.interactive.health()
    }

    pub fn bridge(&self, purpose: ConnectionPurpose) -> Option<&Arc<Bridge>> {
        match purpose {
            ConnectionPurpose::Interactive => Some(&self.interactive),
            ConnectionPurpose::Subscription => self.subscription.as_ref(),
        }
    }

    pub fn bridges(&self) -> impl Iterator<Item = &Arc<Bridge>> {
        std::iter::once(&self.interactive).chain(self.subscription.iter())
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.interactive.counters().consecutive()
    }

    pub fn last_heartbeat_latency(&self) -> Option<Duration> {
        self.interactive.last_heartbeat_latency()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Connects every bridge once. Bridges that fail are left to the
    /// reconnect loop; the interactive bridge's error is returned.
    pub(crate) async fn connect(self: &Arc<Self>) -> MuxResult<()> {
        let mut result = Ok(());
        for bridge in self.bridges() {
            if let Err(e) = self.establish(bridge).await {
                if e == MuxError::ConnectionDisposed {
                    return Err(e);
                }
                self.report_failure(bridge.purpose(), &e);
                self.schedule_reconnect(bridge.purpose());
                if bridge.purpose() == ConnectionPurpose::Interactive {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Requests a stream, decorates it, handshakes, and only then attaches.
    async fn establish(&self, bridge: &Arc<Bridge>) -> MuxResult<()> {
        if self.is_disposed() {
            return Err(MuxError::ConnectionDisposed);
        }
        let purpose = bridge.purpose();
        if !self.ctx.allow_connect() {
            bridge.set_disconnected();
            return Err(MuxError::ConnectFailed {
                endpoint: self.address.to_string(),
                reason: "connections are currently not allowed".to_string(),
            });
        }

        bridge.set_connecting();
        debug!(endpoint = %self.address, purpose = %purpose, "Connecting");

        let connect_timeout = self.ctx.config.connect_timeout;
        let stream = match tokio::time::timeout(
            connect_timeout,
            self.ctx.factory.connect(&self.address, purpose),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                bridge.set_disconnected();
                return Err(e);
            }
            Err(_) => {
                bridge.set_disconnected();
                return Err(MuxError::ConnectFailed {
                    endpoint: self.address.to_string(),
                    reason: format!("connect timed out after {:?}", connect_timeout),
                });
            }
        };

        let mut stream = match &self.ctx.decorator {
            Some(decorator) => decorator.decorate(&self.address, purpose, stream),
            None => stream,
        };

        let options = self.ctx.config.handshake_options();
        let (negotiated, leftover) =
            match handshake::perform(&mut stream, &self.address, purpose, &options).await {
                Ok(done) => done,
                Err(e) => {
                    bridge.set_disconnected();
                    return Err(e);
                }
            };

        if purpose == ConnectionPurpose::Interactive && negotiated.role_detected {
            let previous = self.role.get();
            self.role.set(negotiated.role);
            if previous != negotiated.role {
                info!(endpoint = %self.address, role = %negotiated.role, "Role detected");
            }
        }

        let restored = bridge.attach(stream, leftover, negotiated)?;
        if restored {
            info!(endpoint = %self.address, purpose = %purpose, "Connection restored");
            self.ctx.observer.connection_restored(&self.address, purpose);
        }
        Ok(())
    }

    fn report_failure(&self, purpose: ConnectionPurpose, cause: &MuxError) {
        warn!(endpoint = %self.address, purpose = %purpose, reason = %cause, "Connection failed");
        self.ctx.observer.connection_failed(&ConnectionFailedEvent {
            endpoint: self.address.clone(),
            purpose,
            failure: cause.kind(),
            reason: cause.to_string(),
        });
    }

    /// Called by a bridge after it tore down its connection.
    pub(crate) fn bridge_failed(self: &Arc<Self>, purpose: ConnectionPurpose, cause: &MuxError) {
        if self.is_disposed() {
            return;
        }
        self.report_failure(purpose, cause);
        self.schedule_reconnect(purpose);
    }

    /// Called by a bridge whose consecutive-timeout counter hit the
    /// threshold.
    pub(crate) fn timeout_threshold_reached(&self, purpose: ConnectionPurpose, cause: MuxError) {
        match self.ctx.config.counter_scope {
            CounterScope::PerBridge => {
                if let Some(bridge) = self.bridge(purpose) {
                    bridge.fail_connection(None, cause);
                }
            }
            CounterScope::Shared => {
                for bridge in self.bridges() {
                    bridge.fail_connection(None, cause.clone());
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, purpose: ConnectionPurpose) {
        let Some(bridge) = self.bridge(purpose) else {
            return;
        };
        if !bridge.begin_reconnect() {
            return;
        }
        let task = self
            .ctx
            .runtime
            .spawn(reconnect_loop(Arc::downgrade(self), purpose));
        bridge.set_reconnect_task(task);
    }

    /// Tears down every connection as if its stream had failed.
    pub(crate) fn simulate_failure(&self) {
        for bridge in self.bridges() {
            bridge.fail_connection(
                None,
                MuxError::ConnectionLost {
                    endpoint: self.address.to_string(),
                    purpose: bridge.purpose(),
                    reason: "simulated connection failure".to_string(),
                },
            );
        }
    }

    pub(crate) fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut total = SweepOutcome::default();
        for bridge in self.bridges() {
            let outcome = bridge.sweep(now);
            total.timed_out += outcome.timed_out;
            total.expired_held += outcome.expired_held;
            total.torn_down |= outcome.torn_down;
            total.heartbeat |= outcome.heartbeat;
        }
        total
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for bridge in self.bridges() {
            bridge.dispose();
        }
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            address: self.address.clone(),
            role: self.role(),
            health: self.health(),
            interactive: self.interactive.status(),
            subscription: self.subscription.as_ref().map(|b| b.status()),
        }
    }
}

/// Retries a bridge on the backoff schedule until it attaches, the
/// endpoint is disposed, or the endpoint is dropped. Failed attempts do not
/// raise `connection_failed` again.
async fn reconnect_loop(endpoint: Weak<Endpoint>, purpose: ConnectionPurpose) {
    let mut attempt: u32 = 0;
    loop {
        let delay = match endpoint.upgrade() {
            Some(ep) => ep.ctx.backoff.delay(attempt),
            None => return,
        };
        tokio::time::sleep(delay).await;

        let Some(ep) = endpoint.upgrade() else {
            return;
        };
        let Some(bridge) = ep.bridge(purpose).cloned() else {
            return;
        };
        if ep.is_disposed() {
            bridge.end_reconnect();
            return;
        }

        match ep.establish(&bridge).await {
            Ok(()) => return,
            Err(MuxError::ConnectionDisposed) => {
                bridge.end_reconnect();
                return;
            }
            Err(e) => {
                // The teardown that started this loop already raised
                // `connection_failed`; retries only log.
                attempt = attempt.saturating_add(1);
                debug!(
                    endpoint = %ep.address,
                    purpose = %purpose,
                    attempt = attempt,
                    error = %e,
                    "Reconnect attempt failed"
                );
                ep.ctx.observer.trace(
                    &format!("{}/{} reconnect attempt {} failed: {}", ep.address, purpose, attempt, e),
                    "reconnect",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ConstantBackoff;
    use crate::error::ErrorKind;
    use crate::test_support::{eventually, FakeCluster, RecordingObserver};

    fn context(
        cluster: &FakeCluster,
        observer: &Arc<RecordingObserver>,
        config: MultiplexerConfig,
    ) -> Arc<EndpointContext> {
        Arc::new(EndpointContext::new(
            config,
            Arc::new(cluster.clone()),
            None,
            Arc::new(ConstantBackoff(Duration::from_millis(10))),
            Arc::clone(observer) as Arc<dyn ConnectionObserver>,
            Handle::current(),
        ))
    }

    #[tokio::test]
    async fn test_connect_detects_role() {
        let cluster = FakeCluster::new();
        cluster.add_node("replica:6379", "slave");
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(&cluster, &observer, MultiplexerConfig::default());

        let endpoint = Endpoint::new(EndpointAddr::new("replica:6379"), ctx);
        endpoint.connect().await.unwrap();

        assert_eq!(endpoint.role(), Role::Replica);
        assert_eq!(endpoint.health(), HealthState::Connected);
        assert!(endpoint.bridge(ConnectionPurpose::Subscription).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_failed_stream_reconnects_and_restores() {
        let cluster = FakeCluster::new();
        let node = cluster.add_node("primary:6379", "master");
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(
            &cluster,
            &observer,
            MultiplexerConfig::default().with_subscriptions(false),
        );

        let endpoint = Endpoint::new(EndpointAddr::new("primary:6379"), ctx);
        endpoint.connect().await.unwrap();

        node.drop_connections();
        eventually(|| observer.failures().len() == 1).await;
        eventually(|| endpoint.health() == HealthState::Connected).await;
        eventually(|| observer.restored() == 1).await;

        let failure = &observer.failures()[0];
        assert_eq!(failure.failure, ErrorKind::ConnectionLost);
        assert_eq!(failure.purpose, ConnectionPurpose::Interactive);
    }

    #[tokio::test]
    async fn test_refused_connect_keeps_retrying() {
        let cluster = FakeCluster::new();
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(
            &cluster,
            &observer,
            MultiplexerConfig::default().with_subscriptions(false),
        );

        let endpoint = Endpoint::new(EndpointAddr::new("late:6379"), ctx);
        assert!(endpoint.connect().await.is_err());
        assert_eq!(endpoint.health(), HealthState::Disconnected);

        // Node comes up later; the reconnect loop finds it.
        cluster.add_node("late:6379", "master");
        eventually(|| endpoint.health() == HealthState::Connected).await;
        // Only the initial connect failure is an event; retries are not.
        assert_eq!(observer.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_retries_raise_no_further_events() {
        let cluster = FakeCluster::new();
        cluster.add_node("primary:6379", "master");
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(
            &cluster,
            &observer,
            MultiplexerConfig::default().with_subscriptions(false),
        );

        let endpoint = Endpoint::new(EndpointAddr::new("primary:6379"), ctx);
        endpoint.connect().await.unwrap();
        endpoint.ctx.set_allow_connect(false);
        endpoint.simulate_failure();

        // Roughly ten retries at the 10ms backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(endpoint.health(), HealthState::Disconnected);
        assert_eq!(observer.failures().len(), 1);
        assert!(observer.failures()[0].reason.contains("simulated connection failure"));
        endpoint.dispose();
    }

    #[tokio::test]
    async fn test_shared_counters_tear_down_both_bridges() {
        let cluster = FakeCluster::new();
        cluster.add_node("primary:6379", "master");
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(
            &cluster,
            &observer,
            MultiplexerConfig::default().with_counter_scope(CounterScope::Shared),
        );

        let endpoint = Endpoint::new(EndpointAddr::new("primary:6379"), ctx);
        endpoint.connect().await.unwrap();
        endpoint.ctx.set_allow_connect(false);

        endpoint.timeout_threshold_reached(
            ConnectionPurpose::Interactive,
            MuxError::ConnectionLost {
                endpoint: "primary:6379".to_string(),
                purpose: ConnectionPurpose::Interactive,
                reason: "consecutive timeouts threshold reached".to_string(),
            },
        );

        assert!(endpoint.bridges().all(|b| !b.is_connected()));
        let purposes: Vec<_> = observer.failures().iter().map(|e| e.purpose).collect();
        assert_eq!(
            purposes,
            vec![ConnectionPurpose::Interactive, ConnectionPurpose::Subscription]
        );
        endpoint.dispose();
    }

    #[tokio::test]
    async fn test_dispose_stops_reconnecting() {
        let cluster = FakeCluster::new();
        let observer = Arc::new(RecordingObserver::default());
        let ctx = context(
            &cluster,
            &observer,
            MultiplexerConfig::default().with_subscriptions(false),
        );

        let endpoint = Endpoint::new(EndpointAddr::new("gone:6379"), ctx);
        let _ = endpoint.connect().await;
        endpoint.dispose();

        let seen = observer.failures().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cluster.add_node("gone:6379", "master");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(endpoint.health(), HealthState::Disconnected);
        assert_eq!(observer.failures().len(), seen);
    }
}
