//! The multiplexer: one handle over every endpoint.

use crate::bridge::{Bridge, PushMessage};
use crate::connection::{ConnectionPurpose, StreamDecorator, StreamFactory, TcpStreamFactory};
use crate::endpoint::{BackoffPolicy, Endpoint, EndpointAddr, EndpointContext, ExponentialBackoff, Role};
use crate::error::{MuxError, MuxResult};
use crate::message::{Delivery, Message, ResponseHandle};
use crate::multiplexer::config::MultiplexerConfig;
use crate::multiplexer::observer::{ConnectionObserver, NoopObserver};
use crate::multiplexer::routing::{EndpointView, PrimaryReplicaRouter, RoutingOracle};
use crate::multiplexer::status::MuxStatus;
use crate::multiplexer::sweep::TimeoutSweeper;
use crate::protocol::{Command, ReadPreference, RespValue, ResultShape};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Wires collaborators into a [`Multiplexer`].
///
/// Anything not supplied gets a default: TCP streams, the
/// primary/replica router, exponential backoff and no observer.
pub struct MultiplexerBuilder {
    config: MultiplexerConfig,
    factory: Option<Arc<dyn StreamFactory>>,
    router: Option<Arc<dyn RoutingOracle>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    decorator: Option<Arc<dyn StreamDecorator>>,
    runtime: Option<Handle>,
}

impl MultiplexerBuilder {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            config,
            factory: None,
            router: None,
            backoff: None,
            observer: None,
            decorator: None,
            runtime: None,
        }
    }

    pub fn with_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn RoutingOracle>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Wraps every stream the factory produces.
    pub fn with_decorator(mut self, decorator: Arc<dyn StreamDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    /// Runtime for background tasks; defaults to the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Creates the multiplexer and starts the sweeper without connecting.
    pub fn build(self) -> MuxResult<Multiplexer> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| MuxError::ConnectFailed {
                endpoint: "-".to_string(),
                reason: format!("no tokio runtime available: {}", e),
            })?,
        };
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(TcpStreamFactory::new(self.config.connect_timeout)) as Arc<dyn StreamFactory>
        });
        let ctx = Arc::new(EndpointContext::new(
            self.config,
            factory,
            self.decorator,
            self.backoff.unwrap_or_else(|| {
                Arc::new(ExponentialBackoff::default()) as Arc<dyn BackoffPolicy>
            }),
            self.observer
                .unwrap_or_else(|| Arc::new(NoopObserver) as Arc<dyn ConnectionObserver>),
            runtime.clone(),
        ));

        let mut endpoints: Vec<Arc<Endpoint>> = Vec::new();
        for address in &ctx.config.endpoints {
            if endpoints.iter().any(|e| e.address() == address) {
                continue;
            }
            endpoints.push(Endpoint::new(address.clone(), Arc::clone(&ctx)));
        }
        let endpoints = Arc::new(RwLock::new(endpoints));
        let sweeper =
            TimeoutSweeper::start(Arc::clone(&endpoints), ctx.config.sweep_interval, &runtime);

        Ok(Multiplexer {
            ctx,
            endpoints,
            router: self
                .router
                .unwrap_or_else(|| Arc::new(PrimaryReplicaRouter) as Arc<dyn RoutingOracle>),
            sweeper: Mutex::new(Some(sweeper)),
            replica_cursor: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Builds the multiplexer and connects every endpoint concurrently.
    ///
    /// Endpoints that fail keep retrying in the background. With
    /// `abort_on_connect_fail` set and no endpoint reachable, the
    /// multiplexer is disposed and the first failure is returned.
    pub async fn connect(self) -> MuxResult<Multiplexer> {
        let mux = self.build()?;
        let endpoints = mux.endpoints();

        let mut attempts = JoinSet::new();
        for endpoint in endpoints {
            attempts.spawn_on(
                async move {
                    let result = endpoint.connect().await;
                    (endpoint.address().clone(), result)
                },
                &mux.ctx.runtime,
            );
        }

        let mut connected = 0;
        let mut first_error = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok(()))) => connected += 1,
                Ok((address, Err(e))) => {
                    warn!(endpoint = %address, error = %e, "Initial connect failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(MuxError::ConnectFailed {
                        endpoint: "-".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if connected == 0 && mux.ctx.config.abort_on_connect_fail {
            mux.dispose();
            return Err(first_error.unwrap_or_else(|| MuxError::ConnectFailed {
                endpoint: "-".to_string(),
                reason: "no endpoints are configured".to_string(),
            }));
        }

        info!(
            connected = connected,
            endpoints = mux.endpoints.read().len(),
            "Multiplexer connected"
        );
        Ok(mux)
    }
}

/// One logical handle over a pool of connections.
///
/// Commands from any number of callers are routed to an endpoint, queued
/// on its bridge and pipelined over a single connection per purpose.
/// Dropping the multiplexer disposes it.
pub struct Multiplexer {
    ctx: Arc<EndpointContext>,
    endpoints: Arc<RwLock<Vec<Arc<Endpoint>>>>,
    router: Arc<dyn RoutingOracle>,
    sweeper: Mutex<Option<TimeoutSweeper>>,
    replica_cursor: AtomicUsize,
    submitted: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.endpoints.read().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Multiplexer {
    pub fn builder(config: MultiplexerConfig) -> MultiplexerBuilder {
        MultiplexerBuilder::new(config)
    }

    /// Connects with default collaborators.
    pub async fn connect(config: MultiplexerConfig) -> MuxResult<Self> {
        MultiplexerBuilder::new(config).connect().await
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.ctx.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().clone()
    }

    pub fn endpoint(&self, address: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.address().as_str() == address)
            .cloned()
    }

    /// Submits a command and returns a handle to its result.
    ///
    /// Never blocks. The timeout is the sync or async threshold depending
    /// on `delivery`. Failures to route or enqueue are delivered through
    /// the handle like any other failure.
    pub fn submit(&self, command: Command, shape: ResultShape, delivery: Delivery) -> ResponseHandle {
        let timeout = match delivery {
            Delivery::Blocking => self.ctx.config.sync_timeout,
            Delivery::Async => self.ctx.config.async_timeout(),
        };
        let message = Arc::new(
            Message::new(command, shape)
                .with_delivery(delivery)
                .with_timeout(timeout),
        );
        let handle = ResponseHandle::new(Arc::clone(&message));
        self.submitted.fetch_add(1, Ordering::Relaxed);

        if self.is_disposed() {
            message.fail(MuxError::ConnectionDisposed);
            return handle;
        }

        match self.select_bridge(&message) {
            Ok(bridge) => {
                trace!(
                    id = message.id(),
                    command = %message.command(),
                    endpoint = %bridge.endpoint(),
                    purpose = %bridge.purpose(),
                    "Routed"
                );
                // A rejected message has already been failed by the bridge.
                let _ = bridge.enqueue(message);
            }
            Err(e) => {
                debug!(id = message.id(), command = %message.command(), error = %e, "Unroutable");
                message.fail(e);
            }
        }
        handle
    }

    /// Submits with async delivery and waits for the reply.
    pub async fn execute(&self, command: Command) -> MuxResult<RespValue> {
        self.submit(command, ResultShape::Any, Delivery::Async).wait().await
    }

    /// Submits with blocking delivery and waits up to the sync timeout.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn execute_blocking(&self, command: Command) -> MuxResult<RespValue> {
        self.submit(command, ResultShape::Any, Delivery::Blocking)
            .wait_blocking(self.ctx.config.sync_timeout)
    }

    fn unavailable(&self, command: &Command, reason: impl Into<String>) -> MuxError {
        MuxError::ConnectionUnavailable {
            command: command.summary(),
            reason: reason.into(),
        }
    }

    /// Asks the router for the owning endpoint, then applies the read
    /// preference.
    fn select_bridge(&self, message: &Message) -> MuxResult<Arc<Bridge>> {
        let command = message.command();
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(self.unavailable(command, "no endpoints are configured"));
        }

        let views: Vec<EndpointView> = endpoints
            .iter()
            .map(|e| EndpointView {
                address: e.address().clone(),
                role: e.role(),
                health: e.health(),
            })
            .collect();
        let route = self
            .router
            .route(command, command.routing_key(), &views)
            .ok_or_else(|| self.unavailable(command, "no endpoint is routable"))?;
        let owner = endpoints
            .iter()
            .find(|e| e.address() == &route.endpoint)
            .ok_or_else(|| {
                self.unavailable(command, format!("routed to unknown endpoint {}", route.endpoint))
            })?;

        let allowed = route.replica_read_allowed;
        let target = match command.read_preference() {
            ReadPreference::DemandPrimary => owner,
            ReadPreference::PreferPrimary if owner.health().is_usable() || !allowed => owner,
            ReadPreference::PreferPrimary | ReadPreference::PreferReplica if allowed => {
                self.next_replica(&endpoints).unwrap_or(owner)
            }
            ReadPreference::PreferPrimary | ReadPreference::PreferReplica => owner,
            ReadPreference::DemandReplica if allowed => self
                .next_replica(&endpoints)
                .ok_or_else(|| self.unavailable(command, "no replica is available"))?,
            ReadPreference::DemandReplica => {
                return Err(self.unavailable(command, "replica reads are not allowed"));
            }
        };

        let purpose = command.purpose();
        target
            .bridge(purpose)
            .cloned()
            .ok_or_else(|| match purpose {
                ConnectionPurpose::Subscription => {
                    self.unavailable(command, "subscriptions are disabled")
                }
                ConnectionPurpose::Interactive => {
                    self.unavailable(command, "no interactive bridge")
                }
            })
    }

    /// Round-robins over usable replicas.
    fn next_replica<'a>(&self, endpoints: &'a [Arc<Endpoint>]) -> Option<&'a Arc<Endpoint>> {
        let replicas: Vec<&Arc<Endpoint>> = endpoints
            .iter()
            .filter(|e| e.role() == Role::Replica && e.health().is_usable())
            .collect();
        if replicas.is_empty() {
            return None;
        }
        let index = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % replicas.len();
        Some(replicas[index])
    }

    /// Subscribes to frames published on subscription connections.
    pub fn pushes(&self) -> broadcast::Receiver<PushMessage> {
        self.ctx.pushes.subscribe()
    }

    /// Adds an endpoint at runtime and connects it.
    ///
    /// The endpoint stays in the pool (and keeps retrying) even if this
    /// first attempt fails.
    pub async fn add_endpoint(&self, address: impl Into<EndpointAddr>) -> MuxResult<Arc<Endpoint>> {
        if self.is_disposed() {
            return Err(MuxError::ConnectionDisposed);
        }
        let address = address.into();
        let endpoint = {
            let mut endpoints = self.endpoints.write();
            if let Some(existing) = endpoints.iter().find(|e| e.address() == &address) {
                return Ok(Arc::clone(existing));
            }
            let endpoint = Endpoint::new(address, Arc::clone(&self.ctx));
            endpoints.push(Arc::clone(&endpoint));
            endpoint
        };
        info!(endpoint = %endpoint.address(), "Endpoint added");
        endpoint.connect().await?;
        Ok(endpoint)
    }

    /// While `false`, connection attempts fail with `ConnectFailed`.
    pub fn set_allow_connect(&self, allow: bool) {
        self.ctx.set_allow_connect(allow);
    }

    /// Tears down an endpoint's connections as if the stream had failed.
    /// Returns `false` for an unknown endpoint.
    pub fn simulate_connection_failure(&self, address: &str) -> bool {
        match self.endpoint(address) {
            Some(endpoint) => {
                warn!(endpoint = %address, "Simulating connection failure");
                endpoint.simulate_failure();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> MuxStatus {
        MuxStatus {
            endpoints: self.endpoints().iter().map(|e| e.status()).collect(),
            submitted: self.submitted.load(Ordering::Relaxed),
            sync_timeouts: self.ctx.sync_timeouts(),
            async_timeouts: self.ctx.async_timeouts(),
            disposed: self.is_disposed(),
        }
    }

    /// Stops the sweeper and every reconnect loop, fails all queued and
    /// outstanding messages with `ConnectionDisposed`, and closes every
    /// connection. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        for endpoint in self.endpoints() {
            endpoint.dispose();
        }
        info!("Multiplexer disposed");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.dispose();
    }
}
