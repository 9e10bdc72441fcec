//! In-memory nodes for tests.
//!
//! A [`FakeNode`] speaks enough RESP to stand in for a server: handshake
//! commands, a few string commands, `CLIENT PAUSE`, and pub/sub. Each
//! connection is a `tokio::io::duplex` pair served by its own task.

use crate::connection::{BoxedStream, ConnectionPurpose, StreamFactory};
use crate::endpoint::{ConstantBackoff, EndpointAddr, EndpointContext};
use crate::error::{MuxError, MuxResult};
use crate::multiplexer::{ConnectionFailedEvent, ConnectionObserver, MultiplexerConfig, NoopObserver};
use crate::protocol::{RespParser, RespValue};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Notify};

/// Polls `condition` until it holds, panicking after two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A context over an empty fake cluster, for driving bridges directly.
pub(crate) fn context(config: MultiplexerConfig) -> Arc<EndpointContext> {
    Arc::new(EndpointContext::new(
        config,
        Arc::new(FakeCluster::new()),
        None,
        Arc::new(ConstantBackoff(Duration::from_millis(10))),
        Arc::new(NoopObserver),
        Handle::current(),
    ))
}

struct NodeState {
    role: &'static str,
    stalled: AtomicBool,
    released: Notify,
    pause_until: Mutex<Option<Instant>>,
    data: Mutex<HashMap<(u32, Bytes), Bytes>>,
    commands: Mutex<Vec<String>>,
    connections: AtomicUsize,
    kill: watch::Sender<u64>,
    published: broadcast::Sender<(Bytes, Bytes)>,
}

/// A scripted server node.
#[derive(Clone)]
pub(crate) struct FakeNode {
    state: Arc<NodeState>,
}

impl FakeNode {
    pub(crate) fn new() -> Self {
        Self::with_role("master")
    }

    /// `role` is what `ROLE` reports; empty makes `ROLE` an unknown command.
    pub(crate) fn with_role(role: &'static str) -> Self {
        let (kill, _) = watch::channel(0);
        let (published, _) = broadcast::channel(256);
        Self {
            state: Arc::new(NodeState {
                role,
                stalled: AtomicBool::new(false),
                released: Notify::new(),
                pause_until: Mutex::new(None),
                data: Mutex::new(HashMap::new()),
                commands: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
                kill,
                published,
            }),
        }
    }

    /// Opens a new connection to this node.
    pub(crate) fn accept_stream(&self) -> BoxedStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(Arc::clone(&self.state), server));
        Box::new(client)
    }

    /// Holds every reply until `resume`.
    pub(crate) fn stall(&self) {
        self.state.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.state.stalled.store(false, Ordering::SeqCst);
        self.state.released.notify_waiters();
    }

    /// Closes every open connection from the server side.
    pub(crate) fn drop_connections(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Names of the commands received, in arrival order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }
}

/// Connection state on the server side.
#[derive(Default)]
struct Session {
    db: u32,
    channels: HashSet<Bytes>,
}

impl NodeState {
    fn execute(&self, args: &[Bytes], session: &mut Session) -> Vec<RespValue> {
        let Some(name) = args.first() else {
            return vec![RespValue::error("ERR empty command")];
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        self.commands.lock().push(name.clone());

        let reply = match name.as_str() {
            "PING" => match args.get(1) {
                Some(msg) => RespValue::bulk_string(msg.clone()),
                None => RespValue::pong(),
            },
            "ECHO" => match args.get(1) {
                Some(msg) => RespValue::bulk_string(msg.clone()),
                None => RespValue::error("ERR wrong number of arguments for 'echo' command"),
            },
            "CLIENT" => {
                let sub = args
                    .get(1)
                    .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
                    .unwrap_or_default();
                if sub == "PAUSE" {
                    let ms = args
                        .get(2)
                        .and_then(|v| std::str::from_utf8(v).ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    *self.pause_until.lock() = Some(Instant::now() + Duration::from_millis(ms));
                }
                RespValue::ok()
            }
            "ROLE" if self.role.is_empty() => RespValue::error("ERR unknown command 'ROLE'"),
            "ROLE" => RespValue::array(vec![
                RespValue::bulk_string(self.role),
                RespValue::integer(0),
                RespValue::array(vec![]),
            ]),
            "SELECT" => {
                match args.get(1).and_then(|v| std::str::from_utf8(v).ok()).and_then(|v| v.parse::<u32>().ok()) {
                    Some(db) if db < 16 => {
                        session.db = db;
                        RespValue::ok()
                    }
                    _ => RespValue::error("ERR DB index is out of range"),
                }
            }
            "SET" if args.len() >= 3 => {
                self.data
                    .lock()
                    .insert((session.db, args[1].clone()), args[2].clone());
                RespValue::ok()
            }
            "GET" if args.len() >= 2 => match self.data.lock().get(&(session.db, args[1].clone())) {
                Some(v) => RespValue::bulk_string(v.clone()),
                None => RespValue::null(),
            },
            "INCR" if args.len() >= 2 => {
                let mut data = self.data.lock();
                let key = (session.db, args[1].clone());
                let current = data
                    .get(&key)
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                data.insert(key, Bytes::from((current + 1).to_string()));
                RespValue::integer(current + 1)
            }
            "SADD" if args.len() >= 3 => RespValue::integer(args.len() as i64 - 2),
            "PUBLISH" if args.len() >= 3 => {
                let receivers = self
                    .published
                    .send((args[1].clone(), args[2].clone()))
                    .unwrap_or(0);
                RespValue::integer(receivers as i64)
            }
            "SUBSCRIBE" => {
                return args[1..]
                    .iter()
                    .map(|channel| {
                        session.channels.insert(channel.clone());
                        confirmation("subscribe", Some(channel.clone()), session.channels.len())
                    })
                    .collect();
            }
            "UNSUBSCRIBE" => {
                let channels: Vec<Bytes> = if args.len() > 1 {
                    args[1..].to_vec()
                } else {
                    session.channels.iter().cloned().collect()
                };
                if channels.is_empty() {
                    return vec![confirmation("unsubscribe", None, 0)];
                }
                return channels
                    .into_iter()
                    .map(|channel| {
                        session.channels.remove(&channel);
                        confirmation("unsubscribe", Some(channel), session.channels.len())
                    })
                    .collect();
            }
            _ => RespValue::error(format!("ERR unknown command '{}'", name)),
        };
        vec![reply]
    }

    /// Resolves once replies may flow.
    async fn released(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pause = *self.pause_until.lock();
            let paused = pause.filter(|until| *until > Instant::now());
            if !self.stalled.load(Ordering::SeqCst) && paused.is_none() {
                return;
            }
            match paused {
                Some(until) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(until.into()) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

fn confirmation(kind: &str, channel: Option<Bytes>, count: usize) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string(kind.to_string()),
        channel.map_or(RespValue::null(), RespValue::bulk_string),
        RespValue::integer(count as i64),
    ])
}

fn command_args(value: RespValue) -> Vec<Bytes> {
    value
        .into_array()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| match v {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        })
        .collect()
}

async fn serve(state: Arc<NodeState>, mut stream: DuplexStream) {
    let mut kill = state.kill.subscribe();
    let mut published = state.published.subscribe();
    let mut parser = RespParser::new();
    let mut buffer = BytesMut::with_capacity(4096);
    let mut session = Session::default();

    loop {
        while let Ok(Some((value, consumed))) = parser.parse(&buffer) {
            buffer.advance(consumed);

            // A pause applies to commands after `CLIENT PAUSE`, not to it.
            tokio::select! {
                _ = state.released() => {}
                _ = kill.changed() => return,
            }
            let replies = state.execute(&command_args(value), &mut session);
            let mut out = Vec::new();
            for reply in replies {
                reply.serialize_into(&mut out);
            }
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }

        tokio::select! {
            read = stream.read_buf(&mut buffer) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            _ = kill.changed() => return,
            msg = published.recv(), if !session.channels.is_empty() => {
                if let Ok((channel, payload)) = msg {
                    if session.channels.contains(&channel) {
                        let frame = RespValue::array(vec![
                            RespValue::bulk_string("message"),
                            RespValue::bulk_string(channel),
                            RespValue::bulk_string(payload),
                        ]);
                        if stream.write_all(&frame.serialize()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// A set of fake nodes addressable by `host:port`, usable as a stream
/// factory.
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    nodes: Arc<Mutex<HashMap<EndpointAddr, FakeNode>>>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_node(&self, addr: &str, role: &'static str) -> FakeNode {
        let node = FakeNode::with_role(role);
        self.nodes.lock().insert(EndpointAddr::new(addr), node.clone());
        node
    }
}

#[async_trait]
impl StreamFactory for FakeCluster {
    async fn connect(
        &self,
        endpoint: &EndpointAddr,
        _purpose: ConnectionPurpose,
    ) -> MuxResult<BoxedStream> {
        let node = self.nodes.lock().get(endpoint).cloned();
        match node {
            Some(node) => Ok(node.accept_stream()),
            None => Err(MuxError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// Observer that remembers what it saw.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    failures: Mutex<Vec<ConnectionFailedEvent>>,
    restored: AtomicUsize,
    timeouts: AtomicUsize,
}

impl RecordingObserver {
    pub(crate) fn failures(&self) -> Vec<ConnectionFailedEvent> {
        self.failures.lock().clone()
    }

    pub(crate) fn restored(&self) -> usize {
        self.restored.load(Ordering::SeqCst)
    }

    pub(crate) fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }
}

impl ConnectionObserver for RecordingObserver {
    fn connection_failed(&self, event: &ConnectionFailedEvent) {
        self.failures.lock().push(event.clone());
    }

    fn connection_restored(&self, _endpoint: &EndpointAddr, _purpose: ConnectionPurpose) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }

    fn message_timeout(&self, _endpoint: &EndpointAddr, _command: &str) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}
