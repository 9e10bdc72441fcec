//! Physical Connection
//!
//! One exclusively owned byte stream to an endpoint, driven by two tasks:
//!
//! ```text
//!            bridge pending queue
//!                     │
//!                     │ next_batch(byte budget)
//!                     ▼
//!   ┌──────────────────────────────────┐
//!   │          RequestWriter           │
//!   │  push to FIFO ─> encode ─> flush │────────> stream
//!   └──────────────────────────────────┘            │
//!                     │                             │
//!                     ▼                             ▼
//!           ┌──────────────────┐      ┌──────────────────────────┐
//!           │ outstanding FIFO │<─────│       ReplyReader        │
//!           └──────────────────┘ head │ read ─> parse ─> match   │
//!                                     └──────────────────────────┘
//!                                                   │
//!                                                   ▼
//!                                         owner.reply_received()
//! ```
//!
//! The writer pushes a message to the FIFO before its bytes are written and
//! never reorders a batch; the reader matches each parsed reply to the FIFO
//! head. Any I/O or protocol error ends both tasks and is reported to the
//! owner exactly once via `connection_failed`.

use crate::connection::handshake::Negotiated;
use crate::connection::outstanding::OutstandingQueue;
use crate::connection::stream::{BoxedStream, ConnectionPurpose};
use crate::endpoint::EndpointAddr;
use crate::error::MuxError;
use crate::message::{Message, MessageKind};
use crate::protocol::{Command, ParseError, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Initial read/write buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// The side of a connection that feeds it and hears back from it.
///
/// Implemented by the bridge; kept as a trait so a connection can be driven
/// on its own in tests.
pub trait ConnectionOwner: Send + Sync + 'static {
    /// Notified whenever new work may be available.
    fn work_signal(&self) -> &Notify;

    /// Removes queued messages, oldest first, up to roughly `byte_budget`
    /// encoded bytes. Always yields at least one message when any is queued.
    fn next_batch(&self, byte_budget: usize) -> Vec<Arc<Message>>;

    /// Puts unsent messages back at the front of the queue, order preserved.
    fn requeue(&self, messages: Vec<Arc<Message>>);

    /// A reply (or, for subscribe-family commands, all of them) for
    /// `message`, read from the connection with this id.
    fn reply_received(&self, connection_id: u64, message: Arc<Message>, reply: RespValue);

    /// An unsolicited frame on a subscription connection.
    fn push_received(&self, value: RespValue);

    /// The connection with this id is unusable. Called at most once per
    /// failing task; the owner ignores stale ids.
    fn connection_failed(&self, connection_id: u64, cause: MuxError);
}

/// Per-bridge traffic statistics, kept across reconnects.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Connections attached over the bridge's lifetime
    pub connections_opened: AtomicU64,
    /// Messages written to a stream
    pub messages_written: AtomicU64,
    /// Replies matched to a message
    pub replies_received: AtomicU64,
    /// Push frames delivered to subscribers
    pub pushes_received: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_written(&self, count: usize) {
        self.messages_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_received(&self) {
        self.pushes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Knobs the writer needs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Upper bound on the bytes coalesced into one flush
    pub write_budget: usize,
    /// Database a message targets when it names none
    pub default_database: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            write_budget: 64 * 1024,
            default_database: 0,
        }
    }
}

/// Why a connection task stopped.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed reply
    #[error("{0}")]
    ParseError(#[from] ParseError),

    /// Server closed the stream between replies
    #[error("stream closed by server")]
    ServerClosed,

    /// Server closed the stream mid-reply
    #[error("stream closed inside a reply")]
    UnexpectedEof,

    /// A reply arrived with nothing outstanding
    #[error("unsolicited {0} reply")]
    UnsolicitedReply(&'static str),
}

/// State shared by the connection handle and its two tasks.
struct ConnectionCore {
    id: u64,
    endpoint: EndpointAddr,
    purpose: ConnectionPurpose,
    negotiated: Negotiated,
    fifo: OutstandingQueue,
    last_activity: Mutex<Instant>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionCore {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn to_mux_error(&self, error: ConnectionError) -> MuxError {
        match error {
            ConnectionError::ParseError(e) => MuxError::from(e),
            ConnectionError::UnsolicitedReply(kind) => {
                MuxError::Protocol(format!("unsolicited {} reply", kind))
            }
            other => MuxError::ConnectionLost {
                endpoint: self.endpoint.to_string(),
                purpose: self.purpose,
                reason: other.to_string(),
            },
        }
    }
}

/// A live stream plus its reader and writer tasks.
///
/// Dropping or closing the connection aborts both tasks, which closes the
/// stream. Outstanding messages are not touched; draining them is the
/// owner's job.
pub struct PhysicalConnection {
    core: Arc<ConnectionCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.core.id)
            .field("endpoint", &self.core.endpoint)
            .field("purpose", &self.core.purpose)
            .field("outstanding", &self.core.fifo.len())
            .finish()
    }
}

impl PhysicalConnection {
    /// Takes ownership of a handshaken stream and starts its tasks.
    ///
    /// `leftover` holds any bytes read past the handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        id: u64,
        endpoint: EndpointAddr,
        purpose: ConnectionPurpose,
        stream: BoxedStream,
        leftover: BytesMut,
        negotiated: Negotiated,
        settings: ConnectionSettings,
        stats: Arc<ConnectionStats>,
        owner: Arc<dyn ConnectionOwner>,
    ) -> Arc<Self> {
        stats.connection_opened();
        let core = Arc::new(ConnectionCore {
            id,
            endpoint,
            purpose,
            negotiated,
            fifo: OutstandingQueue::new(),
            last_activity: Mutex::new(Instant::now()),
            stats,
        });

        let (read_half, write_half) = tokio::io::split(stream);

        let reader = ReplyReader {
            core: Arc::clone(&core),
            stream: read_half,
            buffer: leftover,
            parser: RespParser::new(),
            partial: Vec::new(),
            owner: Arc::clone(&owner),
        };
        let writer = RequestWriter {
            core: Arc::clone(&core),
            stream: write_half,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            selected_database: 0,
            settings,
            owner,
        };

        let tasks = vec![tokio::spawn(reader.run()), tokio::spawn(writer.run())];

        info!(
            endpoint = %core.endpoint,
            purpose = %core.purpose,
            connection = id,
            "Connection attached"
        );

        Arc::new(Self {
            core,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn endpoint(&self) -> &EndpointAddr {
        &self.core.endpoint
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.core.purpose
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.core.negotiated
    }

    /// Number of messages written and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.core.fifo.len()
    }

    pub(crate) fn fifo(&self) -> &OutstandingQueue {
        &self.core.fifo
    }

    pub fn last_activity(&self) -> Instant {
        *self.core.last_activity.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Closes the FIFO and returns what was still outstanding.
    pub(crate) fn drain(&self) -> Vec<Arc<Message>> {
        self.core.fifo.close_and_drain()
    }

    /// Stops both tasks, closing the stream.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for PhysicalConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drains the owner's pending queue onto the stream.
struct RequestWriter {
    core: Arc<ConnectionCore>,
    stream: WriteHalf<BoxedStream>,
    buffer: BytesMut,
    /// Database the server has selected for this connection
    selected_database: u32,
    settings: ConnectionSettings,
    owner: Arc<dyn ConnectionOwner>,
}

impl RequestWriter {
    async fn run(mut self) {
        if let Err(e) = self.main_loop().await {
            warn!(
                endpoint = %self.core.endpoint,
                purpose = %self.core.purpose,
                error = %e,
                "Write failed"
            );
            let cause = self.core.to_mux_error(e);
            self.owner.connection_failed(self.core.id, cause);
        }
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let owner = Arc::clone(&self.owner);
        loop {
            let notified = owner.work_signal().notified();
            tokio::pin!(notified);
            // Register before draining so an enqueue in between is not missed.
            notified.as_mut().enable();

            let batch = owner.next_batch(self.settings.write_budget);
            if batch.is_empty() {
                notified.await;
                continue;
            }

            let Some(written) = self.frame_batch(batch) else {
                // FIFO closed under us: the connection is being torn down.
                return Ok(());
            };
            if self.buffer.is_empty() {
                continue;
            }

            self.stream.write_all(&self.buffer).await?;
            self.stream.flush().await?;

            for message in &written {
                message.mark_flushed();
            }
            self.core.stats.messages_written(written.len());
            self.core.stats.bytes_written(self.buffer.len());
            self.core.touch();
            trace!(
                endpoint = %self.core.endpoint,
                messages = written.len(),
                bytes = self.buffer.len(),
                "Flushed batch"
            );
        }
    }

    /// Encodes a batch into the write buffer, pushing each message to the
    /// FIFO first. Returns `None` if the FIFO closed; the unwritten rest of
    /// the batch has then been handed back to the owner.
    fn frame_batch(&mut self, batch: Vec<Arc<Message>>) -> Option<Vec<Arc<Message>>> {
        self.buffer.clear();
        let mut written = Vec::with_capacity(batch.len());
        let mut batch = batch.into_iter();

        while let Some(message) = batch.next() {
            // Failed while queued (timeout, grace expiry): never written.
            if message.is_terminal() {
                continue;
            }

            let select = self.select_for(&message);
            for next in select.into_iter().chain(std::iter::once(Arc::clone(&message))) {
                if self.core.fifo.push(Arc::clone(&next)).is_err() {
                    // Whether the SELECT or the message itself bounced, the
                    // message was not written and goes back first.
                    let mut unsent = vec![message];
                    unsent.extend(batch);
                    self.owner.requeue(unsent);
                    return None;
                }
                next.mark_sent(Instant::now());
                next.command().encode_into(&mut self.buffer);
                written.push(next);
            }
        }
        Some(written)
    }

    /// Builds the `SELECT` that must precede `message`, if any.
    fn select_for(&mut self, message: &Message) -> Option<Arc<Message>> {
        if self.core.purpose != ConnectionPurpose::Interactive || message.kind() != MessageKind::User {
            return None;
        }
        let target = message
            .command()
            .database()
            .unwrap_or(self.settings.default_database);
        if target == self.selected_database {
            return None;
        }

        debug!(
            endpoint = %self.core.endpoint,
            from = self.selected_database,
            to = target,
            "Switching database"
        );
        self.selected_database = target;
        let select = Message::internal(
            MessageKind::Select,
            Command::new("SELECT").arg(target.to_string()),
            message.timeout(),
        );
        select.assign_endpoint(self.core.endpoint.as_str());
        Some(Arc::new(select))
    }
}

/// Parses replies and matches them to the FIFO head.
struct ReplyReader {
    core: Arc<ConnectionCore>,
    stream: ReadHalf<BoxedStream>,
    buffer: BytesMut,
    parser: RespParser,
    /// Replies collected so far for a multi-reply command at the FIFO head
    partial: Vec<RespValue>,
    owner: Arc<dyn ConnectionOwner>,
}

impl ReplyReader {
    async fn run(mut self) {
        let error = match self.main_loop().await {
            Ok(never) => match never {},
            Err(e) => e,
        };

        match &error {
            ConnectionError::ServerClosed => {
                info!(endpoint = %self.core.endpoint, purpose = %self.core.purpose, "Server closed connection")
            }
            ConnectionError::IoError(io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                info!(endpoint = %self.core.endpoint, purpose = %self.core.purpose, "Connection reset by server")
            }
            _ => warn!(
                endpoint = %self.core.endpoint,
                purpose = %self.core.purpose,
                error = %error,
                "Connection error"
            ),
        }

        let cause = self.core.to_mux_error(error);
        self.owner.connection_failed(self.core.id, cause);
    }

    async fn main_loop(&mut self) -> Result<std::convert::Infallible, ConnectionError> {
        loop {
            while let Some(reply) = self.try_parse_reply()? {
                self.dispatch(reply)?;
            }
            self.read_more_data().await?;
        }
    }

    fn try_parse_reply(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer)? {
            Some((value, consumed)) => {
                self.buffer.advance(consumed);
                trace!(
                    endpoint = %self.core.endpoint,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed reply"
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(if self.buffer.is_empty() {
                ConnectionError::ServerClosed
            } else {
                ConnectionError::UnexpectedEof
            });
        }

        self.core.stats.bytes_read(n);
        self.core.touch();
        Ok(())
    }

    fn dispatch(&mut self, reply: RespValue) -> Result<(), ConnectionError> {
        let subscription = self.core.purpose == ConnectionPurpose::Subscription;
        if subscription && reply.is_push() {
            self.core.stats.push_received();
            self.owner.push_received(reply);
            return Ok(());
        }

        let head = match self.core.fifo.front() {
            Some(head) => head,
            // Extra unsubscribe confirmations and the like.
            None if subscription => {
                self.core.stats.push_received();
                self.owner.push_received(reply);
                return Ok(());
            }
            None => return Err(ConnectionError::UnsolicitedReply(reply.type_name())),
        };

        let is_error = reply.is_error();
        self.partial.push(reply);
        if self.partial.len() < head.command().expected_replies() && !is_error {
            return Ok(());
        }

        self.core.fifo.pop_front();
        let reply = if is_error || self.partial.len() == 1 {
            // An error ends a multi-reply command early and is what the caller sees.
            self.partial.swap_remove(self.partial.len() - 1)
        } else {
            RespValue::Array(std::mem::take(&mut self.partial))
        };
        self.partial.clear();

        self.core.stats.reply_received();
        self.owner.reply_received(self.core.id, head, reply);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxResult;
    use crate::message::MessageStatus;
    use crate::protocol::ResultShape;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct TestOwner {
        pending: Mutex<VecDeque<Arc<Message>>>,
        signal: Notify,
        pushes: Mutex<Vec<RespValue>>,
        failures: Mutex<Vec<(u64, MuxError)>>,
        failed: Notify,
    }

    impl TestOwner {
        fn submit(&self, command: Command) -> Arc<Message> {
            let message = Arc::new(Message::new(command, ResultShape::Any));
            message.mark_queued();
            self.pending.lock().push_back(Arc::clone(&message));
            self.signal.notify_one();
            message
        }
    }

    impl ConnectionOwner for TestOwner {
        fn work_signal(&self) -> &Notify {
            &self.signal
        }

        fn next_batch(&self, _byte_budget: usize) -> Vec<Arc<Message>> {
            self.pending.lock().drain(..).collect()
        }

        fn requeue(&self, messages: Vec<Arc<Message>>) {
            let mut pending = self.pending.lock();
            for message in messages.into_iter().rev() {
                pending.push_front(message);
            }
        }

        fn reply_received(&self, _connection_id: u64, message: Arc<Message>, reply: RespValue) {
            message.resolve(reply);
        }

        fn push_received(&self, value: RespValue) {
            self.pushes.lock().push(value);
        }

        fn connection_failed(&self, connection_id: u64, cause: MuxError) {
            self.failures.lock().push((connection_id, cause));
            self.failed.notify_one();
        }
    }

    fn start(
        purpose: ConnectionPurpose,
        owner: &Arc<TestOwner>,
    ) -> (Arc<PhysicalConnection>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = PhysicalConnection::start(
            7,
            EndpointAddr::new("node:6379"),
            purpose,
            Box::new(client),
            BytesMut::new(),
            Negotiated::default(),
            ConnectionSettings::default(),
            Arc::new(ConnectionStats::new()),
            Arc::clone(owner) as Arc<dyn ConnectionOwner>,
        );
        (conn, server)
    }

    async fn expect_frames(server: &mut DuplexStream, commands: &[Command]) {
        let expected: Vec<u8> = commands.iter().flat_map(|c| c.to_frame().to_vec()).collect();
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&got), String::from_utf8_lossy(&expected));
    }

    async fn result_of(message: &Message) -> MuxResult<RespValue> {
        tokio::time::timeout(Duration::from_secs(2), message.completion().wait())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replies_complete_in_fifo_order() {
        let owner = Arc::new(TestOwner::default());
        let (conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        let commands: Vec<Command> = ["a", "b", "c"]
            .iter()
            .map(|k| Command::new("GET").key(*k))
            .collect();
        let messages: Vec<_> = commands.iter().map(|c| owner.submit(c.clone())).collect();

        expect_frames(&mut server, &commands).await;
        assert_eq!(conn.outstanding(), 3);
        server.write_all(b"$1\r\nA\r\n$1\r\nB\r\n$1\r\nC\r\n").await.unwrap();

        for (message, want) in messages.iter().zip(["A", "B", "C"]) {
            assert_eq!(result_of(message).await, Ok(RespValue::bulk_string(want)));
        }
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_writer_injects_select_on_database_change() {
        let owner = Arc::new(TestOwner::default());
        let (_conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        let get = Command::new("GET").key("k").with_database(2);
        let message = owner.submit(get.clone());

        expect_frames(&mut server, &[Command::new("SELECT").arg("2"), get]).await;
        server.write_all(b"+OK\r\n$1\r\nv\r\n").await.unwrap();
        assert_eq!(result_of(&message).await, Ok(RespValue::bulk_string("v")));

        // Same database again: no second SELECT.
        let again = Command::new("GET").key("k").with_database(2);
        let second = owner.submit(again.clone());
        expect_frames(&mut server, &[again]).await;
        server.write_all(b"$1\r\nw\r\n").await.unwrap();
        assert_eq!(result_of(&second).await, Ok(RespValue::bulk_string("w")));
    }

    #[tokio::test]
    async fn test_server_close_reports_connection_lost() {
        let owner = Arc::new(TestOwner::default());
        let (conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        let cmd = Command::new("GET").key("k");
        let _message = owner.submit(cmd.clone());
        expect_frames(&mut server, &[cmd]).await;
        drop(server);

        tokio::time::timeout(Duration::from_secs(2), owner.failed.notified())
            .await
            .unwrap();
        let failures = owner.failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 7);
        assert!(matches!(failures[0].1, MuxError::ConnectionLost { .. }));
        // Draining is the owner's job.
        assert_eq!(conn.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_a_protocol_error() {
        let owner = Arc::new(TestOwner::default());
        let (_conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        server.write_all(b"+OK\r\n").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), owner.failed.notified())
            .await
            .unwrap();
        assert!(matches!(owner.failures.lock()[0].1, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_a_protocol_error() {
        let owner = Arc::new(TestOwner::default());
        let (_conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        let cmd = Command::new("PING");
        let _message = owner.submit(cmd.clone());
        expect_frames(&mut server, &[cmd]).await;
        server.write_all(b"@bogus\r\n").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), owner.failed.notified())
            .await
            .unwrap();
        assert!(matches!(owner.failures.lock()[0].1, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_subscription_collects_confirmations_and_pushes() {
        let owner = Arc::new(TestOwner::default());
        let (_conn, mut server) = start(ConnectionPurpose::Subscription, &owner);

        let sub = Command::new("SUBSCRIBE").arg("a").arg("b");
        let message = owner.submit(sub.clone());
        expect_frames(&mut server, &[sub]).await;

        server
            .write_all(
                b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n\
                  *3\r\n$7\r\nmessage\r\n$1\r\na\r\n$2\r\nhi\r\n\
                  *3\r\n$9\r\nsubscribe\r\n$1\r\nb\r\n:2\r\n",
            )
            .await
            .unwrap();

        let reply = result_of(&message).await.unwrap();
        assert_eq!(reply.as_array().map(|a| a.len()), Some(2));

        let pushes = owner.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0].is_push());
    }

    #[tokio::test]
    async fn test_closed_fifo_hands_messages_back() {
        let owner = Arc::new(TestOwner::default());
        let (conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        conn.drain();
        let message = owner.submit(Command::new("GET").key("k"));

        // Nothing is written, the message returns to the queue unsent.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), server.read(&mut buf)).await;
        assert!(read.is_err());
        assert_eq!(owner.pending.lock().len(), 1);
        assert!(!message.is_terminal());
    }

    #[tokio::test]
    async fn test_closed_fifo_hands_back_message_behind_select() {
        let owner = Arc::new(TestOwner::default());
        let (conn, mut server) = start(ConnectionPurpose::Interactive, &owner);

        conn.drain();
        let message = owner.submit(Command::new("GET").key("k").with_database(2));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), server.read(&mut buf)).await;
        assert!(read.is_err());

        // The bounced SELECT is internal; the user message is what returns.
        let pending = owner.pending.lock();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), message.id());
        assert!(!message.is_terminal());
        assert_eq!(message.status(), MessageStatus::Queued);
    }
}
