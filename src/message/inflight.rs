//! In-flight messages: a single command awaiting its reply, and the handle
//! the caller keeps.

use crate::error::{MuxError, MuxResult};
use crate::message::completion::{Completion, Continuation};
use crate::protocol::{Command, RespValue, ResultShape};
use parking_lot::Mutex;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a message. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    Unsent = 0,
    Queued = 1,
    Sent = 2,
    WaitingForResponse = 3,
    Complete = 4,
    Failed = 5,
}

impl MessageStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MessageStatus::Unsent,
            1 => MessageStatus::Queued,
            2 => MessageStatus::Sent,
            3 => MessageStatus::WaitingForResponse,
            4 => MessageStatus::Complete,
            _ => MessageStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Failed)
    }
}

/// How the caller intends to wait. Selects the sync or async timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    Blocking,
    #[default]
    Async,
}

/// Who created the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Submitted by a caller.
    User,
    /// `SELECT` injected by the writer ahead of a database switch.
    Select,
    /// `PING` injected by the sweep on an idle connection.
    Heartbeat,
}

/// One command in flight.
///
/// Shared as `Arc<Message>` between the caller's [`ResponseHandle`], the
/// bridge's pending queue and the connection's outstanding FIFO. Exactly one
/// of {reply, timeout, teardown} moves it to a terminal status; every later
/// attempt is a no-op.
pub struct Message {
    id: u64,
    command: Command,
    shape: ResultShape,
    delivery: Delivery,
    kind: MessageKind,
    timeout: Duration,
    created_at: Instant,
    sent_at: Mutex<Option<Instant>>,
    status: AtomicU8,
    endpoint: OnceLock<String>,
    completion: Completion,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("command", &self.command.summary())
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Message {
    /// Creates a user message with async delivery and a 5 second timeout.
    pub fn new(command: Command, shape: ResultShape) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            command,
            shape,
            delivery: Delivery::Async,
            kind: MessageKind::User,
            timeout: Duration::from_secs(5),
            created_at: Instant::now(),
            sent_at: Mutex::new(None),
            status: AtomicU8::new(MessageStatus::Unsent as u8),
            endpoint: OnceLock::new(),
            completion: Completion::new(),
        }
    }

    pub(crate) fn internal(kind: MessageKind, command: Command, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            ..Self::new(command, ResultShape::Any)
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.lock()
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The endpoint this message was routed to, once known.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.get().map(String::as_str)
    }

    pub(crate) fn assign_endpoint(&self, endpoint: &str) {
        let _ = self.endpoint.set(endpoint.to_string());
    }

    /// Send time plus timeout; `None` until the message is written.
    pub fn deadline(&self) -> Option<Instant> {
        self.sent_at().map(|sent| sent + self.timeout)
    }

    /// Moves a non-terminal message forward. Never leaves a terminal status.
    fn advance(&self, to: MessageStatus) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if MessageStatus::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }

    pub(crate) fn mark_queued(&self) -> bool {
        self.advance(MessageStatus::Queued)
    }

    /// Records the send time. Called when the message enters the FIFO.
    pub(crate) fn mark_sent(&self, at: Instant) -> bool {
        if self.advance(MessageStatus::Sent) {
            *self.sent_at.lock() = Some(at);
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_flushed(&self) {
        let _ = self.status.compare_exchange(
            MessageStatus::Sent as u8,
            MessageStatus::WaitingForResponse as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The single terminal transition. Returns `false` if another path
    /// already finished this message.
    fn finish(&self, result: MuxResult<RespValue>) -> bool {
        let terminal = if result.is_ok() {
            MessageStatus::Complete
        } else {
            MessageStatus::Failed
        };
        if !self.advance(terminal) {
            return false;
        }
        self.completion.complete(result)
    }

    /// Completes the message from a parsed reply, validating its shape.
    pub(crate) fn resolve(&self, reply: RespValue) -> bool {
        let result = match reply {
            RespValue::Error(msg) => Err(MuxError::Server(msg)),
            value if self.shape.accepts(&value) => Ok(value),
            value => Err(MuxError::UnexpectedReply {
                expected: self.shape,
                actual: value.type_name(),
            }),
        };
        self.finish(result)
    }

    pub(crate) fn fail(&self, error: MuxError) -> bool {
        self.finish(Err(error))
    }

    /// Builds the timeout error for this message.
    pub(crate) fn timeout_error(&self) -> MuxError {
        MuxError::Timeout {
            command: self.command.summary(),
            endpoint: self.endpoint().unwrap_or("unrouted").to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }
}

/// The caller's view of a submitted message.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    message: Arc<Message>,
}

impl ResponseHandle {
    pub(crate) fn new(message: Arc<Message>) -> Self {
        Self { message }
    }

    pub fn id(&self) -> u64 {
        self.message.id()
    }

    pub fn status(&self) -> MessageStatus {
        self.message.status()
    }

    pub fn is_complete(&self) -> bool {
        self.message.completion().is_complete()
    }

    pub fn try_result(&self) -> Option<MuxResult<RespValue>> {
        self.message.completion().peek()
    }

    /// Blocks the current thread until the reply arrives or `timeout`
    /// elapses.
    ///
    /// Must be called from outside the tokio runtime (a plain thread or
    /// `spawn_blocking`). Giving up here does not fail the message; the
    /// sweep remains the authority on timeouts.
    pub fn wait_blocking(&self, timeout: Duration) -> MuxResult<RespValue> {
        self.message
            .completion()
            .wait_blocking(timeout)
            .unwrap_or_else(|| Err(self.message.timeout_error()))
    }

    /// Waits asynchronously for the reply.
    pub async fn wait(&self) -> MuxResult<RespValue> {
        self.message.completion().wait().await
    }

    /// Registers a continuation, invoked exactly once with the result.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&MuxResult<RespValue>) + Send + 'static,
    {
        let continuation: Continuation = Box::new(callback);
        self.message.completion().on_complete(continuation);
    }
}

impl IntoFuture for ResponseHandle {
    type Output = MuxResult<RespValue>;
    type IntoFuture = Pin<Box<dyn Future<Output = MuxResult<RespValue>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.message.completion().wait().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn get_message(shape: ResultShape) -> Arc<Message> {
        Arc::new(Message::new(Command::new("GET").key("k"), shape))
    }

    #[test]
    fn test_status_progression() {
        let msg = get_message(ResultShape::Bulk);
        assert_eq!(msg.status(), MessageStatus::Unsent);
        assert!(msg.mark_queued());
        assert!(msg.mark_sent(Instant::now()));
        msg.mark_flushed();
        assert_eq!(msg.status(), MessageStatus::WaitingForResponse);
        assert!(msg.deadline().is_some());

        assert!(msg.resolve(RespValue::bulk_string("v")));
        assert_eq!(msg.status(), MessageStatus::Complete);

        // Terminal: nothing moves it again.
        assert!(!msg.mark_queued());
        assert!(!msg.fail(MuxError::ConnectionDisposed));
        assert_eq!(msg.status(), MessageStatus::Complete);
    }

    #[test]
    fn test_error_reply_fails_message() {
        let msg = get_message(ResultShape::Any);
        assert!(msg.resolve(RespValue::error("WRONGTYPE bad")));
        assert_eq!(msg.status(), MessageStatus::Failed);
        assert_eq!(
            msg.completion().peek(),
            Some(Err(MuxError::Server("WRONGTYPE bad".to_string())))
        );
    }

    #[test]
    fn test_shape_mismatch_fails_message() {
        let msg = get_message(ResultShape::Integer);
        msg.resolve(RespValue::bulk_string("nope"));
        assert_eq!(
            msg.completion().peek(),
            Some(Err(MuxError::UnexpectedReply {
                expected: ResultShape::Integer,
                actual: "bulk-string",
            }))
        );
    }

    #[test]
    fn test_reply_and_timeout_race_delivers_once() {
        for _ in 0..200 {
            let msg = get_message(ResultShape::Any);
            let calls = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&calls);
            ResponseHandle::new(Arc::clone(&msg)).on_complete(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });

            let a = Arc::clone(&msg);
            let b = Arc::clone(&msg);
            let reply = std::thread::spawn(move || a.resolve(RespValue::ok()));
            let timeout = std::thread::spawn(move || b.fail(b.timeout_error()));
            let wins = [reply.join().unwrap(), timeout.join().unwrap()];

            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_wait_blocking_reports_timeout() {
        let msg = get_message(ResultShape::Any);
        msg.assign_endpoint("127.0.0.1:6379");
        let handle = ResponseHandle::new(Arc::clone(&msg));
        let err = handle.wait_blocking(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, MuxError::Timeout { ref endpoint, .. } if endpoint == "127.0.0.1:6379"));
        // A local give-up does not terminate the message.
        assert!(!msg.is_terminal());
    }

    #[tokio::test]
    async fn test_handle_is_awaitable() {
        let msg = get_message(ResultShape::Any);
        let handle = ResponseHandle::new(Arc::clone(&msg));
        msg.resolve(RespValue::integer(3));
        assert_eq!(handle.await, Ok(RespValue::integer(3)));
    }
}
