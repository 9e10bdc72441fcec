//! The outstanding FIFO: messages written to a stream and not yet answered.
//!
//! The writer pushes each message immediately before its bytes go out; the
//! reader pops the head when the matching reply is parsed. Replies carry no
//! identifiers, so position is the only correlation there is.
//!
//! Once a connection is torn down the FIFO is closed: it is drained in one
//! step and refuses further pushes, so a writer racing the teardown gets its
//! message back instead of stranding it.

use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct FifoState {
    items: VecDeque<Arc<Message>>,
    closed: bool,
}

#[derive(Default)]
pub struct OutstandingQueue {
    state: Mutex<FifoState>,
}

impl OutstandingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Hands it back if the queue has been closed.
    pub fn push(&self, message: Arc<Message>) -> Result<(), Arc<Message>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(message);
        }
        state.items.push_back(message);
        Ok(())
    }

    pub fn front(&self) -> Option<Arc<Message>> {
        self.state.lock().items.front().cloned()
    }

    pub fn pop_front(&self) -> Option<Arc<Message>> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closes the queue and returns everything still in it, oldest first.
    pub fn close_and_drain(&self) -> Vec<Arc<Message>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.drain(..).collect()
    }

    /// Non-terminal messages whose deadline has passed, oldest first.
    ///
    /// Expired messages stay in the queue: their reply is still coming and
    /// must be consumed to keep later replies aligned.
    pub fn expired(&self, now: Instant) -> Vec<Arc<Message>> {
        self.state
            .lock()
            .items
            .iter()
            .filter(|m| !m.is_terminal())
            .filter(|m| m.deadline().is_some_and(|d| d <= now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, ResultShape};
    use std::time::Duration;

    fn sent(name: &str, timeout: Duration, at: Instant) -> Arc<Message> {
        let msg = Arc::new(Message::new(Command::new(name), ResultShape::Any).with_timeout(timeout));
        msg.mark_sent(at);
        msg
    }

    #[test]
    fn test_fifo_order() {
        let fifo = OutstandingQueue::new();
        let now = Instant::now();
        let a = sent("A", Duration::from_secs(1), now);
        let b = sent("B", Duration::from_secs(1), now);
        fifo.push(Arc::clone(&a)).unwrap();
        fifo.push(Arc::clone(&b)).unwrap();

        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.front().unwrap().id(), a.id());
        assert_eq!(fifo.pop_front().unwrap().id(), a.id());
        assert_eq!(fifo.pop_front().unwrap().id(), b.id());
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_closed_queue_refuses_pushes() {
        let fifo = OutstandingQueue::new();
        let now = Instant::now();
        fifo.push(sent("A", Duration::from_secs(1), now)).unwrap();

        let drained = fifo.close_and_drain();
        assert_eq!(drained.len(), 1);
        assert!(fifo.is_closed());

        let late = sent("B", Duration::from_secs(1), now);
        let returned = fifo.push(Arc::clone(&late)).unwrap_err();
        assert_eq!(returned.id(), late.id());
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_expired_skips_terminal_and_keeps_entries() {
        let fifo = OutstandingQueue::new();
        let start = Instant::now();
        let short = sent("SHORT", Duration::from_millis(10), start);
        let long = sent("LONG", Duration::from_secs(60), start);
        let done = sent("DONE", Duration::from_millis(10), start);
        done.fail(crate::error::MuxError::ConnectionDisposed);

        for m in [&short, &long, &done] {
            fifo.push(Arc::clone(m)).unwrap();
        }

        let expired = fifo.expired(start + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), short.id());
        assert_eq!(fifo.len(), 3);
    }
}
