//! Inbound message buffer implementing the pull protocol.
//!
//! The buffer holds either unconsumed messages or pending waiters, never both:
//! an arriving message goes straight to the oldest waiter when there is one,
//! and a new waiter is only queued when no message is buffered.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::stream::message::Message;

/// Receiving side of a queued waiter.
///
/// Resolves to `Some(message)` on delivery and `None` once the stream ends.
pub(crate) type Waiter = oneshot::Receiver<Option<Message>>;

#[derive(Debug, Default)]
pub(crate) struct MessageBuffer {
    buffered: VecDeque<Message>,
    waiters: VecDeque<oneshot::Sender<Option<Message>>>,
    ended: bool,
}

impl MessageBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hands `message` to the oldest live waiter, or buffers it.
    ///
    /// Waiters whose receiver was dropped are discarded so a cancelled `next`
    /// never swallows a message. Returns `false` if the stream already ended
    /// and the message was dropped.
    pub(crate) fn push(&mut self, message: Message) -> bool {
        if self.ended {
            return false;
        }
        let mut message = message;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(message)) {
                Ok(()) => return true,
                Err(returned) => {
                    message = match returned {
                        Some(returned) => returned,
                        None => return true,
                    };
                }
            }
        }
        self.buffered.push_back(message);
        true
    }

    /// Removes the oldest buffered message.
    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.buffered.pop_front()
    }

    /// Returns a message taken back from a cancelled waiter.
    ///
    /// It goes to the oldest live waiter, or to the front of the buffer. The
    /// message was accepted before any end, so it is kept even once ended.
    pub(crate) fn requeue_front(&mut self, message: Message) {
        let mut message = message;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(message)) {
                Ok(()) => return,
                Err(returned) => match returned {
                    Some(returned) => message = returned,
                    None => return,
                },
            }
        }
        self.buffered.push_front(message);
    }

    /// Queues a waiter. Only valid while nothing is buffered.
    ///
    /// Waiters whose receiver is already gone are pruned first, so repeated
    /// cancelled `next` calls on a quiet stream do not accumulate.
    pub(crate) fn wait(&mut self) -> Waiter {
        debug_assert!(self.buffered.is_empty());
        let (tx, rx) = oneshot::channel();
        if self.ended {
            let _ = tx.send(None);
        } else {
            self.waiters.retain(|waiter| !waiter.is_closed());
            self.waiters.push_back(tx);
        }
        rx
    }

    /// Ends the stream, resolving every pending waiter with `None`.
    ///
    /// Returns how many waiters were released.
    pub(crate) fn end(&mut self) -> usize {
        self.ended = true;
        let released = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(None);
        }
        released
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    #[cfg(test)]
    pub(crate) fn waiter_len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::MessageBuffer;
    use crate::stream::message::Message;

    fn text(value: &str) -> Message {
        Message::Text(value.to_string())
    }

    fn assert_exclusive(buffer: &MessageBuffer) {
        assert!(
            buffer.buffered_len() == 0 || buffer.waiter_len() == 0,
            "buffered={} waiters={}",
            buffer.buffered_len(),
            buffer.waiter_len()
        );
    }

    #[test]
    fn buffers_messages_without_waiters() {
        let mut buffer = MessageBuffer::new();
        buffer.push(text("a"));
        buffer.push(text("b"));
        assert_exclusive(&buffer);
        assert_eq!(buffer.pop(), Some(text("a")));
        assert_eq!(buffer.pop(), Some(text("b")));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn delivers_to_oldest_waiter_first() {
        let mut buffer = MessageBuffer::new();
        let mut first = buffer.wait();
        let mut second = buffer.wait();
        assert_exclusive(&buffer);

        buffer.push(text("a"));
        assert_exclusive(&buffer);
        buffer.push(text("b"));
        assert_exclusive(&buffer);
        buffer.push(text("c"));
        assert_exclusive(&buffer);

        assert_eq!(first.try_recv().expect("first"), Some(text("a")));
        assert_eq!(second.try_recv().expect("second"), Some(text("b")));
        assert_eq!(buffer.pop(), Some(text("c")));
    }

    #[test]
    fn skips_dropped_waiters() {
        let mut buffer = MessageBuffer::new();
        let cancelled = buffer.wait();
        let mut live = buffer.wait();
        drop(cancelled);

        buffer.push(text("a"));
        assert_eq!(live.try_recv().expect("live"), Some(text("a")));
        assert_eq!(buffer.waiter_len(), 0);

        let cancelled = buffer.wait();
        drop(cancelled);
        buffer.push(text("b"));
        assert_eq!(buffer.pop(), Some(text("b")));
    }

    #[test]
    fn cancelled_waiters_do_not_accumulate() {
        let mut buffer = MessageBuffer::new();
        for _ in 0..10_000 {
            drop(buffer.wait());
        }
        assert!(buffer.waiter_len() <= 1);

        let mut live = buffer.wait();
        assert_eq!(buffer.waiter_len(), 1);
        buffer.push(text("a"));
        assert_eq!(live.try_recv().expect("live"), Some(text("a")));
    }

    #[test]
    fn requeued_message_goes_to_next_waiter_or_front() {
        let mut buffer = MessageBuffer::new();
        let mut waiter = buffer.wait();
        buffer.requeue_front(text("a"));
        assert_eq!(waiter.try_recv().expect("waiter"), Some(text("a")));

        buffer.push(text("b"));
        buffer.requeue_front(text("a"));
        assert_eq!(buffer.pop(), Some(text("a")));
        assert_eq!(buffer.pop(), Some(text("b")));

        buffer.end();
        buffer.requeue_front(text("kept"));
        assert_eq!(buffer.pop(), Some(text("kept")));
    }

    #[test]
    fn end_releases_waiters_with_terminal_marker() {
        let mut buffer = MessageBuffer::new();
        let mut first = buffer.wait();
        let mut second = buffer.wait();

        assert_eq!(buffer.end(), 2);
        assert!(buffer.is_ended());
        assert_eq!(first.try_recv().expect("first"), None);
        assert_eq!(second.try_recv().expect("second"), None);

        let mut late = buffer.wait();
        assert_eq!(late.try_recv().expect("late"), None);
        assert_eq!(buffer.waiter_len(), 0);
        assert_eq!(buffer.end(), 0);
    }

    #[test]
    fn buffered_messages_survive_end_but_new_ones_are_dropped() {
        let mut buffer = MessageBuffer::new();
        assert!(buffer.push(text("kept")));
        buffer.end();
        assert!(!buffer.push(text("late")));
        assert_eq!(buffer.pop(), Some(text("kept")));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn interleaved_producer_and_consumer_keep_order() {
        enum Ticket {
            Ready(Message),
            Pending(super::Waiter),
        }

        fn next(buffer: &mut MessageBuffer) -> Ticket {
            match buffer.pop() {
                Some(message) => Ticket::Ready(message),
                None => Ticket::Pending(buffer.wait()),
            }
        }

        let mut buffer = MessageBuffer::new();
        let mut tickets = Vec::new();

        for round in 0..12 {
            if round % 3 == 0 {
                tickets.push(next(&mut buffer));
                tickets.push(next(&mut buffer));
                assert_exclusive(&buffer);
            }
            buffer.push(text(&round.to_string()));
            assert_exclusive(&buffer);
        }
        while buffer.buffered_len() > 0 {
            tickets.push(next(&mut buffer));
        }

        let received: Vec<Message> = tickets
            .into_iter()
            .map(|ticket| match ticket {
                Ticket::Ready(message) => message,
                Ticket::Pending(mut waiter) => {
                    waiter.try_recv().expect("resolved").expect("message")
                }
            })
            .collect();
        let expected: Vec<Message> = (0..12).map(|n| text(&n.to_string())).collect();
        assert_eq!(received, expected);
    }
}
