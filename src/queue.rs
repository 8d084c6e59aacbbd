//! Outbound queue: messages waiting for an open transport.
//!
//! Entries leave the queue only through [`OutboundQueue::drain_into`], and
//! only once the sink has accepted them. A rejected entry stays at the front
//! so the next open resumes from the same message.

use std::collections::VecDeque;

use frames::Message;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<Message>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    pub fn push(&mut self, message: Message) {
        self.pending.push_back(message);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hand queued messages to `sink` in FIFO order.
    ///
    /// Stops at the first message the sink rejects and keeps it queued.
    /// Returns the number of messages accepted.
    pub fn drain_into<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let mut sent = 0;
        while let Some(front) = self.pending.front() {
            if !sink(front) {
                break;
            }
            self.pending.pop_front();
            sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(queue: &mut OutboundQueue) -> Vec<String> {
        let mut out = Vec::new();
        queue.drain_into(|m| {
            out.push(m.kind.clone());
            true
        });
        out
    }

    #[test]
    fn drains_in_insertion_order() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new("a", json!(1)));
        queue.push(Message::new("b", json!(2)));
        queue.push(Message::new("c", json!(3)));

        assert_eq!(kinds(&mut queue), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn rejected_message_stays_at_front() {
        let mut queue = OutboundQueue::new();
        queue.push(Message::new("a", json!(1)));
        queue.push(Message::new("b", json!(2)));
        queue.push(Message::new("c", json!(3)));

        let mut budget = 1;
        let sent = queue.drain_into(|_| {
            if budget == 0 {
                return false;
            }
            budget -= 1;
            true
        });

        assert_eq!(sent, 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(kinds(&mut queue), vec!["b", "c"]);
    }

    #[test]
    fn empty_queue_sends_nothing() {
        let mut queue = OutboundQueue::new();
        assert_eq!(queue.drain_into(|_| true), 0);
    }
}
