// Backlog of messages that arrived before this node could process them

use super::types::{Admission, Message, View};
use crate::crypto::Address;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

/// Ordering key: earliest (height, round, phase) first, then arrival
type Priority = (u64, u64, u8, u64);

#[derive(Debug)]
struct Entry {
    priority: Priority,
    msg: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Per-sender priority queues
#[derive(Debug)]
pub struct Backlog {
    queues: HashMap<Address, BinaryHeap<Reverse<Entry>>>,
    arrivals: u64,
    max_per_validator: usize,
}

impl Backlog {
    pub fn new(max_per_validator: usize) -> Self {
        Self {
            queues: HashMap::new(),
            arrivals: 0,
            max_per_validator,
        }
    }

    /// Park a message for later.
    ///
    /// Messages without a sender, more than one height ahead of `local`, or
    /// beyond the sender's quota are dropped.
    pub fn push(&mut self, msg: Message, local: View) {
        if msg.address.is_zero() {
            return;
        }
        if local.admit(&msg.view) == Admission::FarFuture {
            trace!(height = msg.view.height, round = msg.view.round, "Not backlogging far-future message");
            return;
        }

        let queue = self.queues.entry(msg.address).or_default();
        if queue.len() >= self.max_per_validator {
            trace!(from = %msg.address, "Backlog full for sender, dropping message");
            return;
        }

        self.arrivals += 1;
        let priority = (msg.view.height, msg.view.round, msg.code.ordinal(), self.arrivals);
        trace!(from = %msg.address, code = %msg.code, height = msg.view.height, round = msg.view.round, "Backlogged message");
        queue.push(Reverse(Entry { priority, msg }));
    }

    /// Pop every message that `classify` now treats as current.
    ///
    /// For each sender, messages are popped in priority order: old ones are
    /// dropped, current ones returned, and the first future one is put back,
    /// which stops that sender.
    pub fn drain<F>(&mut self, mut classify: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> Admission,
    {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            while let Some(Reverse(entry)) = queue.pop() {
                match classify(&entry.msg) {
                    Admission::Future | Admission::FarFuture => {
                        queue.push(Reverse(entry));
                        break;
                    }
                    Admission::Old => continue,
                    Admission::Current => ready.push(entry.msg),
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        ready
    }

    /// Total backlogged messages
    pub fn len(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::types::MessageType;
    use proptest::prelude::*;

    fn msg(from: u8, code: MessageType, height: u64, round: u64) -> Message {
        Message::new(code, View::new(height, round), Address::new([from; 20]), vec![])
    }

    #[test]
    fn test_zero_address_ignored() {
        let mut backlog = Backlog::new(16);
        backlog.push(msg(0, MessageType::Prepare, 2, 0), View::new(1, 0));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_far_future_ignored() {
        let mut backlog = Backlog::new(16);
        backlog.push(msg(1, MessageType::Prepare, 3, 0), View::new(1, 0));
        assert!(backlog.is_empty());
        backlog.push(msg(1, MessageType::Prepare, 2, 7), View::new(1, 0));
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn test_quota_per_sender() {
        let mut backlog = Backlog::new(2);
        for round in 1..5 {
            backlog.push(msg(1, MessageType::NewView, 1, round), View::new(1, 0));
        }
        backlog.push(msg(2, MessageType::NewView, 1, 1), View::new(1, 0));
        assert_eq!(backlog.len(), 3);
    }

    #[test]
    fn test_drain_order_and_stop_at_future() {
        let mut backlog = Backlog::new(16);
        let local = View::new(1, 0);
        backlog.push(msg(1, MessageType::Commit, 1, 1), local);
        backlog.push(msg(1, MessageType::PreCommit, 1, 1), local);
        backlog.push(msg(1, MessageType::Prepare, 2, 0), local);
        backlog.push(msg(1, MessageType::Prepare, 1, 1), local);

        // Now at (1, 1): everything at round 1 is current, height 2 is future
        let now = View::new(1, 1);
        let ready = backlog.drain(|m| now.admit(&m.view));
        let codes: Vec<_> = ready.iter().map(|m| m.code).collect();
        assert_eq!(codes, vec![MessageType::Prepare, MessageType::PreCommit, MessageType::Commit]);
        assert_eq!(backlog.len(), 1);

        // Draining again yields nothing new
        assert!(backlog.drain(|m| now.admit(&m.view)).is_empty());
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn test_old_messages_dropped_on_drain() {
        let mut backlog = Backlog::new(16);
        backlog.push(msg(1, MessageType::PrepareVote, 1, 1), View::new(1, 0));
        backlog.push(msg(2, MessageType::PrepareVote, 2, 0), View::new(1, 0));

        let now = View::new(2, 0);
        let ready = backlog.drain(|m| now.admit(&m.view));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].address, Address::new([2; 20]));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_rounds_beyond_nine_keep_order() {
        let mut backlog = Backlog::new(16);
        let local = View::new(1, 0);
        backlog.push(msg(1, MessageType::NewView, 1, 12), local);
        backlog.push(msg(1, MessageType::Decide, 1, 11), local);

        let ready = backlog.drain(|_| Admission::Current);
        assert_eq!(ready[0].view.round, 11);
        assert_eq!(ready[1].view.round, 12);
    }

    #[test]
    fn test_bound_holds_under_flood() {
        let mut backlog = Backlog::new(8);
        let local = View::new(10, 0);
        for i in 0..1000u64 {
            let from = (i % 4) as u8 + 1;
            backlog.push(msg(from, MessageType::PrepareVote, 10 + i % 3, i), local);
        }
        assert!(backlog.len() <= 4 * 8);
    }

    proptest! {
        #[test]
        fn prop_drain_is_ordered_per_sender(
            pushes in prop::collection::vec((1u8..5, 0u64..2, 0u64..20, 0usize..8), 0..200)
        ) {
            let codes = [
                MessageType::NewView,
                MessageType::Prepare,
                MessageType::PrepareVote,
                MessageType::PreCommit,
                MessageType::PreCommitVote,
                MessageType::Commit,
                MessageType::CommitVote,
                MessageType::Decide,
            ];
            let local = View::new(5, 0);
            let mut backlog = Backlog::new(32);
            for (from, dh, round, code) in pushes {
                backlog.push(msg(from, codes[code], 5 + dh, round), local);
            }
            prop_assert!(backlog.len() <= 4 * 32);

            let ready = backlog.drain(|_| Admission::Current);
            for from in 1u8..5 {
                let keys: Vec<_> = ready
                    .iter()
                    .filter(|m| m.address == Address::new([from; 20]))
                    .map(|m| (m.view, m.code.ordinal()))
                    .collect();
                prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
            }
            prop_assert!(backlog.is_empty());
        }
    }
}
