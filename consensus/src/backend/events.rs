// Events posted into a node's consensus loop

use crate::crypto::{Address, Hash};
use crate::hotstuff::types::{Message, View};
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub enum Event<B> {
    /// A block to propose
    Request(B),

    /// Encoded consensus message from the transport
    Message { src: Address, payload: Vec<u8> },

    /// Replay of a message that was backlogged and is now current
    Backlog { src: Address, msg: Message },

    /// Round-change timer fired for `view`
    Timeout { view: View },

    /// A block was finalized outside this node's rounds
    FinalCommitted { number: u64, hash: Hash },
}

pub type EventSender<B> = mpsc::UnboundedSender<Event<B>>;
pub type EventReceiver<B> = mpsc::UnboundedReceiver<Event<B>>;

pub fn channel<B>() -> (EventSender<B>, EventReceiver<B>) {
    mpsc::unbounded_channel()
}
