/// Host capabilities the consensus core depends on
///
/// The backend owns transport, block execution and the finalized chain.
/// It calls back into the core only by posting events.

use crate::crypto::{Address, Hash};
use crate::hotstuff::types::QuorumCert;
use crate::validator::ValidatorSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod events;

pub use events::{channel, Event, EventReceiver, EventSender};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Block timestamp is ahead of local time by the given skew
    #[error("Block is from the future by {0:?}")]
    FutureBlock(Duration),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// A block as seen by consensus
pub trait Proposal:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn number(&self) -> u64;
    fn hash(&self) -> Hash;
    fn parent_hash(&self) -> Hash;
    fn coinbase(&self) -> Address;
    /// Unix timestamp in seconds
    fn time(&self) -> u64;
}

pub trait Backend: Send + Sync + 'static {
    type Block: Proposal;
    /// Result of executing a block, handed back at commit
    type Executed: Send + Sync + 'static;

    fn address(&self) -> Address;

    /// Send to every validator in the set, including this node
    fn broadcast(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> Result<()>;

    /// Relay a message received from the proposer
    fn gossip(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> Result<()>;

    /// Send to the set's current proposer, which may be this node
    fn unicast(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> Result<()>;

    /// Structural check of a proposed block
    fn verify(&self, block: &Self::Block) -> Result<()>;

    /// Last finalized block and the proposer that sealed it
    fn last_proposal(&self) -> Option<(Self::Block, Address)>;

    fn execute_block(&self, block: &Self::Block) -> Result<Self::Executed>;

    /// Finalize an executed block under its commit QC
    fn commit(&self, executed: &Self::Executed, qc: &QuorumCert) -> Result<()>;
}
