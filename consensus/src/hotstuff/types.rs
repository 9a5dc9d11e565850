// Core HotStuff types: views, round states, tree nodes, votes and QCs

use crate::backend::Proposal;
use crate::crypto::{hash_concat, hash_data_with, Address, Hash, HashFunction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Position of a round: block height, then round within the height
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct View {
    pub height: u64,
    pub round: u64,
}

/// Where a message's view sits relative to the local view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Old,
    Current,
    Future,
    /// More than one height ahead; never backlogged
    FarFuture,
}

impl View {
    pub fn new(height: u64, round: u64) -> Self {
        Self { height, round }
    }

    /// Signed (Δheight, Δround) of `self` relative to `other`
    pub fn sub(&self, other: &View) -> (i128, i128) {
        (
            self.height as i128 - other.height as i128,
            self.round as i128 - other.round as i128,
        )
    }

    /// Classify a message view against this (local) view
    pub fn admit(&self, msg_view: &View) -> Admission {
        let (dh, dr) = msg_view.sub(self);
        match dh.cmp(&0) {
            Ordering::Greater if dh > 1 => Admission::FarFuture,
            Ordering::Greater => Admission::Future,
            Ordering::Less => Admission::Old,
            Ordering::Equal => match dr.cmp(&0) {
                Ordering::Greater => Admission::Future,
                Ordering::Equal => Admission::Current,
                Ordering::Less => Admission::Old,
            },
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.height, self.round)
    }
}

/// Progress of one round. Only moves forward within a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum State {
    #[default]
    AcceptRequest = 1,
    HighQC = 2,
    Prepared = 3,
    PreCommitted = 4,
    Committed = 5,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::AcceptRequest => "AcceptRequest",
            State::HighQC => "HighQC",
            State::Prepared => "Prepared",
            State::PreCommitted => "PreCommitted",
            State::Committed => "Committed",
        };
        f.write_str(name)
    }
}

/// Message types in HotStuff protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    NewView = 1,
    Prepare = 2,
    PrepareVote = 3,
    PreCommit = 4,
    PreCommitVote = 5,
    Commit = 6,
    CommitVote = 7,
    Decide = 8,
}

impl MessageType {
    /// Phase ordinal, used to order backlogged messages within a view
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn is_vote(self) -> bool {
        matches!(
            self,
            MessageType::PrepareVote | MessageType::PreCommitVote | MessageType::CommitVote
        )
    }

    /// Vote phase a QC must carry when attached to a message of this type
    pub fn expected_qc_code(self) -> Option<MessageType> {
        match self {
            MessageType::NewView | MessageType::Prepare | MessageType::PreCommit => {
                Some(MessageType::PrepareVote)
            }
            MessageType::Commit => Some(MessageType::PreCommitVote),
            MessageType::Decide => Some(MessageType::CommitVote),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Signed consensus envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub code: MessageType,
    pub view: View,
    pub address: Address,
    /// bincode-encoded phase payload
    pub msg: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    pub fn new(code: MessageType, view: View, address: Address, msg: Vec<u8>) -> Self {
        Self {
            code,
            view,
            address,
            msg,
            signature: Vec::new(),
        }
    }

    /// Bytes covered by the envelope signature (everything but the signature)
    pub fn signing_payload(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(&(&self.code, &self.view, &self.address, &self.msg))
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decode the phase payload
    pub fn payload<T: DeserializeOwned>(&self) -> bincode::Result<T> {
        bincode::deserialize(&self.msg)
    }
}

/// A validator's vote on a tree node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub code: MessageType,
    pub view: View,
    /// Hash of the voted ProposedBlock
    pub digest: Hash,
    /// BLS share over the canonical vote payload
    pub signature: Vec<u8>,
}

impl Vote {
    /// Unsigned vote, used as the expected value when aggregating
    pub fn expected(code: MessageType, view: View, digest: Hash) -> Self {
        Self {
            code,
            view,
            digest,
            signature: Vec::new(),
        }
    }

    /// Canonical bytes every validator signs for a vote:
    /// code || height (BE) || round (BE) || digest
    pub fn canonical_payload(code: MessageType, view: View, digest: &Hash) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + 32);
        out.push(code.ordinal());
        out.extend_from_slice(&view.height.to_be_bytes());
        out.extend_from_slice(&view.round.to_be_bytes());
        out.extend_from_slice(digest.as_bytes());
        out
    }

    /// SHA-256 of the canonical payload, carried in QCs
    pub fn canonical_digest(code: MessageType, view: View, digest: &Hash) -> Hash {
        hash_data_with(&Self::canonical_payload(code, view, digest), HashFunction::Sha256)
    }

    pub fn signing_payload(&self) -> Vec<u8> {
        Self::canonical_payload(self.code, self.view, &self.digest)
    }

    /// Same (code, view, digest), ignoring the signature
    pub fn matches(&self, other: &Vote) -> bool {
        self.code == other.code && self.view == other.view && self.digest == other.digest
    }
}

/// Quorum Certificate: an aggregated signature proving at least Q validators
/// signed the same vote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    pub view: View,
    /// Vote phase that was aggregated
    pub code: MessageType,
    /// Certified ProposedBlock hash
    pub node: Hash,
    /// Leader that assembled the certificate
    pub proposer: Address,
    /// SHA-256 of the canonical vote payload covered by `signature`
    pub vote_digest: Hash,
    pub signature: Vec<u8>,
    /// Sorted validator indices whose shares were aggregated
    pub signers: Vec<u32>,
}

impl QuorumCert {
    /// Certificate for the genesis node; trusted without a signature
    pub fn genesis(node: Hash) -> Self {
        let view = View::default();
        Self {
            view,
            code: MessageType::PrepareVote,
            node,
            proposer: Address::zero(),
            vote_digest: Vote::canonical_digest(MessageType::PrepareVote, view, &node),
            signature: Vec::new(),
            signers: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.view.height == 0
    }
}

/// Tree node: a block together with the node it extends
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedBlock<B> {
    pub parent: Hash,
    pub block: B,
}

impl<B: Proposal> ProposedBlock<B> {
    pub fn new(parent: Hash, block: B) -> Self {
        Self { parent, block }
    }

    /// Genesis node wraps the genesis block under a zero parent
    pub fn genesis(block: B) -> Self {
        Self::new(Hash::zero(), block)
    }

    /// Identity: hash(parent || block hash)
    pub fn hash(&self) -> Hash {
        hash_concat(&[self.parent.as_bytes(), self.block.hash().as_bytes()])
    }
}

/// Prepare payload: the leader's proposal and the QC it extends
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreparePayload<B> {
    pub view: View,
    pub node: ProposedBlock<B>,
    pub high_qc: QuorumCert,
}

/// Snapshot of a node's progress, published by the engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundStatus {
    pub view: View,
    pub state: State,
    pub proposer: Address,
    pub is_proposer: bool,
    pub locked: bool,
}
