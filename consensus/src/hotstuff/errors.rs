// Errors returned by the consensus handlers

use crate::backend::BackendError;
use crate::crypto::Address;
use crate::signer::SignerError;
use crate::storage::StorageError;
use thiserror::Error;

use super::message_set::MessageSetError;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Message from a future view or state")]
    FutureMessage,

    #[error("Message is more than one height ahead")]
    FarFutureMessage,

    #[error("Message from an old view or state")]
    OldMessage,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Signed by {signer}, claims {claimed}")]
    AddressMismatch { signer: Address, claimed: Address },

    #[error("Message is not from the round's proposer")]
    NotFromProposer,

    #[error("This node is not the round's proposer")]
    NotProposer,

    #[error("Vote does not match the current node")]
    InvalidVote,

    #[error("Invalid quorum certificate: {0}")]
    InvalidQC(String),

    #[error("Proposal is not safe to accept under the current lock")]
    SafetyViolation,

    #[error("Proposal does not extend the high QC")]
    ExtendViolation,

    #[error("Requested round is not ahead of the current round")]
    StaleRound,

    #[error("Backend has no finalized block")]
    NoLastProposal,

    #[error("No round in progress")]
    NoRoundState,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Vote aggregation error: {0}")]
    MessageSet(#[from] MessageSetError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

impl ConsensusError {
    /// Protocol-level rejections, logged at trace
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ConsensusError::FutureMessage
                | ConsensusError::FarFutureMessage
                | ConsensusError::OldMessage
                | ConsensusError::InvalidMessage(_)
                | ConsensusError::AddressMismatch { .. }
                | ConsensusError::NotFromProposer
                | ConsensusError::NotProposer
                | ConsensusError::InvalidVote
                | ConsensusError::InvalidQC(_)
                | ConsensusError::SafetyViolation
                | ConsensusError::ExtendViolation
                | ConsensusError::StaleRound
                | ConsensusError::Signer(_)
                | ConsensusError::Encoding(_)
        )
    }
}
