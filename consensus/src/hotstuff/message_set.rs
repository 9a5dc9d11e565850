// Per-phase message collection and vote aggregation

use super::types::{Message, QuorumCert, Vote};
use crate::crypto::Address;
use crate::signer::Signer;
use crate::validator::ValidatorSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageSetError {
    #[error("{0} is not a validator of this round")]
    UnauthorizedVoter(Address),

    #[error("No votes to aggregate")]
    InsufficientVotes,

    #[error("Vote from {0} does not match the expected vote")]
    InvalidVote(Address),

    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),
}

pub type Result<T> = std::result::Result<T, MessageSetError>;

/// Messages of one phase keyed by sender. A sender counts once; a later
/// message replaces the earlier one.
#[derive(Debug)]
pub struct MessageSet {
    valset: Arc<dyn ValidatorSet>,
    messages: BTreeMap<Address, Message>,
}

impl MessageSet {
    pub fn new(valset: Arc<dyn ValidatorSet>) -> Self {
        Self {
            valset,
            messages: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, msg: Message) -> Result<()> {
        if self.valset.get_by_address(&msg.address).is_none() {
            return Err(MessageSetError::UnauthorizedVoter(msg.address));
        }
        self.messages.insert(msg.address, msg);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.size() >= self.valset.q()
    }

    pub fn values(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Aggregate the stored votes into a QC.
    ///
    /// Every stored vote must equal `expected` in (code, view, digest).
    pub fn to_quorum_cert(
        &self,
        expected: &Vote,
        proposer: Address,
        signer: &dyn Signer,
    ) -> Result<QuorumCert> {
        if self.messages.is_empty() {
            return Err(MessageSetError::InsufficientVotes);
        }

        let mut shares = Vec::with_capacity(self.messages.len());
        for (address, msg) in &self.messages {
            let vote: Vote = msg
                .payload()
                .map_err(|_| MessageSetError::InvalidVote(*address))?;
            if !vote.matches(expected) {
                return Err(MessageSetError::InvalidVote(*address));
            }
            shares.push((*address, vote.signature));
        }

        let payload = expected.signing_payload();
        let aggregated = signer
            .bls_recover_agg_sig(self.valset.as_ref(), &payload, &shares)
            .map_err(|e| MessageSetError::AggregationFailed(e.to_string()))?;

        Ok(QuorumCert {
            view: expected.view,
            code: expected.code,
            node: expected.digest,
            proposer,
            vote_digest: Vote::canonical_digest(expected.code, expected.view, &expected.digest),
            signature: aggregated.signature,
            signers: aggregated.signers,
        })
    }
}
