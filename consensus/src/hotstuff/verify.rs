// Certificate, vote and proposal-safety checks

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::types::{Message, MessageType, ProposedBlock, QuorumCert, View, Vote};
use crate::backend::{Backend, Proposal};

impl<Bk: Backend> Core<Bk> {
    /// Validate a QC carried by `msg`. Every failure is `InvalidQC`.
    pub(crate) fn verify_qc(&self, msg: &Message, qc: &QuorumCert) -> Result<()> {
        let invalid = |reason: &str| Err(ConsensusError::InvalidQC(reason.to_string()));

        if msg.code.expected_qc_code() != Some(qc.code) {
            return invalid("unexpected vote phase");
        }

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        match msg.code {
            // One block per height: a round-start certificate closes the
            // previous height, never the one being decided
            MessageType::NewView | MessageType::Prepare => {
                if msg.view.height.checked_sub(1) != Some(qc.view.height) {
                    return invalid("certificate is not for the previous height");
                }
                if qc.is_genesis() {
                    return Ok(());
                }
            }
            _ => {
                if qc.view != msg.view {
                    return invalid("certificate from another view");
                }
                if qc.proposer != rs.proposer() {
                    return invalid("certificate not assembled by the proposer");
                }
                if Some(qc.node) != rs.node_hash() {
                    return invalid("certificate for another node");
                }
            }
        }

        if qc.node.is_zero() || qc.proposer.is_zero() || qc.signature.is_empty() {
            return invalid("empty field");
        }
        if Vote::canonical_digest(qc.code, qc.view, &qc.node) != qc.vote_digest {
            return invalid("vote digest mismatch");
        }

        self.signer
            .verify_qc(rs.valset.as_ref(), qc)
            .map_err(|e| ConsensusError::InvalidQC(e.to_string()))
    }

    /// Authenticate a vote share and record it in its phase's set
    pub(crate) fn accept_vote(&mut self, msg: &Message) -> Result<()> {
        self.check_message(msg.code, msg.view)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if !rs.is_proposer(&self.address) {
            return Err(ConsensusError::NotProposer);
        }
        let digest = rs.node_hash().ok_or(ConsensusError::FutureMessage)?;

        let vote: Vote = msg.payload()?;
        if !vote.matches(&Vote::expected(msg.code, rs.view, digest)) {
            return Err(ConsensusError::InvalidVote);
        }
        self.signer.verify_share(
            rs.valset.as_ref(),
            &vote.signing_payload(),
            &vote.signature,
            &msg.address,
        )?;

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        let votes = match msg.code {
            MessageType::PrepareVote => &mut rs.prepare_votes,
            MessageType::PreCommitVote => &mut rs.pre_commit_votes,
            MessageType::CommitVote => &mut rs.commit_votes,
            _ => return Err(ConsensusError::InvalidMessage("not a vote".into())),
        };
        votes.add(msg.clone())?;
        Ok(())
    }

    /// Aggregate the current node's votes of phase `code` into a QC
    pub(crate) fn aggregate(&self, code: MessageType) -> Result<QuorumCert> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let digest = rs.node_hash().ok_or(ConsensusError::NoRoundState)?;
        let votes = match code {
            MessageType::PrepareVote => &rs.prepare_votes,
            MessageType::PreCommitVote => &rs.pre_commit_votes,
            MessageType::CommitVote => &rs.commit_votes,
            _ => return Err(ConsensusError::InvalidMessage("not a vote".into())),
        };
        let expected = Vote::expected(code, rs.view, digest);
        Ok(votes.to_quorum_cert(&expected, self.address, self.signer.as_ref())?)
    }

    /// A proposal is safe when nothing is locked, when it extends the
    /// locked node, or when its QC is newer than the lock. A lock taken at
    /// the proposal's own height admits only a re-proposal of that node.
    pub(crate) fn safe_node(
        &self,
        view: View,
        node: &ProposedBlock<Bk::Block>,
        high_qc: &QuorumCert,
    ) -> bool {
        let Some(lock) = self.current.as_ref().and_then(|rs| rs.lock.as_ref()) else {
            return true;
        };
        if lock.qc.view.height == view.height {
            return node.hash() == lock.qc.node;
        }
        node.parent == lock.qc.node || high_qc.view > lock.qc.view
    }

    /// Structural checks on a Prepare payload before any state changes
    pub(crate) fn check_proposal(
        &self,
        msg: &Message,
        node: &ProposedBlock<Bk::Block>,
        high_qc: &QuorumCert,
    ) -> Result<()> {
        if node.block.number() != msg.view.height {
            return Err(ConsensusError::InvalidMessage(format!(
                "block {} proposed at height {}",
                node.block.number(),
                msg.view.height
            )));
        }
        self.verify_qc(msg, high_qc)?;
        if node.parent != high_qc.node {
            return Err(ConsensusError::ExtendViolation);
        }
        if !self.safe_node(msg.view, node, high_qc) {
            return Err(ConsensusError::SafetyViolation);
        }
        Ok(())
    }
}
