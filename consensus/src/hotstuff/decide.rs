// Decide phase: commitQC from CommitVotes, then finalization

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::types::{Message, MessageType, QuorumCert, State};
use crate::backend::Backend;
use tracing::{info, warn};

impl<Bk: Backend> Core<Bk> {
    /// Leader: aggregate CommitVotes, broadcast Decide and commit
    pub(crate) fn handle_commit_vote(&mut self, msg: &Message) -> Result<()> {
        self.accept_vote(msg)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if rs.state != State::PreCommitted || !rs.commit_votes.has_quorum() {
            return Ok(());
        }
        let qc = self.aggregate(MessageType::CommitVote)?;

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        rs.commit_qc = Some(qc.clone());
        rs.advance(State::Committed);

        self.persist();
        self.broadcast(MessageType::Decide, &qc)?;
        self.finalize(qc)
    }

    /// Replica: verify the commitQC against the locked node and commit
    pub(crate) fn handle_decide(&mut self, msg: &Message) -> Result<()> {
        self.check_message(MessageType::Decide, msg.view)?;
        if msg.address == self.address {
            return Ok(());
        }

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if !rs.is_proposer(&msg.address) {
            return Err(ConsensusError::NotFromProposer);
        }
        let qc: QuorumCert = msg.payload()?;
        self.verify_qc(msg, &qc)?;

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        if rs.lock.as_ref().map(|l| l.qc.node) != Some(qc.node) {
            return Err(ConsensusError::InvalidQC("commit certificate is not for the locked node".into()));
        }
        if rs.state != State::PreCommitted {
            return Err(ConsensusError::OldMessage);
        }
        rs.commit_qc = Some(qc.clone());
        rs.advance(State::Committed);

        self.persist();
        self.finalize(qc)
    }

    /// Hand the executed block to the backend and move to the next height.
    /// On failure the round stays `Committed` until the timer fires.
    fn finalize(&mut self, qc: QuorumCert) -> Result<()> {
        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        let node = rs.node.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let executed = match rs.executed.take() {
            Some(executed) => executed,
            None => self.backend.execute_block(&node.block)?,
        };

        let view = rs.view;
        if let Err(e) = self.backend.commit(&executed, &qc) {
            warn!(height = view.height, round = view.round, error = %e, "Commit failed");
            rs.executed = Some(executed);
            return Err(e.into());
        }
        info!(height = view.height, round = view.round, node = %qc.node, "Committed block");

        self.start_new_round(0)
    }
}
