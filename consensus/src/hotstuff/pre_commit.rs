// PreCommit phase: prepareQC from PrepareVotes

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::types::{Message, MessageType, QuorumCert, State};
use crate::backend::Backend;
use tracing::debug;

impl<Bk: Backend> Core<Bk> {
    /// Leader: aggregate PrepareVotes into the prepareQC
    pub(crate) fn handle_prepare_vote(&mut self, msg: &Message) -> Result<()> {
        self.accept_vote(msg)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if rs.state != State::HighQC || !rs.prepare_votes.has_quorum() {
            return Ok(());
        }
        let qc = self.aggregate(MessageType::PrepareVote)?;

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        debug!(height = rs.view.height, round = rs.view.round, node = %qc.node, "Prepare QC formed");
        rs.prepare_qc = Some(qc.clone());
        rs.advance(State::Prepared);

        self.persist();
        self.broadcast(MessageType::PreCommit, &qc)?;
        self.vote(MessageType::PreCommitVote, qc.node)?;
        self.drain_backlog();
        Ok(())
    }

    /// Replica: accept the prepareQC and vote PreCommitVote
    pub(crate) fn handle_pre_commit(&mut self, msg: &Message) -> Result<()> {
        self.check_message(MessageType::PreCommit, msg.view)?;
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
        if rs.state != State::HighQC {
            return Err(ConsensusError::OldMessage);
        }
        debug!(height = rs.view.height, round = rs.view.round, node = %qc.node, "Prepared");
        rs.prepare_qc = Some(qc.clone());
        rs.advance(State::Prepared);

        self.persist();
        self.vote(MessageType::PreCommitVote, qc.node)?;
        self.drain_backlog();
        Ok(())
    }
}
