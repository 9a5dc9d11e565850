// Commit phase: lockQC from PreCommitVotes; replicas lock on it

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::round_state::Lock;
use super::types::{Message, MessageType, QuorumCert, State};
use crate::backend::Backend;
use tracing::debug;

impl<Bk: Backend> Core<Bk> {
    /// Leader: aggregate PreCommitVotes into the lockQC and lock
    pub(crate) fn handle_pre_commit_vote(&mut self, msg: &Message) -> Result<()> {
        self.accept_vote(msg)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if rs.state != State::Prepared || !rs.pre_commit_votes.has_quorum() {
            return Ok(());
        }
        let qc = self.aggregate(MessageType::PreCommitVote)?;
        self.lock_on(qc.clone())?;

        self.persist();
        self.broadcast(MessageType::Commit, &qc)?;
        self.vote(MessageType::CommitVote, qc.node)?;
        self.drain_backlog();
        Ok(())
    }

    /// Replica: verify the lockQC, lock, persist and vote CommitVote
    pub(crate) fn handle_commit(&mut self, msg: &Message) -> Result<()> {
        self.check_message(MessageType::Commit, msg.view)?;
        if msg.address == self.address {
            return Ok(());
        }

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if !rs.is_proposer(&msg.address) {
            return Err(ConsensusError::NotFromProposer);
        }
        let qc: QuorumCert = msg.payload()?;
        self.verify_qc(msg, &qc)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if rs.state != State::Prepared {
            return Err(ConsensusError::OldMessage);
        }
        self.lock_on(qc.clone())?;

        self.persist();
        self.vote(MessageType::CommitVote, qc.node)?;
        self.drain_backlog();
        Ok(())
    }

    fn lock_on(&mut self, qc: QuorumCert) -> Result<()> {
        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        let node = rs.node.clone().ok_or(ConsensusError::NoRoundState)?;
        debug!(height = rs.view.height, round = rs.view.round, node = %qc.node, "Locked");
        rs.lock = Some(Lock {
            node,
            qc,
            proposal_locked: true,
        });
        rs.advance(State::PreCommitted);
        Ok(())
    }
}
