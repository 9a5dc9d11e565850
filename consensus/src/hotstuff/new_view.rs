// NewView phase: the leader collects round-start certificates

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::types::{Message, MessageType, QuorumCert, State};
use crate::backend::Backend;
use tracing::debug;

impl<Bk: Backend> Core<Bk> {
    pub(crate) fn handle_new_view(&mut self, msg: &Message) -> Result<()> {
        self.check_message(MessageType::NewView, msg.view)?;

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if !rs.is_proposer(&self.address) {
            return Err(ConsensusError::NotProposer);
        }

        let qc: QuorumCert = msg.payload()?;
        self.verify_qc(msg, &qc)?;

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        rs.new_views.add(msg.clone())?;
        if rs.state != State::AcceptRequest || !rs.new_views.has_quorum() {
            return Ok(());
        }

        let high_qc = rs
            .new_views
            .values()
            .filter_map(|m| m.payload::<QuorumCert>().ok())
            .max_by_key(|qc| qc.view);
        let Some(high_qc) = high_qc else {
            return Ok(());
        };

        debug!(
            height = rs.view.height,
            round = rs.view.round,
            qc_height = high_qc.view.height,
            qc_round = high_qc.view.round,
            "NewView quorum reached"
        );
        rs.high_qc = Some(high_qc);
        rs.advance(State::HighQC);

        self.persist();
        self.try_send_prepare()?;
        self.drain_backlog();
        Ok(())
    }
}
